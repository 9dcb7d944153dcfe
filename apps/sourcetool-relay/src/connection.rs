use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("write failed: {0}")]
    Write(String),
}

/// Write half of a peer socket. Writes are serialized per connection, so a
/// relayed frame and a liveness ping never interleave.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> u64;

    async fn send_binary(&self, frame: Bytes) -> Result<(), ConnectionError>;

    /// Sends a protocol-level ping control frame.
    async fn ping(&self) -> Result<(), ConnectionError>;

    /// Closes the socket. Calling it again is a no-op.
    async fn close(&self);

    /// Cancelled once the connection is closed; stops the socket's read loop.
    fn shutdown(&self) -> &CancellationToken;
}

pub struct WsConnection {
    id: u64,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    write_wait: Duration,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl WsConnection {
    pub fn new(sink: SplitSink<WebSocket, Message>, write_wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: next_connection_id(),
            sink: Mutex::new(sink),
            write_wait,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    async fn write(&self, message: Message) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        // the deadline covers waiting for the sink as well as the write itself
        let result = tokio::time::timeout(self.write_wait, async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ConnectionError::Write(err.to_string())),
            Err(_) => Err(ConnectionError::Timeout(self.write_wait)),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send_binary(&self, frame: Bytes) -> Result<(), ConnectionError> {
        self.write(Message::Binary(frame.to_vec())).await
    }

    async fn ping(&self) -> Result<(), ConnectionError> {
        self.write(Message::Ping(Vec::new())).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let _ = tokio::time::timeout(self.write_wait, async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        })
        .await;
        debug!(connection_id = self.id, "websocket closed");
    }

    fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// In-process connection that records outbound frames. Used to drive the
/// registry and router without sockets.
pub struct MemoryConnection {
    id: u64,
    frames: mpsc::UnboundedSender<Bytes>,
    fail_pings: AtomicBool,
    closed: AtomicBool,
    closes: AtomicUsize,
    pings: AtomicUsize,
    shutdown: CancellationToken,
}

impl MemoryConnection {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (frames, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: next_connection_id(),
            frames,
            fail_pings: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });
        (conn, rx)
    }

    /// Makes every following ping fail, as if the peer vanished.
    pub fn fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send_binary(&self, frame: Bytes) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.frames.send(frame).map_err(|_| ConnectionError::Closed)
    }

    async fn ping(&self) -> Result<(), ConnectionError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if self.fail_pings.load(Ordering::SeqCst) {
            return Err(ConnectionError::Write("peer did not accept ping".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}
