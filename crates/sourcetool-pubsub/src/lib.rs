//! Pub/sub backbone used by relay replicas to reach connections they do not own.
//!
//! Messages travel as an [`Envelope`] of `(target id, payload)`. Delivery is
//! at-most-once and unordered across channels; a subscriber that cannot decode
//! an envelope logs it and moves on.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

mod local;
mod redis_backend;

pub use local::LocalPubSub;
pub use redis_backend::RedisPubSub;

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("envelope codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type PubSubResult<T> = Result<T, PubSubError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    pub fn encode(&self) -> PubSubResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> PubSubResult<Self> {
        Ok(bincode::deserialize(raw)?)
    }
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, id: &str, payload: Bytes) -> PubSubResult<()>;

    /// Starts delivering envelopes published on `channel` until `cancel` fires
    /// or the backend subscription fails.
    async fn subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> PubSubResult<Subscription>;
}

/// Receiving half of a channel subscription.
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<Envelope>,
}

impl Subscription {
    fn channel_pair(channel: &str) -> (mpsc::Sender<Envelope>, Self) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (
            tx,
            Self {
                channel: channel.to_string(),
                rx,
            },
        )
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next envelope, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// Decodes one raw frame and hands it to the subscriber. Returns `false` once
/// the subscriber has gone away.
async fn forward(channel: &str, raw: &[u8], tx: &mpsc::Sender<Envelope>) -> bool {
    match Envelope::decode(raw) {
        Ok(envelope) => tx.send(envelope).await.is_ok(),
        Err(err) => {
            warn!(channel, error = %err, "dropping undecodable pubsub envelope");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_keeps_target_and_payload() {
        let envelope = Envelope::new("host-1", Bytes::from_static(b"\x00\x01frame"));
        let raw = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&raw).unwrap(), envelope);
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let raw = Envelope::new("client-9", Bytes::from_static(b"payload"))
            .encode()
            .unwrap();
        assert!(Envelope::decode(&raw[..raw.len() - 3]).is_err());
    }
}
