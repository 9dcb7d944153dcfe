use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::connection::{Connection, WsConnection};
use crate::liveness;
use crate::router::Peer;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let peer = match state.authenticator().authenticate(&headers).await {
        Ok(peer) => peer,
        Err(err) => {
            warn!(error = %err, "rejecting websocket upgrade");
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| serve_socket(socket, peer, state))
}

/// Reads frames in arrival order and hands each to the router before reading
/// the next. On exit every registry entry bound to the socket is released.
async fn serve_socket(socket: WebSocket, peer: Peer, state: AppState) {
    let (sink, mut stream) = socket.split();
    let conn: Arc<dyn Connection> = WsConnection::new(sink, state.write_wait());
    let closed = conn.shutdown().clone();
    let router = state.router().clone();
    info!(connection_id = conn.id(), peer = %peer.kind(), organization_id = %peer.organization_id(), "websocket connected");

    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            _ = state.shutdown().cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Binary(frame))) => router.handle_frame(&peer, &conn, &frame).await,
            Some(Ok(Message::Text(_))) => {
                warn!(connection_id = conn.id(), "ignoring text frame");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(connection_id = conn.id(), error = %err, "websocket read failed");
                break;
            }
        }
    }

    let registry = router.registry();
    let released = registry.release_connection(conn.id());
    for host_instance_id in &released.hosts {
        liveness::mark_host_unreachable(registry, *host_instance_id).await;
    }
    conn.close().await;
    info!(
        connection_id = conn.id(),
        hosts = released.hosts.len(),
        sessions = released.sessions.len(),
        "websocket disconnected"
    );
}
