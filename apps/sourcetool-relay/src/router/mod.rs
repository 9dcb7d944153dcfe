//! Protocol router: decodes inbound frames and runs the handshake and relay
//! handlers for each payload variant.

use std::sync::Arc;

use sourcetool_proto::{decode_frame, encode_frame, Message, Payload};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{RelayError, RelayResult, Severity};
use crate::group_pages::GroupPageCapability;
use crate::metrics::HANDLER_ERRORS;
use crate::persistence::Persistence;
use crate::registry::{PeerKind, Registry};

mod client;
mod host;

/// Identity established when the socket was authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Host {
        organization_id: Uuid,
        api_key_id: Uuid,
        instance_id: Uuid,
    },
    Client {
        organization_id: Uuid,
        user_id: Uuid,
    },
}

impl Peer {
    pub fn organization_id(&self) -> Uuid {
        match self {
            Peer::Host {
                organization_id, ..
            }
            | Peer::Client {
                organization_id, ..
            } => *organization_id,
        }
    }

    pub fn kind(&self) -> PeerKind {
        match self {
            Peer::Host { .. } => PeerKind::Host,
            Peer::Client { .. } => PeerKind::Client,
        }
    }
}

#[derive(Clone)]
pub struct ProtocolRouter {
    registry: Registry,
    persistence: Arc<dyn Persistence>,
    group_pages: Arc<dyn GroupPageCapability>,
}

impl ProtocolRouter {
    pub fn new(
        registry: Registry,
        persistence: Arc<dyn Persistence>,
        group_pages: Arc<dyn GroupPageCapability>,
    ) -> Self {
        Self {
            registry,
            persistence,
            group_pages,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handles one inbound frame. Errors are answered with an `Exception` on
    /// `conn`; nothing here ends the connection.
    pub async fn handle_frame(&self, peer: &Peer, conn: &Arc<dyn Connection>, frame: &[u8]) {
        let message = match decode_frame(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(peer = %peer.kind(), error = %err, "undecodable frame");
                let err = RelayError::protocol(format!("malformed frame: {err}"));
                self.report(conn, &Message::default(), &err).await;
                return;
            }
        };
        let Some(payload) = message.payload.as_ref() else {
            warn!(peer = %peer.kind(), id = %message.id, "ignoring frame with unknown payload");
            return;
        };
        debug!(peer = %peer.kind(), id = %message.id, kind = payload.kind(), "frame received");

        let result = match (peer, payload) {
            (
                Peer::Host {
                    organization_id,
                    instance_id,
                    ..
                },
                Payload::InitializeHost(init),
            ) => {
                self.initialize_host(*organization_id, *instance_id, conn, &message.id, init)
                    .await
            }
            (Peer::Host { .. }, Payload::RenderWidget(render)) => {
                self.relay_to_client(peer, &message, &render.session_id).await
            }
            (Peer::Host { .. }, Payload::ScriptFinished(finished)) => {
                self.relay_quietly(peer, &message, &finished.session_id).await;
                Ok(())
            }
            (Peer::Host { .. }, Payload::Exception(exception)) => {
                self.relay_quietly(peer, &message, &exception.session_id).await;
                Ok(())
            }
            (
                Peer::Client {
                    organization_id,
                    user_id,
                },
                Payload::InitializeClient(init),
            ) => {
                self.initialize_client(*organization_id, *user_id, conn, &message.id, init)
                    .await
            }
            (Peer::Client { .. }, Payload::RerunPage(rerun)) => {
                self.rerun_page(peer, &message, rerun).await
            }
            (Peer::Client { .. }, Payload::CloseSession(close)) => {
                self.close_session(peer, &message, close).await
            }
            (peer, payload) => Err(RelayError::protocol(format!(
                "{} is not accepted from a {}",
                payload.kind(),
                peer.kind()
            ))),
        };

        if let Err(err) = result {
            self.report(conn, &message, &err).await;
        }
    }

    /// Host-to-client relays whose failures are only logged.
    async fn relay_quietly(&self, peer: &Peer, message: &Message, session_id: &str) {
        if let Err(err) = self.relay_to_client(peer, message, session_id).await {
            warn!(
                kind = message.kind(),
                session_id,
                error = %err,
                "relay to client failed"
            );
        }
    }

    async fn report(&self, conn: &Arc<dyn Connection>, message: &Message, err: &RelayError) {
        HANDLER_ERRORS.with_label_values(&[err.kind()]).inc();
        match err.severity() {
            Severity::Client => {
                warn!(id = %message.id, kind = message.kind(), error = %err, "handler rejected frame")
            }
            Severity::Server => {
                error!(id = %message.id, kind = message.kind(), error = %err, "handler failed")
            }
        }
        let reply = Message::with_id(
            message.id.clone(),
            Payload::Exception(err.to_exception(message.session_id())),
        );
        if let Err(send_err) = conn.send_binary(encode_frame(&reply)).await {
            debug!(error = %send_err, "could not deliver exception reply");
        }
    }
}

pub(crate) fn parse_id(value: &str, field: &str) -> RelayResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| RelayError::protocol(format!("{field} is not a valid id: {value:?}")))
}
