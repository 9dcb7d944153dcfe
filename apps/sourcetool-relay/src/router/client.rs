use std::sync::Arc;

use chrono::Utc;
use sourcetool_proto::{
    encode_frame, CloseSession, InitializeClient, InitializeClientCompleted, Message, Payload,
    RerunPage,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{parse_id, Peer, ProtocolRouter};
use crate::connection::Connection;
use crate::error::{RelayError, RelayResult};
use crate::liveness::set_status;
use crate::model::{HostInstance, HostInstanceStatus, Session, SessionHostInstance};

impl ProtocolRouter {
    /// Binds a browser to a reachable host for the requested page, creating or
    /// reusing its session, and forwards the handshake to that host.
    pub(super) async fn initialize_client(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        conn: &Arc<dyn Connection>,
        request_id: &str,
        init: &InitializeClient,
    ) -> RelayResult<()> {
        let page_id = parse_id(&init.page_id, "page_id")?;
        let requested_session = init
            .session_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| parse_id(id, "session_id"))
            .transpose()?;

        let (page, api_key, candidates) = {
            let mut tx = self.persistence.begin().await?;
            let page = tx
                .get_page(page_id)
                .await?
                .ok_or_else(|| RelayError::not_found(format!("page {page_id}")))?;
            if page.organization_id != organization_id {
                return Err(RelayError::authorization(
                    "page belongs to another organization",
                ));
            }
            if !self
                .group_pages
                .authorize_page(tx.as_mut(), user_id, page.id)
                .await?
            {
                return Err(RelayError::authorization("page is not shared with this user"));
            }
            let api_key = tx
                .get_api_key(page.api_key_id)
                .await?
                .ok_or_else(|| RelayError::not_found("api key"))?;
            let candidates = tx.list_host_instances(api_key.id).await?;
            (page, api_key, candidates)
        };

        let host = self
            .select_host(candidates)
            .await
            .ok_or_else(|| RelayError::unavailable(format!("no reachable host for page {page_id}")))?;

        let mut tx = self.persistence.begin().await?;
        let session = match requested_session {
            Some(session_id) => {
                let session = tx
                    .get_session(session_id)
                    .await?
                    .ok_or_else(|| RelayError::not_found(format!("session {session_id}")))?;
                if session.organization_id != organization_id || session.user_id != user_id {
                    return Err(RelayError::authorization(
                        "session belongs to another user",
                    ));
                }
                let bindings = tx.list_session_host_instances(session_id).await?;
                if bindings.last().map(|b| b.host_instance_id) != Some(host.id) {
                    tx.create_session_host_instance(&SessionHostInstance {
                        session_id,
                        host_instance_id: host.id,
                        created_at: Utc::now(),
                    })
                    .await?;
                }
                session
            }
            None => {
                let session = Session {
                    id: Uuid::new_v4(),
                    organization_id,
                    user_id,
                    environment_id: api_key.environment_id,
                    created_at: Utc::now(),
                };
                tx.create_session(&session).await?;
                tx.create_session_host_instance(&SessionHostInstance {
                    session_id: session.id,
                    host_instance_id: host.id,
                    created_at: session.created_at,
                })
                .await?;
                session
            }
        };
        tx.commit().await?;

        let session_id = session.id;
        info!(session_id = %session_id, host_instance_id = %host.id, page_id = %page.id, "client initialized");
        self.registry
            .set_connected_client(session, Arc::clone(conn))
            .await;
        let reply = Message::with_id(
            request_id,
            Payload::InitializeClientCompleted(InitializeClientCompleted {
                session_id: session_id.to_string(),
            }),
        );
        conn.send_binary(encode_frame(&reply)).await?;

        let forward = Message::with_id(
            request_id,
            Payload::InitializeClient(InitializeClient {
                session_id: Some(session_id.to_string()),
                page_id: page.id.to_string(),
            }),
        );
        self.registry.send_to_host(host.id, &forward).await
    }

    /// First reachable host in stored order. Local hosts are re-pinged and their
    /// stored status follows the result; hosts owned by another replica are
    /// trusted only if their stored status is online.
    async fn select_host(&self, candidates: Vec<HostInstance>) -> Option<HostInstance> {
        for mut host in candidates {
            if self.registry.is_host_connected(host.id) {
                match self.registry.ping_connected_host(host.id).await {
                    Ok(()) => {
                        if host.status != HostInstanceStatus::Online {
                            self.record_status(host.id, HostInstanceStatus::Online).await;
                            host.status = HostInstanceStatus::Online;
                        }
                        return Some(host);
                    }
                    Err(err) => {
                        debug!(host_instance_id = %host.id, error = %err, "host failed re-ping");
                        if host.status == HostInstanceStatus::Online {
                            self.record_status(host.id, HostInstanceStatus::Unreachable)
                                .await;
                        }
                    }
                }
            } else if self.registry.has_bridge() && host.status == HostInstanceStatus::Online {
                return Some(host);
            }
        }
        None
    }

    async fn record_status(&self, host_instance_id: Uuid, status: HostInstanceStatus) {
        if let Err(err) = set_status(self.persistence.as_ref(), host_instance_id, status).await {
            warn!(
                host_instance_id = %host_instance_id,
                status = status.as_str(),
                error = %err,
                "failed to persist host status"
            );
        }
    }

    /// Forwards a rerun to the session's current host.
    pub(super) async fn rerun_page(
        &self,
        peer: &Peer,
        message: &Message,
        rerun: &RerunPage,
    ) -> RelayResult<()> {
        let session_id = parse_id(&rerun.session_id, "session_id")?;
        let page_id = parse_id(&rerun.page_id, "page_id")?;

        let host = {
            let mut tx = self.persistence.begin().await?;
            let session = tx
                .get_session(session_id)
                .await?
                .ok_or_else(|| RelayError::not_found(format!("session {session_id}")))?;
            authorize_session(peer, &session)?;
            let page = tx
                .get_page(page_id)
                .await?
                .filter(|page| {
                    page.organization_id == session.organization_id
                        && page.environment_id == session.environment_id
                })
                .ok_or_else(|| RelayError::not_found(format!("page {page_id}")))?;
            let binding = tx
                .list_session_host_instances(session.id)
                .await?
                .pop()
                .ok_or_else(|| RelayError::not_found(format!("host for session {session_id}")))?;
            let host = tx
                .get_host_instance(binding.host_instance_id)
                .await?
                .ok_or_else(|| {
                    RelayError::not_found(format!("host instance {}", binding.host_instance_id))
                })?;
            if host.api_key_id != page.api_key_id {
                return Err(RelayError::not_found(format!("page {page_id}")));
            }
            host
        };
        if host.status != HostInstanceStatus::Online {
            return Err(RelayError::unavailable(format!(
                "host instance {} is {}",
                host.id,
                host.status.as_str()
            )));
        }
        self.registry.send_to_host(host.id, message).await
    }

    /// Deletes the session, tells every host that served it, and drops the
    /// client entry. The browser socket stays open.
    pub(super) async fn close_session(
        &self,
        peer: &Peer,
        message: &Message,
        close: &CloseSession,
    ) -> RelayResult<()> {
        let session_id = parse_id(&close.session_id, "session_id")?;
        let mut tx = self.persistence.begin().await?;
        let session = tx
            .get_session(session_id)
            .await?
            .ok_or_else(|| RelayError::not_found(format!("session {session_id}")))?;
        authorize_session(peer, &session)?;
        let mut hosts: Vec<Uuid> = Vec::new();
        for binding in tx.list_session_host_instances(session_id).await? {
            if !hosts.contains(&binding.host_instance_id) {
                hosts.push(binding.host_instance_id);
            }
        }
        tx.delete_session(session_id).await?;
        tx.commit().await?;

        for host_instance_id in hosts {
            if let Err(err) = self.registry.send_to_host(host_instance_id, message).await {
                warn!(
                    session_id = %session_id,
                    host_instance_id = %host_instance_id,
                    error = %err,
                    "could not notify host of closed session"
                );
            }
        }
        self.registry.evict_client(session_id);
        info!(session_id = %session_id, "session closed");
        Ok(())
    }
}

fn authorize_session(peer: &Peer, session: &Session) -> RelayResult<()> {
    match peer {
        Peer::Client {
            organization_id,
            user_id,
        } if session.organization_id == *organization_id && session.user_id == *user_id => Ok(()),
        _ => Err(RelayError::authorization("session belongs to another user")),
    }
}
