use std::sync::Arc;

use sourcetool_proto::{encode_frame, InitializeHost, InitializeHostCompleted, Message, Payload};
use tracing::info;
use uuid::Uuid;

use super::{parse_id, Peer, ProtocolRouter};
use crate::connection::Connection;
use crate::error::{RelayError, RelayResult};
use crate::liveness::set_status;
use crate::model::{HostInstance, HostInstanceStatus, Page};
use crate::reconcile::diff_pages;

impl ProtocolRouter {
    /// Registers a host, reconciles its declared pages in one transaction and
    /// acknowledges with `InitializeHostCompleted`.
    pub(super) async fn initialize_host(
        &self,
        organization_id: Uuid,
        instance_id: Uuid,
        conn: &Arc<dyn Connection>,
        request_id: &str,
        init: &InitializeHost,
    ) -> RelayResult<()> {
        let mut tx = self.persistence.begin().await?;
        let api_key = tx
            .get_api_key_by_key(&init.api_key)
            .await?
            .ok_or_else(|| RelayError::not_found("api key"))?;
        if api_key.organization_id != organization_id {
            return Err(RelayError::authorization(
                "api key belongs to another organization",
            ));
        }

        let declared = init
            .pages
            .iter()
            .map(|page| -> RelayResult<Page> {
                Ok(Page {
                    id: parse_id(&page.id, "page id")?,
                    organization_id: api_key.organization_id,
                    environment_id: api_key.environment_id,
                    api_key_id: api_key.id,
                    name: page.name.clone(),
                    route: page.route.clone(),
                    path: page.path.clone(),
                })
            })
            .collect::<RelayResult<Vec<_>>>()?;

        let host = match tx.get_host_instance(instance_id).await? {
            Some(mut host) => {
                if host.organization_id != organization_id {
                    return Err(RelayError::authorization(
                        "host instance belongs to another organization",
                    ));
                }
                host.api_key_id = api_key.id;
                host.sdk_name = init.sdk_name.clone();
                host.sdk_version = init.sdk_version.clone();
                host.status = HostInstanceStatus::Online;
                tx.update_host_instance(&host).await?;
                host
            }
            None => {
                let host = HostInstance {
                    id: instance_id,
                    organization_id,
                    api_key_id: api_key.id,
                    sdk_name: init.sdk_name.clone(),
                    sdk_version: init.sdk_version.clone(),
                    status: HostInstanceStatus::Online,
                };
                tx.create_host_instance(&host).await?;
                host
            }
        };

        let existing = tx.list_pages(api_key.id).await?;
        let diff = diff_pages(&existing, &declared)?;
        if !diff.deleted.is_empty() {
            self.group_pages
                .before_pages_deleted(tx.as_mut(), &diff.deleted)
                .await?;
            tx.bulk_delete_pages(&diff.deleted).await?;
        }
        if !diff.inserted.is_empty() {
            tx.bulk_insert_pages(&diff.inserted).await?;
        }
        if !diff.updated.is_empty() {
            tx.bulk_update_pages(&diff.updated).await?;
        }
        tx.commit().await?;
        info!(
            host_instance_id = %host.id,
            sdk = %host.sdk_name,
            sdk_version = %host.sdk_version,
            inserted = diff.inserted.len(),
            updated = diff.updated.len(),
            deleted = diff.deleted.len(),
            "host initialized"
        );

        let host_instance_id = host.id;
        self.registry
            .set_connected_host(host, api_key, Arc::clone(conn))
            .await;
        // a demotion for the previous socket may have landed since the commit
        set_status(
            self.persistence.as_ref(),
            host_instance_id,
            HostInstanceStatus::Online,
        )
        .await?;
        let reply = Message::with_id(
            request_id,
            Payload::InitializeHostCompleted(InitializeHostCompleted {
                host_instance_id: host_instance_id.to_string(),
            }),
        );
        conn.send_binary(encode_frame(&reply)).await?;
        Ok(())
    }

    /// Forwards a host frame to the client owning `session_id`.
    pub(super) async fn relay_to_client(
        &self,
        peer: &Peer,
        message: &Message,
        session_id: &str,
    ) -> RelayResult<()> {
        let session_id = parse_id(session_id, "session_id")?;
        let session = {
            let mut tx = self.persistence.begin().await?;
            let session = tx.get_session(session_id).await?;
            session
        }
        .ok_or_else(|| RelayError::not_found(format!("session {session_id}")))?;
        if session.organization_id != peer.organization_id() {
            return Err(RelayError::authorization(
                "session belongs to another organization",
            ));
        }
        self.registry.send_to_client(session_id, message).await
    }
}
