use std::sync::Arc;

use sourcetool_pubsub::{PubSub, PubSubResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{PeerKind, Registry};

const INGEST_KINDS: &[PeerKind] = &[PeerKind::Host, PeerKind::Client];

/// Subscribes to the host and client channels and writes each envelope to the
/// matching local connection. Envelopes for targets owned elsewhere are dropped.
pub async fn start_bridge_ingest(
    pubsub: Arc<dyn PubSub>,
    registry: Registry,
    cancel: CancellationToken,
) -> PubSubResult<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(INGEST_KINDS.len());
    for &kind in INGEST_KINDS {
        let mut sub = pubsub.subscribe(kind.channel(), cancel.child_token()).await?;
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            info!(channel = sub.channel(), "bridge ingest started");
            while let Some(envelope) = sub.recv().await {
                if registry
                    .deliver_local(kind, &envelope.id, envelope.payload)
                    .await
                {
                    debug!(target_kind = %kind, id = %envelope.id, "bridge frame delivered");
                }
            }
            warn!(channel = sub.channel(), "bridge ingest stopped");
        }));
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;
    use sourcetool_pubsub::LocalPubSub;
    use uuid::Uuid;

    use super::*;
    use crate::connection::MemoryConnection;
    use crate::liveness::LivenessConfig;
    use crate::model::Session;
    use crate::persistence::InMemoryPersistence;
    use crate::registry::CLIENT_CHANNEL;

    #[tokio::test]
    async fn envelopes_reach_local_clients_only() {
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let registry = Registry::new(
            InMemoryPersistence::new(),
            Some(Arc::clone(&bus)),
            LivenessConfig::default(),
        );
        let session = Session {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let (conn, mut rx) = MemoryConnection::new();
        registry.set_connected_client(session.clone(), conn).await;

        let cancel = CancellationToken::new();
        let handles = start_bridge_ingest(Arc::clone(&bus), registry, cancel.clone())
            .await
            .unwrap();

        bus.publish(CLIENT_CHANNEL, &Uuid::new_v4().to_string(), Bytes::from_static(b"elsewhere"))
            .await
            .unwrap();
        bus.publish(CLIENT_CHANNEL, &session.id.to_string(), Bytes::from_static(b"mine"))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Bytes::from_static(b"mine"));

        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
