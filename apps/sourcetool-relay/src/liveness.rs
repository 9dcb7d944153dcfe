//! Periodic ping task paired with each registry entry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionError};
use crate::metrics::PING_FAILURES;
use crate::model::HostInstanceStatus;
use crate::persistence::{Persistence, PersistenceResult};
use crate::registry::{PeerKind, Registry};

pub const PING_PERIOD: Duration = Duration::from_secs(30);
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub ping_period: Duration,
    pub write_wait: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_period: PING_PERIOD,
            write_wait: WRITE_WAIT,
        }
    }
}

pub(crate) fn spawn(
    registry: Registry,
    kind: PeerKind,
    id: Uuid,
    conn: Arc<dyn Connection>,
    done: CancellationToken,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(run(registry, kind, id, conn, done, generation))
}

async fn run(
    registry: Registry,
    kind: PeerKind,
    id: Uuid,
    conn: Arc<dyn Connection>,
    done: CancellationToken,
    generation: u64,
) {
    let LivenessConfig {
        ping_period,
        write_wait,
    } = registry.liveness_config();
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => {
                debug!(peer = %kind, id = %id, "liveness stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let result = match tokio::time::timeout(write_wait, conn.ping()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(write_wait)),
        };
        let Err(err) = result else {
            continue;
        };
        if done.is_cancelled() {
            // disconnected while the ping was in flight
            return;
        }

        PING_FAILURES.with_label_values(&[kind.as_str()]).inc();
        warn!(peer = %kind, id = %id, error = %err, "ping failed; evicting");
        match kind {
            PeerKind::Host => {
                if registry.remove_host_if_current(id, generation) {
                    mark_host_unreachable(&registry, id).await;
                }
            }
            PeerKind::Client => {
                if registry.remove_client_if_current(id, generation) {
                    delete_session(registry.persistence().as_ref(), id).await;
                }
            }
        }
        done.cancel();
        conn.close().await;
        return;
    }
}

enum Demotion {
    Marked,
    Reconnected,
    Missing,
}

/// Best-effort status flip for a host whose socket went away. A host that has
/// already registered again keeps its stored status. Failures are logged and
/// swallowed.
pub async fn mark_host_unreachable(registry: &Registry, host_instance_id: Uuid) {
    match demote_host(registry, host_instance_id).await {
        Ok(Demotion::Marked) => info!(host_instance_id = %host_instance_id, "host marked unreachable"),
        Ok(Demotion::Reconnected) => {
            debug!(host_instance_id = %host_instance_id, "host registered again; keeping status")
        }
        Ok(Demotion::Missing) => debug!(host_instance_id = %host_instance_id, "host instance not stored"),
        Err(err) => {
            warn!(host_instance_id = %host_instance_id, error = %err, "failed to persist unreachable status")
        }
    }
}

async fn demote_host(registry: &Registry, host_instance_id: Uuid) -> PersistenceResult<Demotion> {
    let persistence = registry.persistence();
    let mut tx = persistence.begin().await?;
    // checked inside the transaction; a handshake registering after this
    // point re-asserts Online once its own write lands
    if registry.is_host_connected(host_instance_id) {
        return Ok(Demotion::Reconnected);
    }
    let Some(mut host) = tx.get_host_instance(host_instance_id).await? else {
        return Ok(Demotion::Missing);
    };
    if host.status != HostInstanceStatus::Unreachable {
        host.status = HostInstanceStatus::Unreachable;
        tx.update_host_instance(&host).await?;
        tx.commit().await?;
    }
    Ok(Demotion::Marked)
}

pub(crate) async fn set_status(
    persistence: &dyn Persistence,
    host_instance_id: Uuid,
    status: HostInstanceStatus,
) -> PersistenceResult<bool> {
    let mut tx = persistence.begin().await?;
    let Some(mut host) = tx.get_host_instance(host_instance_id).await? else {
        return Ok(false);
    };
    if host.status != status {
        host.status = status;
        tx.update_host_instance(&host).await?;
        tx.commit().await?;
    }
    Ok(true)
}

async fn delete_session(persistence: &dyn Persistence, session_id: Uuid) {
    let result = async {
        let mut tx = persistence.begin().await?;
        tx.delete_session(session_id).await?;
        tx.commit().await
    }
    .await;
    match result {
        Ok(()) => info!(session_id = %session_id, "session deleted after ping failure"),
        Err(err) => warn!(session_id = %session_id, error = %err, "failed to delete session"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use test_timeout::tokio_timeout_test;

    use super::*;
    use crate::connection::MemoryConnection;
    use crate::model::{ApiKey, HostInstance, Session};
    use crate::persistence::InMemoryPersistence;

    async fn stored_host(store: &InMemoryPersistence) -> (HostInstance, ApiKey) {
        let key = ApiKey {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            name: "dev".into(),
            key: "key_live".into(),
        };
        let host = HostInstance {
            id: Uuid::new_v4(),
            organization_id: key.organization_id,
            api_key_id: key.id,
            sdk_name: "sourcetool-go".into(),
            sdk_version: "0.1.0".into(),
            status: HostInstanceStatus::Online,
        };
        store.seed_api_key(key.clone()).await;
        let mut tx = store.begin().await.unwrap();
        tx.create_host_instance(&host).await.unwrap();
        tx.commit().await.unwrap();
        (host, key)
    }

    async fn stored_session(store: &InMemoryPersistence) -> Session {
        let session = Session {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let mut tx = store.begin().await.unwrap();
        tx.create_session(&session).await.unwrap();
        tx.commit().await.unwrap();
        session
    }

    /// Lets spawned tasks run until they park on timers again.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio_timeout_test(10, paused)]
    async fn failed_ping_marks_host_unreachable_and_evicts() {
        let store = InMemoryPersistence::new();
        let registry = Registry::new(store.clone(), None, LivenessConfig::default());
        let (host, key) = stored_host(&store).await;
        let (conn, _rx) = MemoryConnection::new();
        registry.set_connected_host(host.clone(), key, conn.clone()).await;

        tokio::time::sleep(PING_PERIOD + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(conn.ping_count(), 1);
        assert!(registry.is_host_connected(host.id));

        conn.fail_pings(true);
        tokio::time::sleep(PING_PERIOD).await;
        settle().await;

        assert!(!registry.is_host_connected(host.id));
        assert!(conn.is_closed());
        let stored = store.host_instance(host.id).await.unwrap();
        assert_eq!(stored.status, HostInstanceStatus::Unreachable);
    }

    #[tokio_timeout_test(10, paused)]
    async fn failed_ping_deletes_the_client_session() {
        let store = InMemoryPersistence::new();
        let registry = Registry::new(store.clone(), None, LivenessConfig::default());
        let session = stored_session(&store).await;
        let (conn, _rx) = MemoryConnection::new();
        conn.fail_pings(true);
        registry.set_connected_client(session.clone(), conn.clone()).await;

        tokio::time::sleep(PING_PERIOD + Duration::from_millis(10)).await;
        settle().await;

        assert!(!registry.is_client_connected(session.id));
        assert!(store.session(session.id).await.is_none());
    }

    #[tokio_timeout_test(10, paused)]
    async fn explicit_disconnect_stops_pinging_without_side_effects() {
        let store = InMemoryPersistence::new();
        let registry = Registry::new(store.clone(), None, LivenessConfig::default());
        let (host, key) = stored_host(&store).await;
        let (conn, _rx) = MemoryConnection::new();
        registry.set_connected_host(host.clone(), key, conn.clone()).await;

        registry.disconnect_host(host.id).await;
        tokio::time::sleep(PING_PERIOD * 3).await;
        settle().await;

        assert_eq!(conn.ping_count(), 0);
        let stored = store.host_instance(host.id).await.unwrap();
        assert_eq!(stored.status, HostInstanceStatus::Online);
    }

    #[tokio_timeout_test(10, paused)]
    async fn superseded_task_does_not_evict_its_successor() {
        let store = InMemoryPersistence::new();
        let registry = Registry::new(store.clone(), None, LivenessConfig::default());
        let (host, key) = stored_host(&store).await;
        let (old, _old_rx) = MemoryConnection::new();
        let (new, _new_rx) = MemoryConnection::new();
        old.fail_pings(true);
        registry.set_connected_host(host.clone(), key.clone(), old.clone()).await;
        registry.set_connected_host(host.clone(), key, new.clone()).await;

        tokio::time::sleep(PING_PERIOD + Duration::from_millis(10)).await;
        settle().await;

        assert_eq!(old.ping_count(), 0);
        assert_eq!(new.ping_count(), 1);
        assert!(registry.is_host_connected(host.id));
        assert_eq!(
            store.host_instance(host.id).await.unwrap().status,
            HostInstanceStatus::Online
        );
    }
}
