//! Process-local table of live host and client connections.
//!
//! Entries are keyed by host-instance id and session id. Every registration
//! owns a `done` token (a child of its connection's shutdown token) that stops
//! the liveness task paired with it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use sourcetool_proto::{encode_frame, Message};
use sourcetool_pubsub::PubSub;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionError};
use crate::error::{RelayError, RelayResult};
use crate::liveness::{self, LivenessConfig};
use crate::metrics::{CONNECTED, PUBSUB_FALLBACKS, RELAYED};
use crate::model::{ApiKey, HostInstance, Session};
use crate::persistence::Persistence;

pub const HOST_CHANNEL: &str = "sourcetool:relay:host";
pub const CLIENT_CHANNEL: &str = "sourcetool:relay:client";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKind {
    Host,
    Client,
}

impl PeerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerKind::Host => "host",
            PeerKind::Client => "client",
        }
    }

    pub fn channel(self) -> &'static str {
        match self {
            PeerKind::Host => HOST_CHANNEL,
            PeerKind::Client => CLIENT_CHANNEL,
        }
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct ConnectedHost {
    pub host_instance: HostInstance,
    pub api_key: ApiKey,
    pub conn: Arc<dyn Connection>,
    done: CancellationToken,
    generation: u64,
}

#[derive(Clone)]
pub struct ConnectedClient {
    pub session: Session,
    pub conn: Arc<dyn Connection>,
    done: CancellationToken,
    generation: u64,
}

/// Entries dropped because their socket went away.
#[derive(Default)]
pub struct Released {
    pub hosts: Vec<Uuid>,
    pub sessions: Vec<Uuid>,
}

struct RegistryInner {
    hosts: DashMap<Uuid, ConnectedHost>,
    clients: DashMap<Uuid, ConnectedClient>,
    persistence: Arc<dyn Persistence>,
    pubsub: Option<Arc<dyn PubSub>>,
    liveness: LivenessConfig,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        pubsub: Option<Arc<dyn PubSub>>,
        liveness: LivenessConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hosts: DashMap::new(),
                clients: DashMap::new(),
                persistence,
                pubsub,
                liveness,
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn persistence(&self) -> Arc<dyn Persistence> {
        Arc::clone(&self.inner.persistence)
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        self.inner.liveness
    }

    pub fn has_bridge(&self) -> bool {
        self.inner.pubsub.is_some()
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a host connection, tearing down any previous registration for
    /// the same host instance first, and starts its liveness task.
    pub async fn set_connected_host(
        &self,
        host_instance: HostInstance,
        api_key: ApiKey,
        conn: Arc<dyn Connection>,
    ) {
        let id = host_instance.id;
        let generation = self.next_generation();
        let done = conn.shutdown().child_token();
        let entry = ConnectedHost {
            host_instance,
            api_key,
            conn: Arc::clone(&conn),
            done: done.clone(),
            generation,
        };
        let previous = self.inner.hosts.insert(id, entry);
        match previous {
            Some(previous) => {
                previous.done.cancel();
                if previous.conn.id() != conn.id() {
                    info!(host_instance_id = %id, "superseding previous host connection");
                    previous.conn.close().await;
                }
            }
            None => CONNECTED.with_label_values(&["host"]).inc(),
        }
        liveness::spawn(self.clone(), PeerKind::Host, id, conn, done, generation);
        debug!(host_instance_id = %id, generation, "host registered");
    }

    /// Client counterpart of [`Registry::set_connected_host`].
    pub async fn set_connected_client(&self, session: Session, conn: Arc<dyn Connection>) {
        let id = session.id;
        let generation = self.next_generation();
        let done = conn.shutdown().child_token();
        let entry = ConnectedClient {
            session,
            conn: Arc::clone(&conn),
            done: done.clone(),
            generation,
        };
        let previous = self.inner.clients.insert(id, entry);
        match previous {
            Some(previous) => {
                previous.done.cancel();
                if previous.conn.id() != conn.id() {
                    info!(session_id = %id, "superseding previous client connection");
                    previous.conn.close().await;
                }
            }
            None => CONNECTED.with_label_values(&["client"]).inc(),
        }
        liveness::spawn(self.clone(), PeerKind::Client, id, conn, done, generation);
        debug!(session_id = %id, generation, "client registered");
    }

    pub async fn send_to_host(&self, host_instance_id: Uuid, message: &Message) -> RelayResult<()> {
        let conn = self
            .inner
            .hosts
            .get(&host_instance_id)
            .map(|entry| Arc::clone(&entry.conn));
        self.deliver(
            PeerKind::Host,
            host_instance_id,
            conn,
            encode_frame(message),
            message.kind(),
        )
        .await
    }

    pub async fn send_to_client(&self, session_id: Uuid, message: &Message) -> RelayResult<()> {
        let conn = self
            .inner
            .clients
            .get(&session_id)
            .map(|entry| Arc::clone(&entry.conn));
        self.deliver(
            PeerKind::Client,
            session_id,
            conn,
            encode_frame(message),
            message.kind(),
        )
        .await
    }

    async fn deliver(
        &self,
        kind: PeerKind,
        id: Uuid,
        conn: Option<Arc<dyn Connection>>,
        frame: Bytes,
        message_kind: &'static str,
    ) -> RelayResult<()> {
        if let Some(conn) = conn {
            match conn.send_binary(frame.clone()).await {
                Ok(()) => {
                    RELAYED.with_label_values(&[message_kind]).inc();
                    return Ok(());
                }
                Err(err) if self.inner.pubsub.is_none() => return Err(err.into()),
                Err(err) => {
                    warn!(target_kind = %kind, id = %id, error = %err, "local write failed; publishing instead");
                }
            }
        }
        let Some(pubsub) = &self.inner.pubsub else {
            return Err(RelayError::not_found(format!("{kind} {id}")));
        };
        pubsub
            .publish(kind.channel(), &id.to_string(), frame)
            .await
            .map_err(|err| RelayError::unavailable(format!("publish to {kind} {id} failed: {err}")))?;
        PUBSUB_FALLBACKS.with_label_values(&[kind.channel()]).inc();
        RELAYED.with_label_values(&[message_kind]).inc();
        debug!(target_kind = %kind, id = %id, kind = message_kind, "published to bridge");
        Ok(())
    }

    /// Writes a frame received from the bridge to a local connection. Returns
    /// false when the target is not registered here or the write failed.
    pub async fn deliver_local(&self, kind: PeerKind, id: &str, frame: Bytes) -> bool {
        let Ok(id) = Uuid::parse_str(id) else {
            warn!(target_kind = %kind, id, "bridge envelope with malformed id");
            return false;
        };
        let conn = match kind {
            PeerKind::Host => self.inner.hosts.get(&id).map(|e| Arc::clone(&e.conn)),
            PeerKind::Client => self.inner.clients.get(&id).map(|e| Arc::clone(&e.conn)),
        };
        let Some(conn) = conn else {
            return false;
        };
        match conn.send_binary(frame).await {
            Ok(()) => true,
            Err(err) => {
                warn!(target_kind = %kind, id = %id, error = %err, "bridge delivery failed");
                false
            }
        }
    }

    /// Synchronous liveness probe for a locally registered host.
    pub async fn ping_connected_host(&self, host_instance_id: Uuid) -> RelayResult<()> {
        let conn = self
            .inner
            .hosts
            .get(&host_instance_id)
            .map(|entry| Arc::clone(&entry.conn))
            .ok_or_else(|| RelayError::not_found(format!("host {host_instance_id}")))?;
        let write_wait = self.inner.liveness.write_wait;
        match tokio::time::timeout(write_wait, conn.ping()).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(ConnectionError::Timeout(write_wait).into()),
        }
    }

    /// Closes the host's socket and stops its liveness task. Persisted status is untouched.
    pub async fn disconnect_host(&self, host_instance_id: Uuid) {
        if let Some((_, entry)) = self.inner.hosts.remove(&host_instance_id) {
            CONNECTED.with_label_values(&["host"]).dec();
            entry.done.cancel();
            entry.conn.close().await;
            debug!(host_instance_id = %host_instance_id, "host disconnected");
        }
    }

    /// Closes the client's socket and stops its liveness task. Persisted state is untouched.
    pub async fn disconnect_client(&self, session_id: Uuid) {
        if let Some((_, entry)) = self.inner.clients.remove(&session_id) {
            CONNECTED.with_label_values(&["client"]).dec();
            entry.done.cancel();
            entry.conn.close().await;
            debug!(session_id = %session_id, "client disconnected");
        }
    }

    /// Drops the client entry and its liveness task but leaves the socket open.
    pub fn evict_client(&self, session_id: Uuid) -> bool {
        match self.inner.clients.remove(&session_id) {
            Some((_, entry)) => {
                CONNECTED.with_label_values(&["client"]).dec();
                entry.done.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes every entry still bound to connection `conn_id`.
    pub fn release_connection(&self, conn_id: u64) -> Released {
        let mut released = Released::default();
        let hosts: Vec<Uuid> = self
            .inner
            .hosts
            .iter()
            .filter(|entry| entry.conn.id() == conn_id)
            .map(|entry| *entry.key())
            .collect();
        for id in hosts {
            if let Some((_, entry)) = self
                .inner
                .hosts
                .remove_if(&id, |_, entry| entry.conn.id() == conn_id)
            {
                CONNECTED.with_label_values(&["host"]).dec();
                entry.done.cancel();
                released.hosts.push(id);
            }
        }
        let sessions: Vec<Uuid> = self
            .inner
            .clients
            .iter()
            .filter(|entry| entry.conn.id() == conn_id)
            .map(|entry| *entry.key())
            .collect();
        for id in sessions {
            if let Some((_, entry)) = self
                .inner
                .clients
                .remove_if(&id, |_, entry| entry.conn.id() == conn_id)
            {
                CONNECTED.with_label_values(&["client"]).dec();
                entry.done.cancel();
                released.sessions.push(id);
            }
        }
        released
    }

    /// Removes the host entry only if it still belongs to registration `generation`.
    pub(crate) fn remove_host_if_current(&self, id: Uuid, generation: u64) -> bool {
        let removed = self
            .inner
            .hosts
            .remove_if(&id, |_, entry| entry.generation == generation);
        if removed.is_some() {
            CONNECTED.with_label_values(&["host"]).dec();
        }
        removed.is_some()
    }

    pub(crate) fn remove_client_if_current(&self, id: Uuid, generation: u64) -> bool {
        let removed = self
            .inner
            .clients
            .remove_if(&id, |_, entry| entry.generation == generation);
        if removed.is_some() {
            CONNECTED.with_label_values(&["client"]).dec();
        }
        removed.is_some()
    }

    pub fn connected_host(&self, host_instance_id: Uuid) -> Option<ConnectedHost> {
        self.inner
            .hosts
            .get(&host_instance_id)
            .map(|entry| entry.value().clone())
    }

    pub fn connected_client(&self, session_id: Uuid) -> Option<ConnectedClient> {
        self.inner
            .clients
            .get(&session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn is_host_connected(&self, host_instance_id: Uuid) -> bool {
        self.inner.hosts.contains_key(&host_instance_id)
    }

    pub fn is_client_connected(&self, session_id: Uuid) -> bool {
        self.inner.clients.contains_key(&session_id)
    }

    pub fn host_count(&self) -> usize {
        self.inner.hosts.len()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sourcetool_proto::{decode_frame, Payload, RenderWidget, Widget};
    use sourcetool_pubsub::LocalPubSub;

    use super::*;
    use crate::connection::MemoryConnection;
    use crate::model::HostInstanceStatus;
    use crate::persistence::InMemoryPersistence;

    fn registry(pubsub: Option<Arc<dyn PubSub>>) -> Registry {
        Registry::new(InMemoryPersistence::new(), pubsub, LivenessConfig::default())
    }

    fn host(id: Uuid) -> (HostInstance, ApiKey) {
        let org = Uuid::new_v4();
        let key = ApiKey {
            id: Uuid::new_v4(),
            organization_id: org,
            environment_id: Uuid::new_v4(),
            name: "dev".into(),
            key: "key_dev".into(),
        };
        let host = HostInstance {
            id,
            organization_id: org,
            api_key_id: key.id,
            sdk_name: "sourcetool-go".into(),
            sdk_version: "0.1.0".into(),
            status: HostInstanceStatus::Online,
        };
        (host, key)
    }

    fn session(id: Uuid) -> Session {
        Session {
            id,
            organization_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    fn render(session_id: Uuid) -> Message {
        Message::with_id(
            "m-1",
            Payload::RenderWidget(RenderWidget {
                session_id: session_id.to_string(),
                page_id: Uuid::new_v4().to_string(),
                path: vec![1, 2],
                widget: Some(Widget {
                    id: "w".into(),
                    kind: "button".into(),
                    state: vec![7, 7, 7],
                }),
            }),
        )
    }

    #[tokio::test]
    async fn second_registration_supersedes_the_first() {
        let registry = registry(None);
        let id = Uuid::new_v4();
        let (instance, key) = host(id);
        let (first, _first_rx) = MemoryConnection::new();
        let (second, _second_rx) = MemoryConnection::new();

        registry
            .set_connected_host(instance.clone(), key.clone(), first.clone())
            .await;
        let first_done = registry.connected_host(id).unwrap().done;
        registry
            .set_connected_host(instance, key, second.clone())
            .await;

        assert_eq!(registry.host_count(), 1);
        assert!(first.is_closed());
        assert!(first_done.is_cancelled());
        assert!(!second.is_closed());
        assert_eq!(registry.connected_host(id).unwrap().conn.id(), second.id());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let registry = registry(None);
        let id = Uuid::new_v4();
        let (instance, key) = host(id);
        let (conn, _rx) = MemoryConnection::new();
        registry.set_connected_host(instance, key, conn.clone()).await;

        registry.disconnect_host(id).await;
        registry.disconnect_host(id).await;
        assert_eq!(conn.close_count(), 1);
        assert!(!registry.is_host_connected(id));
    }

    #[tokio::test]
    async fn local_delivery_is_byte_identical() {
        let registry = registry(None);
        let id = Uuid::new_v4();
        let (conn, mut rx) = MemoryConnection::new();
        registry.set_connected_client(session(id), conn).await;

        let message = render(id);
        registry.send_to_client(id, &message).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame, encode_frame(&message));
        assert_eq!(decode_frame(&frame).unwrap(), message);
    }

    #[tokio::test]
    async fn unknown_target_without_bridge_is_not_found() {
        let registry = registry(None);
        let err = registry
            .send_to_client(Uuid::new_v4(), &render(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_target_is_published_when_bridged() {
        let bus = Arc::new(LocalPubSub::new());
        let cancel = CancellationToken::new();
        let mut sub = bus.subscribe(CLIENT_CHANNEL, cancel.clone()).await.unwrap();
        let registry = registry(Some(bus.clone() as Arc<dyn PubSub>));

        let id = Uuid::new_v4();
        let message = render(id);
        registry.send_to_client(id, &message).await.unwrap();
        let envelope = sub.recv().await.unwrap();
        assert_eq!(envelope.id, id.to_string());
        assert_eq!(envelope.payload, encode_frame(&message));
        cancel.cancel();
    }

    #[tokio::test]
    async fn evicted_client_keeps_its_socket() {
        let registry = registry(None);
        let id = Uuid::new_v4();
        let (conn, _rx) = MemoryConnection::new();
        registry.set_connected_client(session(id), conn.clone()).await;

        assert!(registry.evict_client(id));
        assert!(!registry.evict_client(id));
        assert!(!conn.is_closed());
        let err = registry.send_to_client(id, &render(id)).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn release_only_touches_entries_of_that_connection() {
        let registry = registry(None);
        let (shared, _rx) = MemoryConnection::new();
        let (other, _other_rx) = MemoryConnection::new();
        let host_id = Uuid::new_v4();
        let (instance, key) = host(host_id);
        registry.set_connected_host(instance, key, shared.clone()).await;
        let mine = Uuid::new_v4();
        let theirs = Uuid::new_v4();
        registry.set_connected_client(session(mine), shared.clone()).await;
        registry.set_connected_client(session(theirs), other).await;

        let released = registry.release_connection(shared.id());
        assert_eq!(released.hosts, vec![host_id]);
        assert_eq!(released.sessions, vec![mine]);
        assert!(registry.is_client_connected(theirs));
        assert_eq!(registry.host_count(), 0);
    }
}
