//! Persistence adapter consumed by the relay.
//!
//! Every store operation runs inside a [`Transaction`] obtained from
//! [`Persistence::begin`]. Dropping a transaction without calling
//! [`Transaction::commit`] rolls it back.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::model::{ApiKey, GroupPage, HostInstance, Page, Session, SessionHostInstance};

mod memory;
mod postgres;

pub use memory::{InMemoryPersistence, PageWrites};
pub use postgres::PgPersistence;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence backend error: {0}")]
    Backend(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[async_trait]
pub trait ApiKeyStore: Send {
    async fn get_api_key_by_key(&mut self, key: &str) -> PersistenceResult<Option<ApiKey>>;
    async fn get_api_key(&mut self, id: Uuid) -> PersistenceResult<Option<ApiKey>>;
}

#[async_trait]
pub trait HostInstanceStore: Send {
    async fn get_host_instance(&mut self, id: Uuid) -> PersistenceResult<Option<HostInstance>>;
    /// Host instances registered under an API key, oldest first.
    async fn list_host_instances(&mut self, api_key_id: Uuid)
        -> PersistenceResult<Vec<HostInstance>>;
    async fn create_host_instance(&mut self, host: &HostInstance) -> PersistenceResult<()>;
    async fn update_host_instance(&mut self, host: &HostInstance) -> PersistenceResult<()>;
}

#[async_trait]
pub trait SessionStore: Send {
    async fn get_session(&mut self, id: Uuid) -> PersistenceResult<Option<Session>>;
    async fn create_session(&mut self, session: &Session) -> PersistenceResult<()>;
    /// Deletes the session and its host bindings. Missing sessions are not an error.
    async fn delete_session(&mut self, id: Uuid) -> PersistenceResult<()>;
    async fn create_session_host_instance(
        &mut self,
        binding: &SessionHostInstance,
    ) -> PersistenceResult<()>;
    /// Host bindings for a session, oldest first. The last one is current.
    async fn list_session_host_instances(
        &mut self,
        session_id: Uuid,
    ) -> PersistenceResult<Vec<SessionHostInstance>>;
}

#[async_trait]
pub trait PageStore: Send {
    async fn get_page(&mut self, id: Uuid) -> PersistenceResult<Option<Page>>;
    async fn list_pages(&mut self, api_key_id: Uuid) -> PersistenceResult<Vec<Page>>;
    async fn bulk_insert_pages(&mut self, pages: &[Page]) -> PersistenceResult<()>;
    async fn bulk_update_pages(&mut self, pages: &[Page]) -> PersistenceResult<()>;
    async fn bulk_delete_pages(&mut self, ids: &[Uuid]) -> PersistenceResult<()>;
}

#[async_trait]
pub trait GroupPageStore: Send {
    async fn list_group_pages_by_page(&mut self, page_id: Uuid)
        -> PersistenceResult<Vec<GroupPage>>;
    async fn bulk_delete_group_pages_by_page_ids(&mut self, page_ids: &[Uuid])
        -> PersistenceResult<()>;
    async fn list_user_group_ids(&mut self, user_id: Uuid) -> PersistenceResult<Vec<Uuid>>;
}

#[async_trait]
pub trait Transaction:
    ApiKeyStore + HostInstanceStore + SessionStore + PageStore + GroupPageStore + Send
{
    async fn commit(self: Box<Self>) -> PersistenceResult<()>;
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn begin(&self) -> PersistenceResult<Box<dyn Transaction>>;

    fn backend(&self) -> &'static str;
}

pub async fn build_persistence(cfg: &AppConfig) -> Arc<dyn Persistence> {
    if let Some(url) = cfg.database_url.as_deref() {
        match PgPersistence::connect(url).await {
            Ok(pg) => {
                info!("using postgres persistence");
                return Arc::new(pg);
            }
            Err(err) => {
                warn!(error = %err, "DATABASE_URL provided but Postgres adapter failed; falling back to memory");
            }
        }
    }
    InMemoryPersistence::new()
}
