use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    ApiKeyStore, GroupPageStore, HostInstanceStore, PageStore, Persistence, PersistenceError,
    PersistenceResult, SessionStore, Transaction,
};
use crate::model::{ApiKey, GroupPage, HostInstance, Page, Session, SessionHostInstance};

#[derive(Debug, Clone, Default)]
struct Tables {
    api_keys: Vec<ApiKey>,
    host_instances: Vec<HostInstance>,
    sessions: Vec<Session>,
    session_host_instances: Vec<SessionHostInstance>,
    pages: Vec<Page>,
    group_pages: Vec<GroupPage>,
    /// (user_id, group_id)
    user_groups: Vec<(Uuid, Uuid)>,
}

/// Committed page writes, counted per row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageWrites {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Default)]
struct PageWriteCounters {
    inserted: AtomicUsize,
    updated: AtomicUsize,
    deleted: AtomicUsize,
}

/// Process-local store. Transactions hold the table lock for their whole
/// lifetime and work on a copy that replaces the tables on commit.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    tables: Arc<Mutex<Tables>>,
    page_writes: Arc<PageWriteCounters>,
}

impl InMemoryPersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn seed_api_key(&self, key: ApiKey) {
        self.tables.lock().await.api_keys.push(key);
    }

    pub async fn seed_page(&self, page: Page) {
        self.tables.lock().await.pages.push(page);
    }

    pub async fn seed_group_page(&self, group_page: GroupPage) {
        self.tables.lock().await.group_pages.push(group_page);
    }

    pub async fn seed_user_group(&self, user_id: Uuid, group_id: Uuid) {
        self.tables.lock().await.user_groups.push((user_id, group_id));
    }

    pub async fn host_instance(&self, id: Uuid) -> Option<HostInstance> {
        let tables = self.tables.lock().await;
        tables.host_instances.iter().find(|h| h.id == id).cloned()
    }

    pub async fn session(&self, id: Uuid) -> Option<Session> {
        let tables = self.tables.lock().await;
        tables.sessions.iter().find(|s| s.id == id).cloned()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.tables.lock().await.sessions.clone()
    }

    pub async fn session_host_instances(&self, session_id: Uuid) -> Vec<SessionHostInstance> {
        let tables = self.tables.lock().await;
        tables
            .session_host_instances
            .iter()
            .filter(|b| b.session_id == session_id)
            .cloned()
            .collect()
    }

    pub async fn pages_for(&self, api_key_id: Uuid) -> Vec<Page> {
        let tables = self.tables.lock().await;
        tables
            .pages
            .iter()
            .filter(|p| p.api_key_id == api_key_id)
            .cloned()
            .collect()
    }

    pub async fn group_pages(&self) -> Vec<GroupPage> {
        self.tables.lock().await.group_pages.clone()
    }

    pub fn page_writes(&self) -> PageWrites {
        PageWrites {
            inserted: self.page_writes.inserted.load(Ordering::SeqCst),
            updated: self.page_writes.updated.load(Ordering::SeqCst),
            deleted: self.page_writes.deleted.load(Ordering::SeqCst),
        }
    }

    pub fn reset_page_writes(&self) {
        self.page_writes.inserted.store(0, Ordering::SeqCst);
        self.page_writes.updated.store(0, Ordering::SeqCst);
        self.page_writes.deleted.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn begin(&self) -> PersistenceResult<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            staged,
            writes: PageWrites::default(),
            counters: Arc::clone(&self.page_writes),
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
    writes: PageWrites,
    counters: Arc<PageWriteCounters>,
}

#[async_trait]
impl ApiKeyStore for MemoryTransaction {
    async fn get_api_key_by_key(&mut self, key: &str) -> PersistenceResult<Option<ApiKey>> {
        Ok(self.staged.api_keys.iter().find(|k| k.key == key).cloned())
    }

    async fn get_api_key(&mut self, id: Uuid) -> PersistenceResult<Option<ApiKey>> {
        Ok(self.staged.api_keys.iter().find(|k| k.id == id).cloned())
    }
}

#[async_trait]
impl HostInstanceStore for MemoryTransaction {
    async fn get_host_instance(&mut self, id: Uuid) -> PersistenceResult<Option<HostInstance>> {
        Ok(self.staged.host_instances.iter().find(|h| h.id == id).cloned())
    }

    async fn list_host_instances(
        &mut self,
        api_key_id: Uuid,
    ) -> PersistenceResult<Vec<HostInstance>> {
        Ok(self
            .staged
            .host_instances
            .iter()
            .filter(|h| h.api_key_id == api_key_id)
            .cloned()
            .collect())
    }

    async fn create_host_instance(&mut self, host: &HostInstance) -> PersistenceResult<()> {
        if self.staged.host_instances.iter().any(|h| h.id == host.id) {
            return Err(PersistenceError::Conflict(format!(
                "host instance {} already exists",
                host.id
            )));
        }
        self.staged.host_instances.push(host.clone());
        Ok(())
    }

    async fn update_host_instance(&mut self, host: &HostInstance) -> PersistenceResult<()> {
        match self.staged.host_instances.iter_mut().find(|h| h.id == host.id) {
            Some(existing) => {
                *existing = host.clone();
                Ok(())
            }
            None => Err(PersistenceError::Backend(format!(
                "host instance {} does not exist",
                host.id
            ))),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryTransaction {
    async fn get_session(&mut self, id: Uuid) -> PersistenceResult<Option<Session>> {
        Ok(self.staged.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn create_session(&mut self, session: &Session) -> PersistenceResult<()> {
        if self.staged.sessions.iter().any(|s| s.id == session.id) {
            return Err(PersistenceError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.staged.sessions.push(session.clone());
        Ok(())
    }

    async fn delete_session(&mut self, id: Uuid) -> PersistenceResult<()> {
        self.staged.sessions.retain(|s| s.id != id);
        self.staged
            .session_host_instances
            .retain(|b| b.session_id != id);
        Ok(())
    }

    async fn create_session_host_instance(
        &mut self,
        binding: &SessionHostInstance,
    ) -> PersistenceResult<()> {
        if !self.staged.sessions.iter().any(|s| s.id == binding.session_id) {
            return Err(PersistenceError::Backend(format!(
                "session {} does not exist",
                binding.session_id
            )));
        }
        self.staged.session_host_instances.push(binding.clone());
        Ok(())
    }

    async fn list_session_host_instances(
        &mut self,
        session_id: Uuid,
    ) -> PersistenceResult<Vec<SessionHostInstance>> {
        Ok(self
            .staged
            .session_host_instances
            .iter()
            .filter(|b| b.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PageStore for MemoryTransaction {
    async fn get_page(&mut self, id: Uuid) -> PersistenceResult<Option<Page>> {
        Ok(self.staged.pages.iter().find(|p| p.id == id).cloned())
    }

    async fn list_pages(&mut self, api_key_id: Uuid) -> PersistenceResult<Vec<Page>> {
        Ok(self
            .staged
            .pages
            .iter()
            .filter(|p| p.api_key_id == api_key_id)
            .cloned()
            .collect())
    }

    async fn bulk_insert_pages(&mut self, pages: &[Page]) -> PersistenceResult<()> {
        for page in pages {
            if self.staged.pages.iter().any(|p| p.id == page.id) {
                return Err(PersistenceError::Conflict(format!(
                    "page {} already exists",
                    page.id
                )));
            }
            self.staged.pages.push(page.clone());
        }
        self.writes.inserted += pages.len();
        Ok(())
    }

    async fn bulk_update_pages(&mut self, pages: &[Page]) -> PersistenceResult<()> {
        for page in pages {
            if let Some(existing) = self.staged.pages.iter_mut().find(|p| p.id == page.id) {
                *existing = page.clone();
                self.writes.updated += 1;
            }
        }
        Ok(())
    }

    async fn bulk_delete_pages(&mut self, ids: &[Uuid]) -> PersistenceResult<()> {
        let before = self.staged.pages.len();
        self.staged.pages.retain(|p| !ids.contains(&p.id));
        self.writes.deleted += before - self.staged.pages.len();
        Ok(())
    }
}

#[async_trait]
impl GroupPageStore for MemoryTransaction {
    async fn list_group_pages_by_page(
        &mut self,
        page_id: Uuid,
    ) -> PersistenceResult<Vec<GroupPage>> {
        Ok(self
            .staged
            .group_pages
            .iter()
            .filter(|g| g.page_id == page_id)
            .cloned()
            .collect())
    }

    async fn bulk_delete_group_pages_by_page_ids(
        &mut self,
        page_ids: &[Uuid],
    ) -> PersistenceResult<()> {
        self.staged
            .group_pages
            .retain(|g| !page_ids.contains(&g.page_id));
        Ok(())
    }

    async fn list_user_group_ids(&mut self, user_id: Uuid) -> PersistenceResult<Vec<Uuid>> {
        Ok(self
            .staged
            .user_groups
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, group)| *group)
            .collect())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> PersistenceResult<()> {
        let MemoryTransaction {
            mut guard,
            staged,
            writes,
            counters,
        } = *self;
        *guard = staged;
        counters.inserted.fetch_add(writes.inserted, Ordering::SeqCst);
        counters.updated.fetch_add(writes.updated, Ordering::SeqCst);
        counters.deleted.fetch_add(writes.deleted, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn session(id: Uuid) -> Session {
        Session {
            id,
            organization_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryPersistence::new();
        let id = Uuid::new_v4();
        {
            let mut tx = store.begin().await.unwrap();
            tx.create_session(&session(id)).await.unwrap();
        }
        assert!(store.session(id).await.is_none());

        let mut tx = store.begin().await.unwrap();
        tx.create_session(&session(id)).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.session(id).await.is_some());
    }

    #[tokio::test]
    async fn deleting_a_session_drops_its_bindings() {
        let store = InMemoryPersistence::new();
        let id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.create_session(&session(id)).await.unwrap();
        tx.create_session_host_instance(&SessionHostInstance {
            session_id: id,
            host_instance_id: Uuid::new_v4(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.delete_session(id).await.unwrap();
        tx.delete_session(id).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.session_host_instances(id).await.is_empty());
    }

    #[tokio::test]
    async fn page_writes_count_only_committed_rows() {
        let store = InMemoryPersistence::new();
        let page = Page {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            api_key_id: Uuid::new_v4(),
            name: "home".into(),
            route: "/".into(),
            path: vec![0],
        };
        {
            let mut tx = store.begin().await.unwrap();
            tx.bulk_insert_pages(std::slice::from_ref(&page)).await.unwrap();
        }
        assert_eq!(store.page_writes(), PageWrites::default());

        let mut tx = store.begin().await.unwrap();
        tx.bulk_insert_pages(std::slice::from_ref(&page)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.page_writes().inserted, 1);
    }
}
