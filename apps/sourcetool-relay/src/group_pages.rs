//! Group-page access, present only in the extended edition.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::Edition;
use crate::persistence::{PersistenceResult, Transaction};

#[async_trait]
pub trait GroupPageCapability: Send + Sync {
    /// Runs inside the reconciliation transaction before `page_ids` are deleted.
    async fn before_pages_deleted(
        &self,
        tx: &mut dyn Transaction,
        page_ids: &[Uuid],
    ) -> PersistenceResult<()>;

    /// Whether `user_id` may open `page_id`.
    async fn authorize_page(
        &self,
        tx: &mut dyn Transaction,
        user_id: Uuid,
        page_id: Uuid,
    ) -> PersistenceResult<bool>;
}

/// Base edition: no group restrictions.
#[derive(Debug, Default)]
pub struct BaseTier;

#[async_trait]
impl GroupPageCapability for BaseTier {
    async fn before_pages_deleted(
        &self,
        _tx: &mut dyn Transaction,
        _page_ids: &[Uuid],
    ) -> PersistenceResult<()> {
        Ok(())
    }

    async fn authorize_page(
        &self,
        _tx: &mut dyn Transaction,
        _user_id: Uuid,
        _page_id: Uuid,
    ) -> PersistenceResult<bool> {
        Ok(true)
    }
}

/// Extended edition: pages bound to groups are visible only to group members.
#[derive(Debug, Default)]
pub struct GroupPageAccess;

#[async_trait]
impl GroupPageCapability for GroupPageAccess {
    async fn before_pages_deleted(
        &self,
        tx: &mut dyn Transaction,
        page_ids: &[Uuid],
    ) -> PersistenceResult<()> {
        tx.bulk_delete_group_pages_by_page_ids(page_ids).await
    }

    async fn authorize_page(
        &self,
        tx: &mut dyn Transaction,
        user_id: Uuid,
        page_id: Uuid,
    ) -> PersistenceResult<bool> {
        let group_pages = tx.list_group_pages_by_page(page_id).await?;
        if group_pages.is_empty() {
            return Ok(true);
        }
        let user_groups = tx.list_user_group_ids(user_id).await?;
        Ok(group_pages
            .iter()
            .any(|gp| user_groups.contains(&gp.group_id)))
    }
}

pub fn build_group_pages(edition: Edition) -> Arc<dyn GroupPageCapability> {
    match edition {
        Edition::Base => Arc::new(BaseTier),
        Edition::Extended => Arc::new(GroupPageAccess),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroupPage;
    use crate::persistence::{InMemoryPersistence, Persistence};

    #[tokio::test]
    async fn grouped_page_requires_membership() {
        let store = InMemoryPersistence::new();
        let page_id = Uuid::new_v4();
        let group_id = Uuid::new_v4();
        let member = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        store
            .seed_group_page(GroupPage {
                id: Uuid::new_v4(),
                group_id,
                page_id,
            })
            .await;
        store.seed_user_group(member, group_id).await;

        let access = GroupPageAccess;
        let mut tx = store.begin().await.unwrap();
        assert!(access.authorize_page(tx.as_mut(), member, page_id).await.unwrap());
        assert!(!access.authorize_page(tx.as_mut(), outsider, page_id).await.unwrap());
        assert!(access
            .authorize_page(tx.as_mut(), outsider, Uuid::new_v4())
            .await
            .unwrap());
        assert!(BaseTier
            .authorize_page(tx.as_mut(), outsider, page_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn extended_tier_clears_group_rows_before_page_delete() {
        let store = InMemoryPersistence::new();
        let page_id = Uuid::new_v4();
        store
            .seed_group_page(GroupPage {
                id: Uuid::new_v4(),
                group_id: Uuid::new_v4(),
                page_id,
            })
            .await;

        let mut tx = store.begin().await.unwrap();
        GroupPageAccess
            .before_pages_deleted(tx.as_mut(), &[page_id])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(store.group_pages().await.is_empty());
    }
}
