use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{
    ApiKeyStore, GroupPageStore, HostInstanceStore, PageStore, Persistence, PersistenceResult,
    SessionStore, Transaction,
};
use crate::model::{
    ApiKey, GroupPage, HostInstance, HostInstanceStatus, Page, Session, SessionHostInstance,
};

#[derive(sqlx::FromRow)]
struct HostInstanceRow {
    id: Uuid,
    organization_id: Uuid,
    api_key_id: Uuid,
    sdk_name: String,
    sdk_version: String,
    status: String,
}

impl From<HostInstanceRow> for HostInstance {
    fn from(row: HostInstanceRow) -> Self {
        HostInstance {
            id: row.id,
            organization_id: row.organization_id,
            api_key_id: row.api_key_id,
            sdk_name: row.sdk_name,
            sdk_version: row.sdk_version,
            status: HostInstanceStatus::parse(&row.status),
        }
    }
}

/// Postgres-backed persistence. Migrations run on connect.
#[derive(Clone)]
pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub async fn connect(url: &str) -> PersistenceResult<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Persistence for PgPersistence {
    async fn begin(&self) -> PersistenceResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl ApiKeyStore for PgTransaction {
    async fn get_api_key_by_key(&mut self, key: &str) -> PersistenceResult<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKey>(
            r#"SELECT id, organization_id, environment_id, name, key FROM api_key WHERE key = $1"#,
        )
        .bind(key)
        .fetch_optional(self.tx.as_mut())
        .await?;
        Ok(row)
    }

    async fn get_api_key(&mut self, id: Uuid) -> PersistenceResult<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKey>(
            r#"SELECT id, organization_id, environment_id, name, key FROM api_key WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(self.tx.as_mut())
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl HostInstanceStore for PgTransaction {
    async fn get_host_instance(&mut self, id: Uuid) -> PersistenceResult<Option<HostInstance>> {
        let row = sqlx::query_as::<_, HostInstanceRow>(
            r#"
            SELECT id, organization_id, api_key_id, sdk_name, sdk_version, status
            FROM host_instance
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.tx.as_mut())
        .await?;
        Ok(row.map(HostInstance::from))
    }

    async fn list_host_instances(
        &mut self,
        api_key_id: Uuid,
    ) -> PersistenceResult<Vec<HostInstance>> {
        let rows = sqlx::query_as::<_, HostInstanceRow>(
            r#"
            SELECT id, organization_id, api_key_id, sdk_name, sdk_version, status
            FROM host_instance
            WHERE api_key_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(api_key_id)
        .fetch_all(self.tx.as_mut())
        .await?;
        Ok(rows.into_iter().map(HostInstance::from).collect())
    }

    async fn create_host_instance(&mut self, host: &HostInstance) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO host_instance (id, organization_id, api_key_id, sdk_name, sdk_version, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(host.id)
        .bind(host.organization_id)
        .bind(host.api_key_id)
        .bind(&host.sdk_name)
        .bind(&host.sdk_version)
        .bind(host.status.as_str())
        .bind(Utc::now())
        .execute(self.tx.as_mut())
        .await?;
        Ok(())
    }

    async fn update_host_instance(&mut self, host: &HostInstance) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            UPDATE host_instance
            SET organization_id = $2, api_key_id = $3, sdk_name = $4, sdk_version = $5,
                status = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(host.id)
        .bind(host.organization_id)
        .bind(host.api_key_id)
        .bind(&host.sdk_name)
        .bind(&host.sdk_version)
        .bind(host.status.as_str())
        .bind(Utc::now())
        .execute(self.tx.as_mut())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgTransaction {
    async fn get_session(&mut self, id: Uuid) -> PersistenceResult<Option<Session>> {
        let row = sqlx::query_as::<_, Session>(
            r#"SELECT id, organization_id, user_id, environment_id, created_at FROM session WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(self.tx.as_mut())
        .await?;
        Ok(row)
    }

    async fn create_session(&mut self, session: &Session) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO session (id, organization_id, user_id, environment_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.id)
        .bind(session.organization_id)
        .bind(session.user_id)
        .bind(session.environment_id)
        .bind(session.created_at)
        .execute(self.tx.as_mut())
        .await?;
        Ok(())
    }

    async fn delete_session(&mut self, id: Uuid) -> PersistenceResult<()> {
        // session_host_instance rows cascade
        sqlx::query(r#"DELETE FROM session WHERE id = $1"#)
            .bind(id)
            .execute(self.tx.as_mut())
            .await?;
        Ok(())
    }

    async fn create_session_host_instance(
        &mut self,
        binding: &SessionHostInstance,
    ) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO session_host_instance (session_id, host_instance_id, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(binding.session_id)
        .bind(binding.host_instance_id)
        .bind(binding.created_at)
        .execute(self.tx.as_mut())
        .await?;
        Ok(())
    }

    async fn list_session_host_instances(
        &mut self,
        session_id: Uuid,
    ) -> PersistenceResult<Vec<SessionHostInstance>> {
        let rows = sqlx::query_as::<_, SessionHostInstance>(
            r#"
            SELECT session_id, host_instance_id, created_at
            FROM session_host_instance
            WHERE session_id = $1
            ORDER BY created_at, seq
            "#,
        )
        .bind(session_id)
        .fetch_all(self.tx.as_mut())
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl PageStore for PgTransaction {
    async fn get_page(&mut self, id: Uuid) -> PersistenceResult<Option<Page>> {
        let row = sqlx::query_as::<_, Page>(
            r#"
            SELECT id, organization_id, environment_id, api_key_id, name, route, path
            FROM page
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.tx.as_mut())
        .await?;
        Ok(row)
    }

    async fn list_pages(&mut self, api_key_id: Uuid) -> PersistenceResult<Vec<Page>> {
        let rows = sqlx::query_as::<_, Page>(
            r#"
            SELECT id, organization_id, environment_id, api_key_id, name, route, path
            FROM page
            WHERE api_key_id = $1
            ORDER BY path
            "#,
        )
        .bind(api_key_id)
        .fetch_all(self.tx.as_mut())
        .await?;
        Ok(rows)
    }

    async fn bulk_insert_pages(&mut self, pages: &[Page]) -> PersistenceResult<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO page (id, organization_id, environment_id, api_key_id, name, route, path) ",
        );
        builder.push_values(pages, |mut row, page| {
            row.push_bind(page.id)
                .push_bind(page.organization_id)
                .push_bind(page.environment_id)
                .push_bind(page.api_key_id)
                .push_bind(page.name.clone())
                .push_bind(page.route.clone())
                .push_bind(page.path.clone());
        });
        builder.build().execute(self.tx.as_mut()).await?;
        Ok(())
    }

    async fn bulk_update_pages(&mut self, pages: &[Page]) -> PersistenceResult<()> {
        for page in pages {
            sqlx::query(
                r#"
                UPDATE page
                SET name = $2, route = $3, path = $4, updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(page.id)
            .bind(&page.name)
            .bind(&page.route)
            .bind(&page.path)
            .execute(self.tx.as_mut())
            .await?;
        }
        Ok(())
    }

    async fn bulk_delete_pages(&mut self, ids: &[Uuid]) -> PersistenceResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(r#"DELETE FROM page WHERE id = ANY($1)"#)
            .bind(ids.to_vec())
            .execute(self.tx.as_mut())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GroupPageStore for PgTransaction {
    async fn list_group_pages_by_page(
        &mut self,
        page_id: Uuid,
    ) -> PersistenceResult<Vec<GroupPage>> {
        let rows = sqlx::query_as::<_, GroupPage>(
            r#"SELECT id, group_id, page_id FROM group_page WHERE page_id = $1"#,
        )
        .bind(page_id)
        .fetch_all(self.tx.as_mut())
        .await?;
        Ok(rows)
    }

    async fn bulk_delete_group_pages_by_page_ids(
        &mut self,
        page_ids: &[Uuid],
    ) -> PersistenceResult<()> {
        if page_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(r#"DELETE FROM group_page WHERE page_id = ANY($1)"#)
            .bind(page_ids.to_vec())
            .execute(self.tx.as_mut())
            .await?;
        Ok(())
    }

    async fn list_user_group_ids(&mut self, user_id: Uuid) -> PersistenceResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"SELECT group_id FROM user_group WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_all(self.tx.as_mut())
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> PersistenceResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn postgres_session_roundtrip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PgPersistence::connect(&url).await.expect("connect");
        let org = Uuid::new_v4();
        let session = Session {
            id: Uuid::new_v4(),
            organization_id: org,
            user_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };

        let mut tx = store.begin().await.expect("begin");
        tx.create_session(&session).await.expect("create");
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        let loaded = tx.get_session(session.id).await.expect("get");
        assert_eq!(loaded.map(|s| s.organization_id), Some(org));
        tx.delete_session(session.id).await.expect("delete");
        tx.commit().await.expect("commit");
    }
}
