use anywhere_common::{InstanceRecord, InstanceStatus, NewInstance};
use async_trait::async_trait;
use sqlx::postgres::PgExecutor;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{InventoryLock, InventoryStore, StoreError};

/// Key of the transaction-scoped advisory lock guarding admission.
const ADMISSION_LOCK_KEY: i64 = 0x616e_7977_6865_7265; // "anywhere"

const COLUMNS: &str = "id, uuid, cloud_id, region, public_address, status, \
                       direct_link, relay_link, is_deleted, created_at, updated_at";

pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

fn status_texts(statuses: &[InstanceStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Shared by [`PgStore::create`] and the admission lock, which runs it on its own
/// transaction.
pub(super) async fn insert<'e, E>(db: E, new: &NewInstance) -> Result<InstanceRecord, StoreError>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "INSERT INTO proxy_instances (uuid, region, cloud_id, public_address, status)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING {COLUMNS}"
    );
    sqlx::query_as::<_, InstanceRecord>(&sql)
        .bind(new.uuid)
        .bind(&new.region)
        .bind(&new.cloud_id)
        .bind(&new.public_address)
        .bind(new.status)
        .fetch_one(db)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::Conflict(new.uuid)
            }
            other => StoreError::Database(other),
        })
}

pub(super) async fn oldest_active<'e, E>(
    db: E,
    region: &str,
) -> Result<Option<InstanceRecord>, StoreError>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "SELECT {COLUMNS} FROM proxy_instances
         WHERE region = $1 AND is_deleted = FALSE AND status::text = ANY($2)
         ORDER BY created_at ASC, id ASC
         LIMIT 1"
    );
    Ok(sqlx::query_as::<_, InstanceRecord>(&sql)
        .bind(region)
        .bind(status_texts(&InstanceStatus::ACTIVE))
        .fetch_optional(db)
        .await?)
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn create(&self, new: NewInstance) -> Result<InstanceRecord, StoreError> {
        insert(&self.db, &new).await
    }

    async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<InstanceRecord>, StoreError> {
        let sql =
            format!("SELECT {COLUMNS} FROM proxy_instances WHERE uuid = $1 AND is_deleted = FALSE");
        Ok(sqlx::query_as::<_, InstanceRecord>(&sql)
            .bind(uuid)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn list_active(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM proxy_instances
             WHERE is_deleted = FALSE
             ORDER BY created_at DESC, id DESC"
        );
        Ok(sqlx::query_as::<_, InstanceRecord>(&sql).fetch_all(&self.db).await?)
    }

    async fn update(&self, record: &InstanceRecord) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE proxy_instances
             SET cloud_id = $2, public_address = $3, status = $4,
                 direct_link = $5, relay_link = $6, updated_at = NOW()
             WHERE uuid = $1 AND is_deleted = FALSE",
        )
        .bind(record.uuid)
        .bind(&record.cloud_id)
        .bind(&record.public_address)
        .bind(record.status)
        .bind(&record.direct_link)
        .bind(&record.relay_link)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn update_status(&self, uuid: Uuid, status: InstanceStatus) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE proxy_instances SET status = $2, updated_at = NOW()
             WHERE uuid = $1 AND is_deleted = FALSE",
        )
        .bind(uuid)
        .bind(status)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn update_status_and_address(
        &self,
        uuid: Uuid,
        status: InstanceStatus,
        address: &str,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE proxy_instances SET status = $2, public_address = $3, updated_at = NOW()
             WHERE uuid = $1 AND is_deleted = FALSE",
        )
        .bind(uuid)
        .bind(status)
        .bind(address)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn transition(
        &self,
        uuid: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
        address: Option<&str>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE proxy_instances
             SET status = $2, public_address = COALESCE($3, public_address), updated_at = NOW()
             WHERE uuid = $1 AND is_deleted = FALSE AND status::text = ANY($4)",
        )
        .bind(uuid)
        .bind(to)
        .bind(address)
        .bind(status_texts(from))
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn attach_cloud_id(
        &self,
        uuid: Uuid,
        cloud_id: &str,
        expected: InstanceStatus,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE proxy_instances SET cloud_id = $2, updated_at = NOW()
             WHERE uuid = $1 AND is_deleted = FALSE AND status = $3",
        )
        .bind(uuid)
        .bind(cloud_id)
        .bind(expected)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_links(
        &self,
        uuid: Uuid,
        direct_link: &str,
        relay_link: &str,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE proxy_instances SET direct_link = $2, relay_link = $3, updated_at = NOW()
             WHERE uuid = $1 AND is_deleted = FALSE",
        )
        .bind(uuid)
        .bind(direct_link)
        .bind(relay_link)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn soft_delete(&self, uuid: Uuid) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "UPDATE proxy_instances SET status = 'deleted', is_deleted = TRUE, updated_at = NOW()
             WHERE uuid = $1 AND is_deleted = FALSE",
        )
        .bind(uuid)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn has_active_in_region(&self, region: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(
               SELECT 1 FROM proxy_instances
               WHERE region = $1 AND is_deleted = FALSE AND status::text = ANY($2)
             )",
        )
        .bind(region)
        .bind(status_texts(&InstanceStatus::ACTIVE))
        .fetch_one(&self.db)
        .await?;
        Ok(exists)
    }

    async fn get_active_in_region(
        &self,
        region: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        oldest_active(&self.db, region).await
    }

    async fn lock(&self) -> Result<InventoryLock, StoreError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ADMISSION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        Ok(InventoryLock::Postgres(tx))
    }
}
