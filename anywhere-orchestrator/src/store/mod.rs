//! Inventory Store: the single source of truth for instance records.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use anywhere_common::{InstanceRecord, InstanceStatus, NewInstance};
use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("instance {0} already exists")]
    Conflict(Uuid),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Held while the admission check and insert of a create request run.
/// Dropping it without [`InventoryLock::unlock`] also releases it.
///
/// The check and the insert go through the lock itself. On Postgres they run in
/// the transaction holding the advisory lock and need no other pool connection.
pub enum InventoryLock {
    /// Open transaction holding a transaction-scoped advisory lock.
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    Memory {
        _guard: OwnedMutexGuard<()>,
        records: Arc<Mutex<Vec<InstanceRecord>>>,
        next_id: Arc<AtomicI64>,
    },
}

impl InventoryLock {
    /// [`InventoryStore::get_active_in_region`] under the lock.
    pub async fn get_active_in_region(
        &mut self,
        region: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        match self {
            InventoryLock::Postgres(tx) => postgres::oldest_active(&mut **tx, region).await,
            InventoryLock::Memory { records, .. } => {
                Ok(memory::oldest_active(&records.lock().await, region))
            }
        }
    }

    /// [`InventoryStore::create`] under the lock. On Postgres the row is visible to
    /// others once unlocked.
    pub async fn create(&mut self, new: NewInstance) -> Result<InstanceRecord, StoreError> {
        match self {
            InventoryLock::Postgres(tx) => postgres::insert(&mut **tx, &new).await,
            InventoryLock::Memory { records, next_id, .. } => {
                memory::insert(&mut *records.lock().await, next_id, new)
            }
        }
    }

    pub async fn unlock(self) -> Result<(), StoreError> {
        match self {
            InventoryLock::Postgres(tx) => tx.commit().await?,
            InventoryLock::Memory { .. } => {}
        }
        Ok(())
    }
}

/// Every mutation is a no-op on soft-deleted records; the `bool` results say
/// whether a row was changed.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn create(&self, new: NewInstance) -> Result<InstanceRecord, StoreError>;

    /// Non-deleted record with this uuid.
    async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<InstanceRecord>, StoreError>;

    /// All non-deleted records, newest first.
    async fn list_active(&self) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Writes the mutable columns of `record` (cloud id, address, status, links).
    async fn update(&self, record: &InstanceRecord) -> Result<bool, StoreError>;

    async fn update_status(&self, uuid: Uuid, status: InstanceStatus) -> Result<bool, StoreError>;

    async fn update_status_and_address(
        &self,
        uuid: Uuid,
        status: InstanceStatus,
        address: &str,
    ) -> Result<bool, StoreError>;

    /// Moves to `to` only when the current status is one of `from`.
    /// `address`, when given, is written in the same statement.
    async fn transition(
        &self,
        uuid: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
        address: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Records the cloud id, provided the record is still in `expected`.
    async fn attach_cloud_id(
        &self,
        uuid: Uuid,
        cloud_id: &str,
        expected: InstanceStatus,
    ) -> Result<bool, StoreError>;

    async fn set_links(
        &self,
        uuid: Uuid,
        direct_link: &str,
        relay_link: &str,
    ) -> Result<bool, StoreError>;

    /// `status = deleted, is_deleted = true`. Terminal.
    async fn soft_delete(&self, uuid: Uuid) -> Result<bool, StoreError>;

    async fn has_active_in_region(&self, region: &str) -> Result<bool, StoreError>;

    /// Oldest active record in `region`, if any.
    async fn get_active_in_region(
        &self,
        region: &str,
    ) -> Result<Option<InstanceRecord>, StoreError>;

    /// Exclusive inventory-wide lock serializing check-then-create.
    async fn lock(&self) -> Result<InventoryLock, StoreError>;
}
