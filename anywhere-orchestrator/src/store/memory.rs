use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anywhere_common::{InstanceRecord, InstanceStatus, NewInstance};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{InventoryLock, InventoryStore, StoreError};

/// Process-local store for development without Postgres and for tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<InstanceRecord>>>,
    next_id: Arc<AtomicI64>,
    admission: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record ever written, soft-deleted ones included, oldest first.
    pub async fn snapshot(&self) -> Vec<InstanceRecord> {
        self.records.lock().await.clone()
    }

    /// Inserts a fully formed record, bypassing admission. Test seeding only.
    pub async fn seed(&self, new: NewInstance) -> InstanceRecord {
        let record = build(&self.next_id, new);
        self.records.lock().await.push(record.clone());
        record
    }

    /// Applies `f` to the live record with `uuid`; false when there is none or `f` declines.
    async fn mutate<F>(&self, uuid: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut InstanceRecord) -> bool + Send,
    {
        let mut records = self.records.lock().await;
        match records.iter_mut().find(|r| r.uuid == uuid && !r.is_deleted) {
            Some(record) => {
                let changed = f(record);
                if changed {
                    record.updated_at = Utc::now();
                }
                changed
            }
            None => false,
        }
    }
}

fn build(next_id: &AtomicI64, new: NewInstance) -> InstanceRecord {
    let now = Utc::now();
    InstanceRecord {
        id: next_id.fetch_add(1, Ordering::SeqCst) + 1,
        uuid: new.uuid,
        cloud_id: new.cloud_id,
        region: new.region,
        public_address: new.public_address,
        status: new.status,
        direct_link: String::new(),
        relay_link: String::new(),
        is_deleted: false,
        created_at: now,
        updated_at: now,
    }
}

pub(super) fn insert(
    records: &mut Vec<InstanceRecord>,
    next_id: &AtomicI64,
    new: NewInstance,
) -> Result<InstanceRecord, StoreError> {
    if records.iter().any(|r| r.uuid == new.uuid) {
        return Err(StoreError::Conflict(new.uuid));
    }
    let record = build(next_id, new);
    records.push(record.clone());
    Ok(record)
}

/// Records are kept in insertion order, so the first match is the oldest.
pub(super) fn oldest_active(records: &[InstanceRecord], region: &str) -> Option<InstanceRecord> {
    records.iter().find(|r| r.region == region && r.is_active()).cloned()
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn create(&self, new: NewInstance) -> Result<InstanceRecord, StoreError> {
        insert(&mut *self.records.lock().await, &self.next_id, new)
    }

    async fn get_by_uuid(&self, uuid: Uuid) -> Result<Option<InstanceRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.uuid == uuid && !r.is_deleted).cloned())
    }

    async fn list_active(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.iter().rev().filter(|r| !r.is_deleted).cloned().collect())
    }

    async fn update(&self, record: &InstanceRecord) -> Result<bool, StoreError> {
        let incoming = record.clone();
        Ok(self
            .mutate(record.uuid, move |r| {
                r.cloud_id = incoming.cloud_id;
                r.public_address = incoming.public_address;
                r.status = incoming.status;
                r.direct_link = incoming.direct_link;
                r.relay_link = incoming.relay_link;
                true
            })
            .await)
    }

    async fn update_status(&self, uuid: Uuid, status: InstanceStatus) -> Result<bool, StoreError> {
        Ok(self
            .mutate(uuid, |r| {
                r.status = status;
                true
            })
            .await)
    }

    async fn update_status_and_address(
        &self,
        uuid: Uuid,
        status: InstanceStatus,
        address: &str,
    ) -> Result<bool, StoreError> {
        let address = address.to_string();
        Ok(self
            .mutate(uuid, move |r| {
                r.status = status;
                r.public_address = address;
                true
            })
            .await)
    }

    async fn transition(
        &self,
        uuid: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
        address: Option<&str>,
    ) -> Result<bool, StoreError> {
        let from = from.to_vec();
        let address = address.map(str::to_string);
        Ok(self
            .mutate(uuid, move |r| {
                if !from.contains(&r.status) {
                    return false;
                }
                r.status = to;
                if let Some(address) = address {
                    r.public_address = address;
                }
                true
            })
            .await)
    }

    async fn attach_cloud_id(
        &self,
        uuid: Uuid,
        cloud_id: &str,
        expected: InstanceStatus,
    ) -> Result<bool, StoreError> {
        let cloud_id = cloud_id.to_string();
        Ok(self
            .mutate(uuid, move |r| {
                if r.status != expected {
                    return false;
                }
                r.cloud_id = cloud_id;
                true
            })
            .await)
    }

    async fn set_links(
        &self,
        uuid: Uuid,
        direct_link: &str,
        relay_link: &str,
    ) -> Result<bool, StoreError> {
        let (direct, relay) = (direct_link.to_string(), relay_link.to_string());
        Ok(self
            .mutate(uuid, move |r| {
                r.direct_link = direct;
                r.relay_link = relay;
                true
            })
            .await)
    }

    async fn soft_delete(&self, uuid: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .mutate(uuid, |r| {
                r.status = InstanceStatus::Deleted;
                r.is_deleted = true;
                true
            })
            .await)
    }

    async fn has_active_in_region(&self, region: &str) -> Result<bool, StoreError> {
        let records = self.records.lock().await;
        Ok(records.iter().any(|r| r.region == region && r.is_active()))
    }

    async fn get_active_in_region(
        &self,
        region: &str,
    ) -> Result<Option<InstanceRecord>, StoreError> {
        Ok(oldest_active(&self.records.lock().await, region))
    }

    async fn lock(&self) -> Result<InventoryLock, StoreError> {
        Ok(InventoryLock::Memory {
            _guard: self.admission.clone().lock_owned().await,
            records: self.records.clone(),
            next_id: self.next_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_rejects_duplicate_uuid() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.create(NewInstance::pending(id, "fr-par-1")).await.unwrap();
        let err = store.create(NewInstance::pending(id, "fr-par-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(u) if u == id));
    }

    #[tokio::test]
    async fn test_soft_deleted_record_is_hidden_and_frozen() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.create(NewInstance::pending(id, "fr-par-1")).await.unwrap();

        assert!(store.soft_delete(id).await.unwrap());
        assert!(store.get_by_uuid(id).await.unwrap().is_none());
        assert!(store.list_active().await.unwrap().is_empty());

        // Deleted is terminal: nothing moves it again.
        assert!(!store.update_status(id, InstanceStatus::Running).await.unwrap());
        assert!(!store.soft_delete(id).await.unwrap());
        let all = store.snapshot().await;
        assert_eq!(all[0].status, InstanceStatus::Deleted);
        assert!(all[0].is_deleted);
    }

    #[tokio::test]
    async fn test_transition_is_guarded_by_source_status() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.create(NewInstance::pending(id, "fr-par-1")).await.unwrap();

        let moved = store
            .transition(
                id,
                &[InstanceStatus::Creating],
                InstanceStatus::Running,
                Some("203.0.113.1"),
            )
            .await
            .unwrap();
        assert!(!moved);

        let moved = store
            .transition(id, &[InstanceStatus::Pending], InstanceStatus::Creating, None)
            .await
            .unwrap();
        assert!(moved);
        let record = store.get_by_uuid(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Creating);
        assert_eq!(record.public_address, "");
    }

    #[tokio::test]
    async fn test_active_in_region_ignores_error_and_deleted() {
        let store = MemoryStore::new();
        let failed = Uuid::new_v4();
        store.create(NewInstance::pending(failed, "fr-par-1")).await.unwrap();
        store.update_status(failed, InstanceStatus::Error).await.unwrap();
        assert!(!store.has_active_in_region("fr-par-1").await.unwrap());

        let live = Uuid::new_v4();
        store.create(NewInstance::pending(live, "fr-par-1")).await.unwrap();
        assert!(store.has_active_in_region("fr-par-1").await.unwrap());
        assert_eq!(store.get_active_in_region("fr-par-1").await.unwrap().unwrap().uuid, live);
        assert!(store.get_active_in_region("nl-ams-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_unlocked() {
        let store = Arc::new(MemoryStore::new());
        let guard = store.lock().await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let lock = store.lock().await.unwrap();
                lock.unlock().await.unwrap();
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        guard.unlock().await.unwrap();
        contender.await.unwrap();
    }
}
