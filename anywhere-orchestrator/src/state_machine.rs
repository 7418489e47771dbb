use anywhere_common::InstanceStatus;
use anywhere_providers::inventory::CloudState;
use uuid::Uuid;

use crate::store::{InventoryStore, StoreError};

use InstanceStatus::*;

async fn apply(
    store: &dyn InventoryStore,
    uuid: Uuid,
    from: &[InstanceStatus],
    to: InstanceStatus,
    address: Option<&str>,
    reason: &str,
) -> Result<bool, StoreError> {
    let moved = store.transition(uuid, from, to, address).await?;
    if moved {
        tracing::info!(instance_uuid = %uuid, to = %to, reason, "state transition");
    } else {
        tracing::warn!(
            instance_uuid = %uuid,
            to = %to,
            expected = ?from,
            "transition skipped: record not in expected state"
        );
    }
    Ok(moved)
}

/// PENDING -> CREATING (idempotent).
pub async fn pending_to_creating(
    store: &dyn InventoryStore,
    uuid: Uuid,
) -> Result<bool, StoreError> {
    apply(store, uuid, &[Pending], Creating, None, "creation workflow started").await
}

/// CREATING -> RUNNING with the observed address.
/// Also accepts RUNNING when the reconciler got there first, so the address still lands.
pub async fn creating_to_running(
    store: &dyn InventoryStore,
    uuid: Uuid,
    address: &str,
) -> Result<bool, StoreError> {
    apply(store, uuid, &[Creating, Running], Running, Some(address), "instance reachable").await
}

/// Any live state -> DELETING. Re-requesting a stuck teardown is allowed.
pub async fn to_deleting(store: &dyn InventoryStore, uuid: Uuid) -> Result<bool, StoreError> {
    apply(
        store,
        uuid,
        &[Pending, Creating, Running, Deleting, Error],
        Deleting,
        None,
        "delete requested",
    )
    .await
}

/// CREATING/RUNNING/DELETING -> ERROR. Error is never left automatically.
pub async fn to_error(
    store: &dyn InventoryStore,
    uuid: Uuid,
    reason: &str,
) -> Result<bool, StoreError> {
    apply(store, uuid, &[Creating, Running, Deleting], Error, None, reason).await
}

/// -> DELETED, soft-deleting the record.
pub async fn to_deleted(
    store: &dyn InventoryStore,
    uuid: Uuid,
    reason: &str,
) -> Result<bool, StoreError> {
    let deleted = store.soft_delete(uuid).await?;
    if deleted {
        tracing::info!(instance_uuid = %uuid, to = %Deleted, reason, "state transition");
    }
    Ok(deleted)
}

/// Record status implied by what the provider reports.
pub fn status_from_cloud(state: &CloudState) -> InstanceStatus {
    match state {
        CloudState::Pending => Creating,
        CloudState::Running => Running,
        CloudState::Stopping | CloudState::ShuttingDown => Deleting,
        CloudState::Stopped | CloudState::Terminated => Deleted,
        CloudState::Unknown(_) => Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anywhere_common::NewInstance;

    #[test]
    fn test_cloud_state_mapping() {
        assert_eq!(status_from_cloud(&CloudState::Pending), Creating);
        assert_eq!(status_from_cloud(&CloudState::Running), Running);
        assert_eq!(status_from_cloud(&CloudState::ShuttingDown), Deleting);
        assert_eq!(status_from_cloud(&CloudState::Stopped), Deleted);
        assert_eq!(status_from_cloud(&CloudState::Unknown("locked".into())), Error);
    }

    #[tokio::test]
    async fn test_error_is_not_reachable_from_pending() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.create(NewInstance::pending(id, "fr-par-1")).await.unwrap();

        assert!(!to_error(&store, id, "boom").await.unwrap());
        assert!(pending_to_creating(&store, id).await.unwrap());
        assert!(!pending_to_creating(&store, id).await.unwrap());
        assert!(to_error(&store, id, "boom").await.unwrap());
        // error -> running never happens on its own
        assert!(!creating_to_running(&store, id, "203.0.113.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_is_terminal() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.create(NewInstance::pending(id, "fr-par-1")).await.unwrap();

        assert!(to_deleting(&store, id).await.unwrap());
        assert!(to_deleted(&store, id, "terminated").await.unwrap());
        assert!(!to_deleting(&store, id).await.unwrap());
        assert!(!to_error(&store, id, "late failure").await.unwrap());
    }
}
