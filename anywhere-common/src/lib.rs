use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod share_link;

// --- Enums ---

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, utoipa::ToSchema,
)]
#[sqlx(type_name = "instance_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,  // Record admitted, workflow not started yet
    Creating, // Cloud create requested, waiting for running
    Running,  // Reachable, endpoint published
    Deleting, // Teardown in flight
    Deleted,  // Terminal, record is soft-deleted
    Error,    // Workflow failed; operator must re-request
}

impl InstanceStatus {
    /// Statuses that occupy a region's single active slot.
    pub const ACTIVE: [InstanceStatus; 3] = [
        InstanceStatus::Pending,
        InstanceStatus::Creating,
        InstanceStatus::Running,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Deleted => "deleted",
            InstanceStatus::Error => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Entities (SQLx Mapped) ---

/// One proxy endpoint instance. Never physically deleted; `is_deleted` plus
/// `status = deleted` is the terminal form.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::FromRow, utoipa::ToSchema)]
pub struct InstanceRecord {
    pub id: i64,
    pub uuid: Uuid,
    /// Empty until the cloud resource exists.
    pub cloud_id: String,
    pub region: String,
    /// Empty until known.
    pub public_address: String,
    pub status: InstanceStatus,
    pub direct_link: String,
    pub relay_link: String,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn is_active(&self) -> bool {
        !self.is_deleted && self.status.is_active()
    }

    pub fn has_cloud_resource(&self) -> bool {
        !self.cloud_id.is_empty()
    }
}

/// Insert payload; the store assigns `id` and both timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    pub uuid: Uuid,
    pub region: String,
    pub cloud_id: String,
    pub public_address: String,
    pub status: InstanceStatus,
}

impl NewInstance {
    pub fn pending(uuid: Uuid, region: impl Into<String>) -> Self {
        Self {
            uuid,
            region: region.into(),
            cloud_id: String::new(),
            public_address: String::new(),
            status: InstanceStatus::Pending,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct RegionInfo {
    pub region: String,
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_set() {
        assert!(InstanceStatus::Pending.is_active());
        assert!(InstanceStatus::Running.is_active());
        assert!(!InstanceStatus::Deleting.is_active());
        assert!(!InstanceStatus::Error.is_active());
        assert!(!InstanceStatus::Deleted.is_active());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let v = serde_json::to_value(InstanceStatus::Creating).unwrap();
        assert_eq!(v, serde_json::json!("creating"));
    }
}
