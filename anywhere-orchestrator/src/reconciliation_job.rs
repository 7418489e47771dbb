use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anywhere_common::{InstanceRecord, InstanceStatus, NewInstance};
use anywhere_providers::CloudProvider;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::Task;
use crate::settings::Settings;
use crate::state_machine;
use crate::store::{InventoryStore, StoreError};

pub const TASK_NAME: &str = "cloud-reconciler";

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub updated: usize,
    pub adopted: usize,
    pub created: usize,
    pub deleted: usize,
    pub skipped_untagged: usize,
    pub failed_regions: Vec<String>,
    pub store_errors: usize,
}

impl ReconcileReport {
    pub fn changes(&self) -> usize {
        self.updated + self.adopted + self.created + self.deleted
    }

    /// No region listing and no store write failed.
    pub fn is_clean(&self) -> bool {
        self.failed_regions.is_empty() && self.store_errors == 0
    }
}

/// Converges the inventory to what the provider reports, for every configured region.
pub struct CloudReconciler {
    store: Arc<dyn InventoryStore>,
    provider: Arc<dyn CloudProvider>,
    settings: Arc<Settings>,
}

impl CloudReconciler {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        provider: Arc<dyn CloudProvider>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
        }
    }

    /// Only a failed inventory read aborts the pass. Per-record store failures are
    /// logged, counted in `store_errors` and retried on the next pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();

        let mut by_cloud_id: HashMap<String, InstanceRecord> = HashMap::new();
        // Records whose workflow never got to attach a cloud id.
        let mut unattached: HashMap<Uuid, InstanceRecord> = HashMap::new();
        for record in self.store.list_active().await? {
            if record.has_cloud_resource() {
                by_cloud_id.insert(record.cloud_id.clone(), record);
            } else {
                unattached.insert(record.uuid, record);
            }
        }

        let mut listed_regions: HashSet<&str> = HashSet::new();
        for region in self.settings.regions.keys() {
            let live = match self.provider.list_instances(region).await {
                Ok(live) => live,
                Err(e) => {
                    tracing::warn!(
                        region = %region,
                        error = %format!("{e:#}"),
                        "listing region failed, skipping this cycle"
                    );
                    report.failed_regions.push(region.clone());
                    continue;
                }
            };
            listed_regions.insert(region.as_str());

            for server in live {
                let owner = server.owner_tag.as_deref().and_then(|t| Uuid::parse_str(t).ok());
                let Some(owner) = owner else {
                    tracing::debug!(
                        region = %region,
                        cloud_id = %server.provider_id,
                        "untagged server ignored"
                    );
                    report.skipped_untagged += 1;
                    continue;
                };
                let status = state_machine::status_from_cloud(&server.state);
                let address = server.ip_address.clone().unwrap_or_default();

                let applied = if let Some(record) = by_cloud_id.remove(&server.provider_id) {
                    self.heal(&record, status, &address, &mut report).await
                } else if let Some(record) = unattached.remove(&owner) {
                    self.attach(&record, &server.provider_id, &mut report).await
                } else {
                    let cloud_id = &server.provider_id;
                    self.adopt_unknown(region, owner, cloud_id, status, address, &mut report)
                        .await
                };
                if let Err(e) = applied {
                    tracing::error!(
                        region = %region,
                        instance_uuid = %owner,
                        cloud_id = %server.provider_id,
                        error = %e,
                        "could not reconcile server, continuing"
                    );
                    report.store_errors += 1;
                }
            }
        }

        // Known locally, gone from the cloud: terminated out of band.
        for record in by_cloud_id.into_values() {
            if !listed_regions.contains(record.region.as_str()) {
                continue;
            }
            let reason = "cloud resource vanished";
            match state_machine::to_deleted(self.store.as_ref(), record.uuid, reason).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        instance_uuid = %record.uuid,
                        error = %e,
                        "could not delete vanished record"
                    );
                    report.store_errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Writes are compare-and-set against the status read at the start of the
    /// pass, so a record that moved since (to error, to deleting) is left alone.
    async fn heal(
        &self,
        record: &InstanceRecord,
        status: InstanceStatus,
        address: &str,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        // Error needs an operator; a teardown in flight is not undone.
        if record.status == InstanceStatus::Error {
            return Ok(());
        }
        if record.status == InstanceStatus::Deleting && status.is_active() {
            return Ok(());
        }
        if status == InstanceStatus::Deleted {
            let reason = "cloud reports server stopped";
            if state_machine::to_deleted(self.store.as_ref(), record.uuid, reason).await? {
                report.deleted += 1;
            }
            return Ok(());
        }
        if record.public_address == address && record.status == status {
            return Ok(());
        }

        let changed = self
            .store
            .transition(record.uuid, &[record.status], status, Some(address))
            .await?;
        if changed {
            tracing::info!(
                instance_uuid = %record.uuid,
                from = %record.status,
                to = %status,
                address,
                "record healed from cloud state"
            );
            report.updated += 1;
        } else {
            tracing::debug!(
                instance_uuid = %record.uuid,
                "record changed during pass, left for next cycle"
            );
        }
        Ok(())
    }

    /// Tagged server whose record has no cloud id yet. Only the id is written;
    /// the status follows through [`Self::heal`] on a later pass.
    async fn attach(
        &self,
        record: &InstanceRecord,
        cloud_id: &str,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        if self.store.attach_cloud_id(record.uuid, cloud_id, record.status).await? {
            tracing::info!(
                instance_uuid = %record.uuid,
                cloud_id,
                status = %record.status,
                "attached cloud id to record"
            );
            report.adopted += 1;
        }
        Ok(())
    }

    /// Tagged server with no record: created out of band or by a crashed process.
    async fn adopt_unknown(
        &self,
        region: &str,
        owner: Uuid,
        cloud_id: &str,
        status: InstanceStatus,
        address: String,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        if status == InstanceStatus::Deleted {
            return Ok(());
        }
        if status.is_active() && self.store.has_active_in_region(region).await? {
            tracing::warn!(
                region,
                instance_uuid = %owner,
                "adopting a second active instance in region"
            );
        }
        let new = NewInstance {
            uuid: owner,
            region: region.to_string(),
            cloud_id: cloud_id.to_string(),
            public_address: address,
            status,
        };
        match self.store.create(new).await {
            Ok(record) => {
                tracing::info!(
                    instance_uuid = %owner,
                    region,
                    cloud_id,
                    status = %record.status,
                    "adopted untracked server"
                );
                report.created += 1;
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                tracing::warn!(
                    instance_uuid = %owner,
                    cloud_id,
                    "server belongs to a deleted record, ignoring"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Task for CloudReconciler {
    fn name(&self) -> &str {
        TASK_NAME
    }

    async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.sync_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(every = ?self.settings.sync_interval, "cloud reconciler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.reconcile_once().await {
                Ok(report) if report.changes() > 0 || !report.is_clean() => {
                    tracing::info!(
                        updated = report.updated,
                        adopted = report.adopted,
                        created = report.created,
                        deleted = report.deleted,
                        failed_regions = ?report.failed_regions,
                        store_errors = report.store_errors,
                        "reconciliation pass applied changes"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "reconciliation pass failed"),
            }
        }
        tracing::info!("cloud reconciler stopped");
    }
}
