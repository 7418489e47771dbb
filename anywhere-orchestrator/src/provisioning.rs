//! Provisioning orchestrator: admission of create/delete requests and the
//! detached workflows that drive each instance through its lifecycle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anywhere_common::share_link::vmess_link;
use anywhere_common::{InstanceRecord, InstanceStatus, NewInstance, RegionInfo};
use anywhere_providers::wait::{wait_until_running, wait_until_terminated};
use anywhere_providers::CloudProvider;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::bootstrap;
use crate::error::{OrchestratorError, WorkflowError};
use crate::proxy_config::{outbound_tag, relay_user, ProxyPublisher};
use crate::settings::{RegionConfig, Settings};
use crate::state_machine;
use crate::store::InventoryStore;

/// Result of a step whose failure must not change the workflow outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Skipped,
    Failed(String),
}

fn log_step(step: &'static str, outcome: StepOutcome) {
    match outcome {
        StepOutcome::Applied => tracing::debug!(step, "step applied"),
        StepOutcome::Skipped => tracing::debug!(step, "step skipped"),
        StepOutcome::Failed(reason) => {
            tracing::warn!(step, %reason, "best-effort step failed, continuing")
        }
    }
}

/// Everything a detached workflow needs, cloned into each spawned task.
#[derive(Clone)]
struct Workflow {
    store: Arc<dyn InventoryStore>,
    provider: Arc<dyn CloudProvider>,
    settings: Arc<Settings>,
    publisher: Option<Arc<dyn ProxyPublisher>>,
    cancel: CancellationToken,
}

pub struct ProvisioningService {
    workflow: Workflow,
    tracker: TaskTracker,
}

impl ProvisioningService {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        provider: Arc<dyn CloudProvider>,
        settings: Arc<Settings>,
        publisher: Option<Arc<dyn ProxyPublisher>>,
    ) -> Self {
        Self {
            workflow: Workflow {
                store,
                provider,
                settings,
                publisher,
                cancel: CancellationToken::new(),
            },
            tracker: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.workflow.settings
    }

    /// Number of creation/teardown workflows still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Admits a create for `region`. Returns the uuid of the region's active
    /// instance when there is one, otherwise inserts a pending record and
    /// starts its creation workflow.
    pub async fn request_create(&self, region: &str) -> Result<Uuid, OrchestratorError> {
        let region_cfg = self
            .workflow
            .settings
            .region(region)
            .cloned()
            .ok_or_else(|| OrchestratorError::InvalidRegion(region.to_string()))?;
        let store = self.workflow.store.as_ref();

        let mut lock = store.lock().await?;
        if let Some(existing) = lock.get_active_in_region(region).await? {
            lock.unlock().await?;
            tracing::info!(
                region,
                instance_uuid = %existing.uuid,
                status = %existing.status,
                "region already has an active instance"
            );
            return Ok(existing.uuid);
        }
        let uuid = Uuid::new_v4();
        lock.create(NewInstance::pending(uuid, region)).await?;
        lock.unlock().await?;

        let duplicates = store
            .list_active()
            .await?
            .into_iter()
            .filter(|r| r.region == region && r.is_active() && r.uuid != uuid)
            .count();
        if duplicates > 0 {
            tracing::error!(
                region,
                instance_uuid = %uuid,
                duplicates,
                "duplicate active instance after insert, rolling back"
            );
            state_machine::to_deleted(store, uuid, "duplicate active instance").await?;
            return Err(OrchestratorError::ConcurrencyViolation(region.to_string()));
        }

        tracing::info!(region, instance_uuid = %uuid, "instance admitted");
        let span = tracing::info_span!("create_workflow", instance_uuid = %uuid, region);
        let workflow = self.workflow.clone();
        let region = region.to_string();
        self.tracker
            .spawn(async move { workflow.create(uuid, region, region_cfg).await }.instrument(span));
        Ok(uuid)
    }

    /// Moves the record to deleting and starts its teardown workflow.
    pub async fn request_delete(&self, uuid: Uuid) -> Result<(), OrchestratorError> {
        let store = self.workflow.store.as_ref();
        let record = store
            .get_by_uuid(uuid)
            .await?
            .ok_or(OrchestratorError::NotFound(uuid))?;
        if !state_machine::to_deleting(store, uuid).await? {
            return Err(OrchestratorError::NotFound(uuid));
        }

        let span = tracing::info_span!(
            "teardown_workflow",
            instance_uuid = %uuid,
            region = %record.region
        );
        let workflow = self.workflow.clone();
        self.tracker
            .spawn(async move { workflow.teardown(uuid).await }.instrument(span));
        Ok(())
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>, OrchestratorError> {
        Ok(self.workflow.store.list_active().await?)
    }

    pub async fn get_instance(&self, uuid: Uuid) -> Result<InstanceRecord, OrchestratorError> {
        self.workflow
            .store
            .get_by_uuid(uuid)
            .await?
            .ok_or(OrchestratorError::NotFound(uuid))
    }

    pub fn list_regions(&self) -> Vec<RegionInfo> {
        self.workflow.settings.region_infos()
    }

    /// Waits for every workflow started so far to return.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Drains for up to `grace`, then cancels what is left and drains again.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!(in_flight = self.tracker.len(), ?grace, "draining workflows");
        if tokio::time::timeout(grace, self.drain()).await.is_err() {
            tracing::warn!(
                in_flight = self.tracker.len(),
                "grace period elapsed, cancelling workflows"
            );
            self.workflow.cancel.cancel();
            self.drain().await;
        }
        tracing::info!("all workflows finished");
    }
}

impl Workflow {
    /// Runs a provider call, giving up early when the service is shut down.
    async fn guard<T, F>(&self, call: F) -> Result<T, WorkflowError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WorkflowError::Cancelled),
            res = call => res.map_err(WorkflowError::Provider),
        }
    }

    async fn create(self, uuid: Uuid, region: String, cfg: RegionConfig) {
        match self.run_create(uuid, &region, &cfg).await {
            Ok(()) => {}
            Err(WorkflowError::Cancelled) => {
                tracing::warn!("creation workflow cancelled, record left as is");
            }
            Err(e) => {
                tracing::error!(error = %e, "creation workflow failed");
                let reason = e.to_string();
                if let Err(e) = state_machine::to_error(self.store.as_ref(), uuid, &reason).await {
                    tracing::error!(error = %e, "could not record creation failure");
                }
            }
        }
    }

    async fn run_create(
        &self,
        uuid: Uuid,
        region: &str,
        cfg: &RegionConfig,
    ) -> Result<(), WorkflowError> {
        let store = self.store.as_ref();
        if !state_machine::pending_to_creating(store, uuid).await? {
            return Ok(());
        }

        let payload = bootstrap::render_cloud_init(uuid, self.settings.proxy_port);
        let owner = uuid.to_string();
        let cloud_id = self
            .guard(self.provider.create_instance(
                region,
                &cfg.instance_type,
                &cfg.image,
                Some(&payload),
                &owner,
            ))
            .await?;
        tracing::info!(
            operation = "create_instance",
            region,
            cloud_id = %cloud_id,
            "cloud instance requested"
        );

        if !store
            .attach_cloud_id(uuid, &cloud_id, InstanceStatus::Creating)
            .await?
        {
            tracing::warn!(
                cloud_id = %cloud_id,
                "record left creating before the server was attached, terminating it"
            );
            if let Err(e) = self.provider.terminate_instance(region, &cloud_id).await {
                tracing::warn!(
                    cloud_id = %cloud_id,
                    error = %format!("{e:#}"),
                    "orphan terminate failed"
                );
            }
            return Ok(());
        }

        let server = wait_until_running(
            self.provider.as_ref(),
            region,
            &cloud_id,
            self.settings.wait,
            &self.cancel,
        )
        .await?;
        let address = match server.ip_address.filter(|ip| !ip.is_empty()) {
            Some(ip) => ip,
            None => self
                .guard(self.provider.get_instance_ip(region, &cloud_id))
                .await?
                .filter(|ip| !ip.is_empty())
                .ok_or(WorkflowError::NoAddress)?,
        };
        tracing::info!(
            operation = "get_instance_ip",
            region,
            cloud_id = %cloud_id,
            %address,
            "instance running"
        );

        let tag = outbound_tag(self.provider.code(), region);
        log_step("publish_outbound", self.publish(&tag, &address, uuid).await);

        if !state_machine::creating_to_running(store, uuid, &address).await? {
            return Ok(());
        }
        log_step("share_links", self.store_links(uuid, region, &address).await);
        Ok(())
    }

    async fn publish(&self, tag: &str, address: &str, uuid: Uuid) -> StepOutcome {
        let Some(publisher) = &self.publisher else {
            return StepOutcome::Skipped;
        };
        match publisher
            .publish(tag, address, self.settings.proxy_port, &uuid.to_string())
            .await
        {
            Ok(()) => StepOutcome::Applied,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    async fn unpublish(&self, tag: &str) -> StepOutcome {
        let Some(publisher) = &self.publisher else {
            return StepOutcome::Skipped;
        };
        match publisher.remove(tag).await {
            Ok(true) => StepOutcome::Applied,
            Ok(false) => StepOutcome::Skipped,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    async fn store_links(&self, uuid: Uuid, region: &str, address: &str) -> StepOutcome {
        let remark = self.settings.region_name(region);
        let client_id = uuid.to_string();
        let direct = match vmess_link(address, self.settings.proxy_port, &client_id, &remark) {
            Ok(link) => link,
            Err(e) => return StepOutcome::Failed(e.to_string()),
        };
        let relay = self.relay_link(region, &remark).await;
        match self.store.set_links(uuid, &direct, &relay).await {
            Ok(true) => StepOutcome::Applied,
            Ok(false) => StepOutcome::Skipped,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    /// Relay share link, empty when no relay is configured for the region.
    async fn relay_link(&self, region: &str, remark: &str) -> String {
        let (Some(host), Some(publisher)) = (&self.settings.relay_host, &self.publisher) else {
            return String::new();
        };
        let user = relay_user(self.provider.code(), region);
        match publisher.relay_endpoint(&user).await {
            Ok(Some(relay)) => {
                let relay_remark = format!("{} (relay)", remark);
                vmess_link(host, relay.port, &relay.client_id, &relay_remark).unwrap_or_default()
            }
            Ok(None) => {
                tracing::debug!(relay_user = %user, "no relay inbound for region");
                String::new()
            }
            Err(e) => {
                tracing::warn!(relay_user = %user, error = %e, "relay lookup failed");
                String::new()
            }
        }
    }

    async fn teardown(self, uuid: Uuid) {
        match self.run_teardown(uuid).await {
            Ok(()) => {}
            Err(WorkflowError::Cancelled) => {
                tracing::warn!("teardown workflow cancelled, record left as is");
            }
            Err(e) => {
                tracing::error!(error = %e, "teardown workflow failed");
                let reason = e.to_string();
                if let Err(e) = state_machine::to_error(self.store.as_ref(), uuid, &reason).await {
                    tracing::error!(error = %e, "could not record teardown failure");
                }
            }
        }
    }

    async fn run_teardown(&self, uuid: Uuid) -> Result<(), WorkflowError> {
        let store = self.store.as_ref();
        let Some(record) = store.get_by_uuid(uuid).await? else {
            return Ok(());
        };

        let tag = outbound_tag(self.provider.code(), &record.region);
        log_step("remove_outbound", self.unpublish(&tag).await);

        if !record.has_cloud_resource() {
            state_machine::to_deleted(store, uuid, "no cloud resource attached").await?;
            return Ok(());
        }

        let region = record.region.as_str();
        let cloud_id = record.cloud_id.as_str();
        let existed = self
            .guard(self.provider.terminate_instance(region, cloud_id))
            .await?;
        tracing::info!(
            operation = "terminate_instance",
            region,
            cloud_id,
            existed,
            "termination requested"
        );

        if existed {
            let provider = self.provider.as_ref();
            wait_until_terminated(provider, region, cloud_id, self.settings.wait, &self.cancel)
                .await?;
        }
        state_machine::to_deleted(store, uuid, "cloud instance terminated").await?;
        Ok(())
    }
}
