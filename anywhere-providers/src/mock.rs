use crate::inventory::{CloudState, DiscoveredInstance};
use crate::CloudProvider;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// How servers evolve between calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockMode {
    /// Servers boot after `boot_polls` describes and vanish the same number
    /// of describes after terminate. Used when running the service locally.
    Simulated { boot_polls: u32 },
    /// Servers only change through the scripting methods. Used by tests.
    Manual,
}

#[derive(Clone, Debug)]
struct MockServer {
    zone: String,
    name: String,
    state: CloudState,
    ip: Option<String>,
    owner_tag: Option<String>,
    cloud_init: Option<String>,
    polls: u32,
}

impl MockServer {
    fn view(&self, id: &str) -> DiscoveredInstance {
        DiscoveredInstance {
            provider_id: id.to_string(),
            name: self.name.clone(),
            zone: self.zone.clone(),
            state: self.state.clone(),
            ip_address: self.ip.clone(),
            owner_tag: self.owner_tag.clone(),
            created_at: None,
        }
    }
}

#[derive(Default)]
struct MockState {
    servers: HashMap<String, MockServer>,
    next_id: u64,
    create_calls: usize,
    terminate_calls: usize,
    fail_creates: bool,
    fail_terminates: bool,
    failing_zones: HashSet<String>,
}

/// In-memory cloud. Nothing leaves the process.
pub struct MockProvider {
    state: Mutex<MockState>,
    mode: MockMode,
}

impl MockProvider {
    pub fn new(mode: MockMode) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            mode,
        }
    }

    pub fn simulated() -> Self {
        Self::new(MockMode::Simulated { boot_polls: 2 })
    }

    pub fn manual() -> Self {
        Self::new(MockMode::Manual)
    }

    pub async fn set_state(&self, server_id: &str, state: CloudState) {
        let mut guard = self.state.lock().await;
        if let Some(server) = guard.servers.get_mut(server_id) {
            server.state = state;
        }
    }

    pub async fn set_ip(&self, server_id: &str, ip: Option<&str>) {
        let mut guard = self.state.lock().await;
        if let Some(server) = guard.servers.get_mut(server_id) {
            server.ip = ip.map(str::to_string);
        }
    }

    /// Drops a server as if it had been deleted from the provider console.
    pub async fn remove_server(&self, server_id: &str) {
        self.state.lock().await.servers.remove(server_id);
    }

    /// Registers a server that was not created through this provider.
    pub async fn insert_server(&self, server: DiscoveredInstance) {
        let mut guard = self.state.lock().await;
        guard.servers.insert(
            server.provider_id.clone(),
            MockServer {
                zone: server.zone,
                name: server.name,
                state: server.state,
                ip: server.ip_address,
                owner_tag: server.owner_tag,
                cloud_init: None,
                polls: 0,
            },
        );
    }

    pub async fn fail_creates(&self, fail: bool) {
        self.state.lock().await.fail_creates = fail;
    }

    pub async fn fail_terminates(&self, fail: bool) {
        self.state.lock().await.fail_terminates = fail;
    }

    /// Makes every call against `zone` fail until cleared.
    pub async fn fail_zone(&self, zone: &str, fail: bool) {
        let mut guard = self.state.lock().await;
        if fail {
            guard.failing_zones.insert(zone.to_string());
        } else {
            guard.failing_zones.remove(zone);
        }
    }

    pub async fn create_calls(&self) -> usize {
        self.state.lock().await.create_calls
    }

    pub async fn terminate_calls(&self) -> usize {
        self.state.lock().await.terminate_calls
    }

    pub async fn cloud_init(&self, server_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .servers
            .get(server_id)
            .and_then(|s| s.cloud_init.clone())
    }

    /// Ids of every server carrying `owner_tag`.
    pub async fn servers_owned_by(&self, owner_tag: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .servers
            .iter()
            .filter(|(_, s)| s.owner_tag.as_deref() == Some(owner_tag))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn check_zone(guard: &MockState, zone: &str) -> Result<()> {
        if guard.failing_zones.contains(zone) {
            anyhow::bail!("mock zone {} unavailable", zone);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn code(&self) -> &'static str {
        "mock"
    }

    async fn create_instance(
        &self,
        zone: &str,
        _instance_type: &str,
        _image_id: &str,
        cloud_init: Option<&str>,
        owner_tag: &str,
    ) -> Result<String> {
        let mut guard = self.state.lock().await;
        guard.create_calls += 1;
        Self::check_zone(&guard, zone)?;
        if guard.fail_creates {
            anyhow::bail!("mock create_instance failure");
        }
        guard.next_id += 1;
        let id = format!("mock-{:04}", guard.next_id);
        let server = MockServer {
            zone: zone.to_string(),
            name: format!("anywhere-{}", id),
            state: CloudState::Pending,
            ip: None,
            owner_tag: Some(owner_tag.to_string()),
            cloud_init: cloud_init.map(str::to_string),
            polls: 0,
        };
        guard.servers.insert(id.clone(), server);
        tracing::debug!(zone, server_id = %id, "mock server created");
        Ok(id)
    }

    async fn terminate_instance(&self, zone: &str, server_id: &str) -> Result<bool> {
        let mut guard = self.state.lock().await;
        guard.terminate_calls += 1;
        Self::check_zone(&guard, zone)?;
        if guard.fail_terminates {
            anyhow::bail!("mock terminate_instance failure");
        }
        match guard.servers.get_mut(server_id) {
            Some(server) => {
                server.state = CloudState::ShuttingDown;
                server.polls = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_instance_ip(&self, zone: &str, server_id: &str) -> Result<Option<String>> {
        let guard = self.state.lock().await;
        Self::check_zone(&guard, zone)?;
        Ok(guard.servers.get(server_id).and_then(|s| s.ip.clone()))
    }

    async fn describe_instance(
        &self,
        zone: &str,
        server_id: &str,
    ) -> Result<Option<DiscoveredInstance>> {
        let mut guard = self.state.lock().await;
        Self::check_zone(&guard, zone)?;

        if let MockMode::Simulated { boot_polls } = self.mode {
            let next_ip = format!("198.51.100.{}", (guard.next_id % 250) + 1);
            let mut vanished = false;
            if let Some(server) = guard.servers.get_mut(server_id) {
                server.polls += 1;
                if server.polls >= boot_polls {
                    match server.state {
                        CloudState::Pending => {
                            server.state = CloudState::Running;
                            server.ip.get_or_insert(next_ip);
                        }
                        CloudState::ShuttingDown => vanished = true,
                        _ => {}
                    }
                }
            }
            if vanished {
                guard.servers.remove(server_id);
            }
        }

        Ok(guard.servers.get(server_id).map(|s| s.view(server_id)))
    }

    async fn list_instances(&self, zone: &str) -> Result<Vec<DiscoveredInstance>> {
        let guard = self.state.lock().await;
        Self::check_zone(&guard, zone)?;
        let mut out: Vec<DiscoveredInstance> = guard
            .servers
            .iter()
            .filter(|(_, s)| s.zone == zone && s.state != CloudState::Terminated)
            .map(|(id, s)| s.view(id))
            .collect();
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_server_boots_then_vanishes() {
        let provider = MockProvider::new(MockMode::Simulated { boot_polls: 2 });
        let id = provider
            .create_instance("zone-a", "DEV1-S", "ubuntu", Some("#!/bin/sh"), "owner-1")
            .await
            .unwrap();

        let first = provider.describe_instance("zone-a", &id).await.unwrap().unwrap();
        assert_eq!(first.state, CloudState::Pending);
        let second = provider.describe_instance("zone-a", &id).await.unwrap().unwrap();
        assert_eq!(second.state, CloudState::Running);
        assert!(second.ip_address.is_some());

        assert!(provider.terminate_instance("zone-a", &id).await.unwrap());
        provider.describe_instance("zone-a", &id).await.unwrap();
        assert!(provider.describe_instance("zone-a", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_excludes_terminated_and_other_zones() {
        let provider = MockProvider::manual();
        let a = provider.create_instance("zone-a", "t", "i", None, "u1").await.unwrap();
        let b = provider.create_instance("zone-a", "t", "i", None, "u2").await.unwrap();
        provider.create_instance("zone-b", "t", "i", None, "u3").await.unwrap();
        provider.set_state(&b, CloudState::Terminated).await;

        let listed = provider.list_instances("zone-a").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].provider_id, a);
        assert_eq!(listed[0].owner_tag.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_failing_zone_errors() {
        let provider = MockProvider::manual();
        provider.fail_zone("zone-a", true).await;
        assert!(provider.list_instances("zone-a").await.is_err());
        assert!(provider.list_instances("zone-b").await.is_ok());
    }
}
