use crate::inventory::{CloudState, DiscoveredInstance};
use crate::{CloudProvider, OWNER_TAG_KEY};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

const API_BASE: &str = "https://api.scaleway.com/instance/v1";

pub struct ScalewayProvider {
    client: Client,
    base_url: String,
    project_id: String,
    secret_key: String,
}

impl ScalewayProvider {
    pub fn new(project_id: String, secret_key: String) -> Result<Self> {
        Self::with_base_url(project_id, secret_key, API_BASE)
    }

    pub fn with_base_url(project_id: String, secret_key: String, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("building Scaleway HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
        })
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Auth-Token",
            reqwest::header::HeaderValue::from_str(&self.secret_key)
                .context("Scaleway secret key is not a valid header value")?,
        );
        Ok(headers)
    }

    fn server_url(&self, zone: &str, server_id: &str) -> String {
        format!("{}/zones/{}/servers/{}", self.base_url, zone, server_id)
    }

    async fn server_action(&self, zone: &str, server_id: &str, action: &str) -> Result<()> {
        let url = format!("{}/action", self.server_url(zone, server_id));
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&json!({ "action": action }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(
                operation = action,
                zone,
                server_id,
                status = status.as_u16(),
                "Scaleway action failed"
            );
            anyhow::bail!("Scaleway {} failed: status={} body={}", action, status.as_u16(), body);
        }
        tracing::info!(operation = action, zone, server_id, "Scaleway action accepted");
        Ok(())
    }

    /// Uploads cloud-init, then powers the server on.
    async fn configure_and_boot(
        &self,
        zone: &str,
        server_id: &str,
        cloud_init: Option<&str>,
    ) -> Result<()> {
        if let Some(ci) = cloud_init.filter(|c| !c.trim().is_empty()) {
            let ud_url = format!("{}/user_data/cloud-init", self.server_url(zone, server_id));
            let resp = self
                .client
                .patch(&ud_url)
                .headers(self.headers()?)
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(ci.to_string())
                .send()
                .await?;
            if !resp.status().is_success() {
                let code = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!(
                    "Scaleway set cloud-init failed for {}: status={} body={}",
                    server_id,
                    code,
                    text
                );
            }
        }
        self.server_action(zone, server_id, "poweron").await
    }

    async fn fetch_server(&self, zone: &str, server_id: &str) -> Result<Option<Value>> {
        let url = self.server_url(zone, server_id);
        let resp = self.client.get(&url).headers(self.headers()?).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Scaleway get server failed: status={} body={}", status.as_u16(), body);
        }
        let mut json_resp: Value = resp.json().await?;
        Ok(Some(json_resp["server"].take()))
    }
}

/// Scaleway server states to the provider-neutral view.
pub fn map_state(state: &str) -> CloudState {
    match state.to_ascii_lowercase().as_str() {
        "starting" => CloudState::Pending,
        "running" => CloudState::Running,
        "stopping" => CloudState::Stopping,
        "stopped" | "stopped in place" | "stopped_in_place" => CloudState::Stopped,
        other => CloudState::Unknown(other.to_string()),
    }
}

/// Extracts the ownership tag from Scaleway's flat `key=value` tag list.
pub fn owner_tag(tags: &[Value]) -> Option<String> {
    let prefix = format!("{}=", OWNER_TAG_KEY);
    tags.iter()
        .filter_map(|t| t.as_str())
        .find_map(|t| t.strip_prefix(prefix.as_str()))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_server(zone: &str, server: &Value) -> Option<DiscoveredInstance> {
    let id = server["id"].as_str()?;
    let tags = server["tags"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    Some(DiscoveredInstance {
        provider_id: id.to_string(),
        name: server["name"].as_str().unwrap_or_default().to_string(),
        zone: zone.to_string(),
        state: map_state(server["state"].as_str().unwrap_or_default()),
        ip_address: server["public_ip"]["address"].as_str().map(str::to_string),
        owner_tag: owner_tag(tags),
        created_at: server["creation_date"].as_str().map(str::to_string),
    })
}

#[async_trait]
impl CloudProvider for ScalewayProvider {
    fn code(&self) -> &'static str {
        "scaleway"
    }

    async fn create_instance(
        &self,
        zone: &str,
        instance_type: &str,
        image_id: &str,
        cloud_init: Option<&str>,
        owner_tag: &str,
    ) -> Result<String> {
        let url = format!("{}/zones/{}/servers", self.base_url, zone);
        let short = owner_tag.chars().take(8).collect::<String>();
        let body = json!({
            "name": format!("anywhere-{}", short),
            "commercial_type": instance_type,
            "image": image_id,
            "project": self.project_id,
            "tags": ["anywhere", format!("{}={}", OWNER_TAG_KEY, owner_tag)],
            "dynamic_ip_required": true
        });

        tracing::info!(
            operation = "create",
            zone,
            instance_type,
            image_id,
            "Scaleway create server"
        );
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Scaleway create_instance failed: status={} body={}",
                status.as_u16(),
                text
            );
        }
        let json_resp: Value = resp.json().await?;
        let server_id = json_resp["server"]["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("No server id in create response"))?
            .to_string();

        // The server exists from here on; a failed setup must not leave it behind.
        if let Err(e) = self.configure_and_boot(zone, &server_id, cloud_init).await {
            tracing::warn!(
                operation = "create",
                zone,
                cloud_id = %server_id,
                error = %format!("{e:#}"),
                "Scaleway server setup failed, deleting it"
            );
            if let Err(cleanup) = self.terminate_instance(zone, &server_id).await {
                tracing::error!(
                    operation = "create",
                    zone,
                    cloud_id = %server_id,
                    error = %format!("{cleanup:#}"),
                    "could not delete half-created Scaleway server"
                );
            }
            return Err(e);
        }
        tracing::info!(
            operation = "create",
            zone,
            cloud_id = %server_id,
            "Scaleway server created"
        );
        Ok(server_id)
    }

    async fn terminate_instance(&self, zone: &str, server_id: &str) -> Result<bool> {
        let Some(server) = self.fetch_server(zone, server_id).await? else {
            return Ok(false);
        };
        // "terminate" only applies to powered-on servers; stopped ones are deleted directly.
        if map_state(server["state"].as_str().unwrap_or_default()) == CloudState::Stopped {
            let url = self.server_url(zone, server_id);
            let resp = self.client.delete(&url).headers(self.headers()?).send().await?;
            let status = resp.status();
            if !status.is_success() && status != StatusCode::NOT_FOUND {
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!(
                    "Scaleway delete server failed: status={} body={}",
                    status.as_u16(),
                    text
                );
            }
            tracing::info!(
                operation = "delete",
                zone,
                server_id,
                "Scaleway stopped server deleted"
            );
            return Ok(true);
        }
        self.server_action(zone, server_id, "terminate").await?;
        Ok(true)
    }

    async fn get_instance_ip(&self, zone: &str, server_id: &str) -> Result<Option<String>> {
        let server = self.fetch_server(zone, server_id).await?;
        Ok(server.and_then(|s| s["public_ip"]["address"].as_str().map(str::to_string)))
    }

    async fn describe_instance(
        &self,
        zone: &str,
        server_id: &str,
    ) -> Result<Option<DiscoveredInstance>> {
        let server = self.fetch_server(zone, server_id).await?;
        Ok(server.as_ref().and_then(|s| parse_server(zone, s)))
    }

    async fn list_instances(&self, zone: &str) -> Result<Vec<DiscoveredInstance>> {
        let url = format!("{}/zones/{}/servers", self.base_url, zone);
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let page_param = page.to_string();
            let resp = self
                .client
                .get(&url)
                .headers(self.headers()?)
                .query(&[
                    ("project", self.project_id.as_str()),
                    ("per_page", "100"),
                    ("page", page_param.as_str()),
                ])
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!(
                    "Scaleway list servers failed: status={} body={}",
                    status.as_u16(),
                    text
                );
            }
            let json_resp: Value = resp.json().await?;
            let servers = json_resp["servers"].as_array().cloned().unwrap_or_default();
            let count = servers.len();
            out.extend(servers.iter().filter_map(|s| parse_server(zone, s)));
            if count < 100 {
                break;
            }
            page += 1;
        }
        tracing::debug!(operation = "list", zone, count = out.len(), "Scaleway servers listed");
        Ok(out)
    }
}
