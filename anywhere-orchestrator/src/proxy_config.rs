//! Local proxy daemon config: one VMess outbound per region pointing at the
//! region's instance, plus the relay inbounds clients connect through.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::settings::LocalProxySettings;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid proxy config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("proxy config root must be a JSON object")]
    Shape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub port: u16,
    pub client_id: String,
}

#[async_trait]
pub trait ProxyPublisher: Send + Sync {
    /// Adds or replaces the outbound named `tag`.
    async fn publish(
        &self,
        tag: &str,
        address: &str,
        port: u16,
        secret: &str,
    ) -> Result<(), PublishError>;

    /// Drops the outbound named `tag`. `false` when there was none.
    async fn remove(&self, tag: &str) -> Result<bool, PublishError>;

    /// Inbound port and client id of the relay user `relay_user`, if configured.
    async fn relay_endpoint(&self, relay_user: &str) -> Result<Option<RelayEndpoint>, PublishError>;
}

pub fn outbound_tag(provider: &str, region: &str) -> String {
    format!("out_{}_{}", provider, region.replace('-', "_"))
}

pub fn relay_user(provider: &str, region: &str) -> String {
    format!("user_{}_{}", provider, region)
}

pub struct LocalProxyConfig {
    path: PathBuf,
    restart_cmd: Vec<String>,
    /// Held across read, write and restart so concurrent edits do not drop each other.
    edit: Mutex<()>,
}

impl LocalProxyConfig {
    pub fn new(settings: &LocalProxySettings) -> Self {
        Self {
            path: settings.config_path.clone(),
            restart_cmd: settings.restart_cmd.clone(),
            edit: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Value, PublishError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| PublishError::Read {
                path: self.path.clone(),
                source,
            })?;
        let value: Value = serde_json::from_str(&raw)?;
        if !value.is_object() {
            return Err(PublishError::Shape);
        }
        Ok(value)
    }

    /// Writes a sibling temp file and renames it over the config, so the live
    /// file is always complete.
    async fn write(&self, config: &Value) -> Result<(), PublishError> {
        let data = serde_json::to_vec_pretty(config)?;
        let staged = self.path.with_extension("json.tmp");
        let write_err = |source: std::io::Error| PublishError::Write {
            path: self.path.clone(),
            source,
        };

        if let Err(source) = tokio::fs::write(&staged, &data).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(write_err(source));
        }
        tokio::fs::rename(&staged, &self.path).await.map_err(write_err)
    }

    /// Restarts the daemon. Failure is logged, not returned.
    async fn restart(&self) {
        let Some((program, args)) = self.restart_cmd.split_first() else {
            return;
        };
        let command = self.restart_cmd.join(" ");
        match tokio::process::Command::new(program).args(args).output().await {
            Ok(out) if out.status.success() => tracing::info!(%command, "proxy daemon restarted"),
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                tracing::warn!(
                    %command,
                    status = %out.status,
                    stderr = %stderr.trim(),
                    "proxy daemon restart failed"
                );
            }
            Err(e) => tracing::warn!(%command, error = %e, "proxy daemon restart failed"),
        }
    }
}

fn outbounds_mut(config: &mut Value) -> Result<&mut Vec<Value>, PublishError> {
    let root = config.as_object_mut().ok_or(PublishError::Shape)?;
    let entry = root.entry("outbounds").or_insert_with(|| json!([]));
    if !entry.is_array() {
        *entry = json!([]);
    }
    entry.as_array_mut().ok_or(PublishError::Shape)
}

fn vmess_outbound(tag: &str, address: &str, port: u16, secret: &str) -> Value {
    json!({
        "protocol": "vmess",
        "tag": tag,
        "settings": {
            "vnext": [{
                "address": address,
                "port": port,
                "users": [{ "id": secret, "alterId": 0 }]
            }]
        }
    })
}

#[async_trait]
impl ProxyPublisher for LocalProxyConfig {
    async fn publish(
        &self,
        tag: &str,
        address: &str,
        port: u16,
        secret: &str,
    ) -> Result<(), PublishError> {
        let _edit = self.edit.lock().await;
        let mut config = self.read().await?;
        let outbounds = outbounds_mut(&mut config)?;
        let outbound = vmess_outbound(tag, address, port, secret);
        match outbounds.iter_mut().find(|o| o["tag"] == tag) {
            Some(existing) => *existing = outbound,
            None => outbounds.push(outbound),
        }
        self.write(&config).await?;
        self.restart().await;
        tracing::info!(tag, address, "outbound published to local proxy");
        Ok(())
    }

    async fn remove(&self, tag: &str) -> Result<bool, PublishError> {
        let _edit = self.edit.lock().await;
        let mut config = self.read().await?;
        let outbounds = outbounds_mut(&mut config)?;
        let before = outbounds.len();
        outbounds.retain(|o| o["tag"] != tag);
        if outbounds.len() == before {
            return Ok(false);
        }
        self.write(&config).await?;
        self.restart().await;
        tracing::info!(tag, "outbound removed from local proxy");
        Ok(true)
    }

    async fn relay_endpoint(
        &self,
        relay_user: &str,
    ) -> Result<Option<RelayEndpoint>, PublishError> {
        let config = self.read().await?;
        let inbounds = config["inbounds"].as_array().cloned().unwrap_or_default();
        for inbound in inbounds.iter().filter(|i| i["protocol"] == "vmess") {
            let clients = inbound["settings"]["clients"].as_array().cloned().unwrap_or_default();
            let Some(client) = clients.iter().find(|c| c["email"] == relay_user) else {
                continue;
            };
            let port = inbound["port"].as_u64().and_then(|p| u16::try_from(p).ok());
            let id = client["id"].as_str();
            if let (Some(port), Some(id)) = (port, id) {
                return Ok(Some(RelayEndpoint {
                    port,
                    client_id: id.to_string(),
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn publisher(dir: &tempfile::TempDir, initial: &Value) -> LocalProxyConfig {
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_vec_pretty(initial).unwrap()).unwrap();
        LocalProxyConfig::new(&LocalProxySettings {
            config_path: path,
            restart_cmd: vec![],
        })
    }

    fn on_disk(p: &LocalProxyConfig) -> Value {
        serde_json::from_slice(&std::fs::read(p.path()).unwrap()).unwrap()
    }

    #[test]
    fn test_tag_naming() {
        assert_eq!(outbound_tag("scaleway", "fr-par-1"), "out_scaleway_fr_par_1");
        assert_eq!(relay_user("scaleway", "fr-par-1"), "user_scaleway_fr-par-1");
    }

    #[tokio::test]
    async fn test_publish_upserts_and_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let p = publisher(
            &dir,
            &json!({
                "log": {"loglevel": "warning"},
                "outbounds": [{"protocol": "freedom", "tag": "direct"}]
            }),
        );

        p.publish("out_mock_a", "203.0.113.5", 10086, "id-1").await.unwrap();
        p.publish("out_mock_a", "203.0.113.6", 10086, "id-2").await.unwrap();

        let config = on_disk(&p);
        assert_eq!(config["log"]["loglevel"], "warning");
        let outbounds = config["outbounds"].as_array().unwrap();
        assert_eq!(outbounds.len(), 2);
        assert_eq!(outbounds[1]["settings"]["vnext"][0]["address"], "203.0.113.6");
        assert_eq!(outbounds[1]["settings"]["vnext"][0]["users"][0]["id"], "id-2");
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_remove_drops_only_named_outbound() {
        let dir = tempfile::tempdir().unwrap();
        let p = publisher(&dir, &json!({"outbounds": [{"tag": "direct"}, {"tag": "out_mock_a"}]}));

        assert!(p.remove("out_mock_a").await.unwrap());
        assert!(!p.remove("out_mock_a").await.unwrap());
        let config = on_disk(&p);
        assert_eq!(config["outbounds"], json!([{"tag": "direct"}]));
    }

    #[tokio::test]
    async fn test_relay_endpoint_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let p = publisher(
            &dir,
            &json!({"inbounds": [
                {"protocol": "socks", "port": 1080},
                {"protocol": "vmess", "port": 20001, "settings": {"clients": [
                    {"id": "relay-id", "email": "user_mock_fr-par-1"}
                ]}}
            ]}),
        );

        let found = p.relay_endpoint("user_mock_fr-par-1").await.unwrap();
        assert_eq!(
            found,
            Some(RelayEndpoint {
                port: 20001,
                client_id: "relay-id".into()
            })
        );
        assert_eq!(p.relay_endpoint("user_mock_nl-ams-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_publishes_keep_every_outbound() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(publisher(&dir, &json!({"outbounds": [{"tag": "direct"}]})));

        let mut handles = Vec::new();
        for i in 0..10 {
            let p = p.clone();
            handles.push(tokio::spawn(async move {
                p.publish(&format!("out_mock_{i}"), &format!("203.0.113.{i}"), 10086, "id")
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let config = on_disk(&p);
        let outbounds = config["outbounds"].as_array().unwrap();
        assert_eq!(outbounds.len(), 11);
        for i in 0..10 {
            let tag = format!("out_mock_{i}");
            assert!(outbounds.iter().any(|o| o["tag"] == tag.as_str()), "{tag} missing");
        }

        let removals: Vec<_> = (0..5)
            .map(|i| {
                let p = p.clone();
                tokio::spawn(async move { p.remove(&format!("out_mock_{i}")).await })
            })
            .collect();
        for handle in removals {
            assert!(handle.await.unwrap().unwrap());
        }
        assert_eq!(on_disk(&p)["outbounds"].as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let p = LocalProxyConfig::new(&LocalProxySettings {
            config_path: PathBuf::from("/nonexistent/anywhere/config.json"),
            restart_cmd: vec![],
        });
        assert!(matches!(
            p.publish("t", "a", 1, "s").await,
            Err(PublishError::Read { .. })
        ));
    }
}
