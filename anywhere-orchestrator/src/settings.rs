use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anywhere_common::RegionInfo;
use anywhere_providers::wait::WaitPolicy;
use serde::Deserialize;

/// One deployable region. The map key is the provider zone code.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegionConfig {
    /// Human readable name, shown in listings and share-link remarks.
    pub name: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default = "default_image")]
    pub image: String,
}

fn default_instance_type() -> String {
    "DEV1-S".to_string()
}

fn default_image() -> String {
    "ubuntu_jammy".to_string()
}

#[derive(Debug, Deserialize)]
struct RegionsFile {
    #[serde(default)]
    regions: BTreeMap<String, RegionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProxySettings {
    pub config_path: PathBuf,
    /// argv of the command that reloads the local daemon; empty disables it.
    pub restart_cmd: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("cannot read regions file {path}: {source}")]
    RegionsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse regions file: {0}")]
    RegionsParse(#[from] toml::de::Error),
    #[error("{0}")]
    Validation(String),
}

/// Immutable process configuration, built once and shared by `Arc`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub provider: String,
    pub regions: BTreeMap<String, RegionConfig>,
    pub sync_interval: Duration,
    pub wait: WaitPolicy,
    pub shutdown_grace: Duration,
    /// Port the bootstrap payload binds the proxy daemon to.
    pub proxy_port: u16,
    pub local_proxy: Option<LocalProxySettings>,
    pub relay_host: Option<String>,
}

impl Settings {
    /// Defaults for everything but the region table. Used by tests and as the
    /// base for [`Settings::from_env`].
    pub fn new(regions: BTreeMap<String, RegionConfig>) -> Self {
        Self {
            database_url: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            provider: "mock".to_string(),
            regions,
            sync_interval: Duration::from_secs(60),
            wait: WaitPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
            proxy_port: 10086,
            local_proxy: None,
            relay_host: None,
        }
    }

    pub fn from_env() -> Result<Self, SettingsError> {
        let regions_path = env_or("REGIONS_FILE", "regions.toml");
        let regions = load_regions(Path::new(&regions_path))?;

        let mut settings = Self::new(regions);
        settings.database_url = env_opt("DATABASE_URL");
        settings.bind_addr = env_parse("BIND_ADDR", settings.bind_addr)?;
        settings.provider = env_or("PROVIDER", &settings.provider).to_lowercase();
        settings.sync_interval =
            Duration::from_secs(env_parse("INSTANCE_SYNC_INTERVAL_SECS", 60u64)?);
        settings.wait = WaitPolicy {
            interval: Duration::from_secs(env_parse("INSTANCE_POLL_INTERVAL_SECS", 5u64)?),
            timeout: Duration::from_secs(env_parse("INSTANCE_WAIT_TIMEOUT_SECS", 300u64)?),
        };
        settings.shutdown_grace = Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 30u64)?);
        settings.proxy_port = env_parse("PROXY_PORT", settings.proxy_port)?;
        settings.local_proxy = env_opt("LOCAL_PROXY_CONFIG_PATH").map(|path| LocalProxySettings {
            config_path: PathBuf::from(path),
            restart_cmd: env_or("LOCAL_PROXY_RESTART_CMD", "sudo systemctl restart v2ray")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        });
        settings.relay_host = env_opt("RELAY_HOST");

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.regions.is_empty() {
            return Err(SettingsError::Validation("no regions configured".into()));
        }
        if self.sync_interval.is_zero()
            || self.wait.interval.is_zero()
            || self.wait.timeout.is_zero()
        {
            return Err(SettingsError::Validation("intervals and timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn region(&self, code: &str) -> Option<&RegionConfig> {
        self.regions.get(code)
    }

    pub fn region_infos(&self) -> Vec<RegionInfo> {
        self.regions
            .iter()
            .map(|(code, cfg)| RegionInfo {
                region: code.clone(),
                display_name: cfg.name.clone(),
            })
            .collect()
    }

    /// Display name of `code`, falling back to the code itself.
    pub fn region_name(&self, code: &str) -> String {
        self.region(code)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| code.to_string())
    }
}

pub fn parse_regions(raw: &str) -> Result<BTreeMap<String, RegionConfig>, SettingsError> {
    let file: RegionsFile = toml::from_str(raw)?;
    Ok(file.regions)
}

fn load_regions(path: &Path) -> Result<BTreeMap<String, RegionConfig>, SettingsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::RegionsFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_regions(&raw)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, SettingsError> {
    match env_opt(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| SettingsError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_regions_applies_defaults() {
        let regions = parse_regions(
            r#"
            [regions.fr-par-1]
            name = "Paris 1"
            instance_type = "PLAY2-PICO"

            [regions.nl-ams-1]
            name = "Amsterdam 1"
            "#,
        )
        .unwrap();

        assert_eq!(regions.len(), 2);
        assert_eq!(regions["fr-par-1"].instance_type, "PLAY2-PICO");
        assert_eq!(regions["nl-ams-1"].instance_type, "DEV1-S");
        assert_eq!(regions["nl-ams-1"].image, "ubuntu_jammy");
    }

    #[test]
    fn test_validate_rejects_empty_regions() {
        let settings = Settings::new(BTreeMap::new());
        assert!(matches!(settings.validate(), Err(SettingsError::Validation(_))));
    }

    #[test]
    fn test_region_infos_are_sorted_by_code() {
        let regions = parse_regions(
            r#"
            [regions.pl-waw-1]
            name = "Warsaw 1"
            [regions.fr-par-2]
            name = "Paris 2"
            "#,
        )
        .unwrap();
        let settings = Settings::new(regions);
        let infos = settings.region_infos();
        assert_eq!(infos[0].region, "fr-par-2");
        assert_eq!(infos[1].display_name, "Warsaw 1");
        assert_eq!(settings.region_name("unknown"), "unknown");
    }
}
