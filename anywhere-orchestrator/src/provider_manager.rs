use std::sync::Arc;

use anywhere_providers::CloudProvider;

use crate::settings::Settings;

pub struct ProviderManager;

impl ProviderManager {
    /// Builds the provider named by `name`. Only providers compiled in through
    /// cargo features are available.
    #[cfg_attr(
        not(any(feature = "provider-mock", feature = "provider-scaleway")),
        allow(unused_variables)
    )]
    pub fn get_provider(name: &str, settings: &Settings) -> anyhow::Result<Arc<dyn CloudProvider>> {
        match name.to_lowercase().as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => {
                tracing::info!(regions = settings.regions.len(), "mock provider configured");
                Ok(Arc::new(anywhere_providers::mock::MockProvider::simulated()))
            }
            #[cfg(feature = "provider-scaleway")]
            "scaleway" => {
                let project_id = std::env::var("SCALEWAY_PROJECT_ID")
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                // *_FILE first (Docker/K8s secrets), then the plain env var.
                let secret_key = std::env::var("SCALEWAY_SECRET_KEY_FILE")
                    .ok()
                    .and_then(|path| std::fs::read_to_string(path).ok())
                    .or_else(|| std::env::var("SCALEWAY_SECRET_KEY").ok())
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                if project_id.is_empty() || secret_key.is_empty() {
                    anyhow::bail!(
                        "scaleway provider needs SCALEWAY_PROJECT_ID and SCALEWAY_SECRET_KEY"
                    );
                }
                let provider =
                    anywhere_providers::scaleway::ScalewayProvider::new(project_id, secret_key)?;
                tracing::info!(regions = settings.regions.len(), "scaleway provider configured");
                Ok(Arc::new(provider))
            }
            other => anyhow::bail!("unknown or disabled provider {:?}", other),
        }
    }
}
