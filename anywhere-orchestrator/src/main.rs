use std::sync::Arc;

use anyhow::Context;
use anywhere_orchestrator::api::{self, AppState};
use anywhere_orchestrator::migrations::run_migrations;
use anywhere_orchestrator::provider_manager::ProviderManager;
use anywhere_orchestrator::provisioning::ProvisioningService;
use anywhere_orchestrator::proxy_config::{LocalProxyConfig, ProxyPublisher};
use anywhere_orchestrator::reconciliation_job::CloudReconciler;
use anywhere_orchestrator::scheduler::Scheduler;
use anywhere_orchestrator::settings::Settings;
use anywhere_orchestrator::store::{InventoryStore, MemoryStore, PgStore};
use anywhere_orchestrator::telemetry;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    telemetry::init_tracing();

    let settings = Arc::new(Settings::from_env().context("invalid configuration")?);
    tracing::info!(
        provider = %settings.provider,
        regions = settings.regions.len(),
        bind = %settings.bind_addr,
        "anywhere orchestrator starting"
    );

    let store: Arc<dyn InventoryStore> = match &settings.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;
            run_migrations(&pool).await.context("failed to run migrations")?;
            tracing::info!("inventory store: postgres");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, inventory kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let provider = ProviderManager::get_provider(&settings.provider, &settings)?;
    let publisher: Option<Arc<dyn ProxyPublisher>> = settings.local_proxy.as_ref().map(|local| {
        tracing::info!(path = %local.config_path.display(), "publishing endpoints to local proxy");
        Arc::new(LocalProxyConfig::new(local)) as Arc<dyn ProxyPublisher>
    });

    let service = Arc::new(ProvisioningService::new(
        store.clone(),
        provider.clone(),
        settings.clone(),
        publisher,
    ));

    let scheduler = Scheduler::new();
    scheduler
        .register(Arc::new(CloudReconciler::new(store, provider, settings.clone())))
        .await;
    scheduler.start().await;

    let app = api::create_router(AppState::new(service.clone()));
    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    scheduler.stop().await;
    service.shutdown(settings.shutdown_grace).await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
