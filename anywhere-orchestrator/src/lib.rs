pub mod api;
pub mod bootstrap;
pub mod error;
pub mod migrations;
pub mod provider_manager;
pub mod provisioning;
pub mod proxy_config;
pub mod reconciliation_job;
pub mod scheduler;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod telemetry;
