// Shared fixtures for the orchestrator integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anywhere_orchestrator::migrations::run_migrations;
use anywhere_orchestrator::settings::{RegionConfig, Settings};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

pub const REGION: &str = "fr-par-1";

pub fn test_settings() -> Arc<Settings> {
    settings_for_regions(&[(REGION, "Paris 1"), ("nl-ams-1", "Amsterdam 1")])
}

pub fn settings_for_regions(regions_in: &[(&str, &str)]) -> Arc<Settings> {
    let mut regions = BTreeMap::new();
    for &(code, name) in regions_in {
        regions.insert(
            code.to_string(),
            RegionConfig {
                name: name.to_string(),
                instance_type: "DEV1-S".into(),
                image: "ubuntu_jammy".into(),
            },
        );
    }
    Arc::new(Settings::new(regions))
}

/// Pool against `TEST_DATABASE_URL` with migrations applied, or `None` when
/// the variable is unset so Postgres tests can skip.
pub async fn get_test_db_pool() -> Option<Pool<Postgres>> {
    get_test_db_pool_with(PgPoolOptions::new().max_connections(5)).await
}

pub async fn get_test_db_pool_with(options: PgPoolOptions) -> Option<Pool<Postgres>> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = options
        .connect(&database_url)
        .await
        .expect("Failed to create test database pool");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations on test database");
    Some(pool)
}
