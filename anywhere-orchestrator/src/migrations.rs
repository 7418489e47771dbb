use sqlx::{Pool, Postgres};

/// Applies `sqlx-migrations/` and checks the inventory table is in place.
pub async fn run_migrations(pool: &Pool<Postgres>) -> Result<(), sqlx::migrate::MigrateError> {
    if let Err(e) = sqlx::migrate!("../sqlx-migrations").run(pool).await {
        tracing::warn!(error = %e, "migration error (may be safe to ignore if applied manually)");

        let table_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(
               SELECT 1 FROM information_schema.tables WHERE table_name = 'proxy_instances'
             )",
        )
        .fetch_one(pool)
        .await
        .unwrap_or(false);

        if !table_exists {
            tracing::error!("table 'proxy_instances' does not exist; migrations must be applied");
            return Err(e);
        }
        tracing::info!("inventory table exists; continuing despite migration error");
    }
    Ok(())
}
