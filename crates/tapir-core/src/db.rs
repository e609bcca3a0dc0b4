//! PostgreSQL pool plumbing

use sqlx::{Pool, Postgres};

use crate::config::DatabaseConfig;

/// Create PostgreSQL connection pool
pub async fn create_pool(config: &DatabaseConfig) -> crate::Result<Pool<Postgres>> {
    use sqlx::postgres::PgPoolOptions;

    let database_url = format!(
        "postgres://{}:{}@{}:{}/{}",
        config.username, config.password, config.host, config.port, config.database
    );

    tracing::info!(
        "Connecting to PostgreSQL at {}:{}/{}...",
        config.host,
        config.port,
        config.database
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect(&database_url)
        .await
        .map_err(crate::Error::Database)?;

    tracing::info!("PostgreSQL connected successfully");
    Ok(pool)
}
