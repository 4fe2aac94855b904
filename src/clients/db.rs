use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Open a PostgreSQL connection pool and verify it can connect
pub async fn create_db_pool(dsn: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(dsn)
        .await
        .context("Failed to create database connection pool")?;

    Ok(pool)
}

/// Close every connection in the pool, waiting for checked-out ones to return
pub async fn close_db_pool(pool: PgPool) -> Result<()> {
    pool.close().await;
    info!("Database pool closed");
    Ok(())
}
