//! Telegram bot backend - shared client lifecycle
//!
//! Acquires the database pool, HTTP client, OpenAI client and StatsD client,
//! keeps them available while the bot runs, and releases them all on Ctrl+C.
use anyhow::Context;
use dotenv::dotenv;
use log::info;
use std::sync::Arc;
use tgbot_deps::{use_all, ServiceContainer, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logging with default level of "info"
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    info!("Starting Telegram bot backend v{}", tgbot_deps::VERSION);

    let settings = Settings::from_env()?;

    use_all(&settings, run).await?;

    info!("All clients released");
    Ok(())
}

/// Runs while every shared client is available
async fn run(services: Arc<ServiceContainer>) -> anyhow::Result<()> {
    let telemetry = services.telemetry()?;
    telemetry.incr("startup");
    telemetry.flush()?;

    info!("All clients ready. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down...");
    telemetry.incr("shutdown");
    Ok(())
}
