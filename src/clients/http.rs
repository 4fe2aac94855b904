use anyhow::{Context, Result};
use reqwest::Client;

/// Shared outbound HTTP client for plain web requests
pub fn create_http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("tgbot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}
