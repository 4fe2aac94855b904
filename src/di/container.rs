use sqlx::PgPool;

use crate::clients::{OpenAiClient, StatsClient};
use crate::di::registry::RegistryValue;
use crate::entity::RegistryError;

/// ServiceContainer provides access to the shared clients of the bot.
///
/// It is handed to request handlers as `Arc<ServiceContainer>`. Each slot is
/// filled exactly once while the lifecycle scope acquires its resources.
#[derive(Debug)]
pub struct ServiceContainer {
    db: RegistryValue<PgPool>,
    http_client: RegistryValue<reqwest::Client>,
    openai_client: RegistryValue<OpenAiClient>,
    telemetry: RegistryValue<StatsClient>,
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self {
            db: RegistryValue::new("db"),
            http_client: RegistryValue::new("http_client"),
            openai_client: RegistryValue::new("openai_client"),
            telemetry: RegistryValue::new("telemetry"),
        }
    }

    // Publishing

    pub fn publish_db(&self, pool: PgPool) -> Result<(), RegistryError> {
        self.db.set(pool)
    }

    pub fn publish_http_client(&self, client: reqwest::Client) -> Result<(), RegistryError> {
        self.http_client.set(client)
    }

    pub fn publish_openai_client(&self, client: OpenAiClient) -> Result<(), RegistryError> {
        self.openai_client.set(client)
    }

    pub fn publish_telemetry(&self, client: StatsClient) -> Result<(), RegistryError> {
        self.telemetry.set(client)
    }

    // Accessor methods

    pub fn db_pool(&self) -> Result<PgPool, RegistryError> {
        self.db.cloned()
    }

    pub fn http_client(&self) -> Result<reqwest::Client, RegistryError> {
        self.http_client.cloned()
    }

    pub fn openai_client(&self) -> Result<OpenAiClient, RegistryError> {
        self.openai_client.cloned()
    }

    pub fn telemetry(&self) -> Result<StatsClient, RegistryError> {
        self.telemetry.cloned()
    }

    /// True once every client has been published
    pub fn is_ready(&self) -> bool {
        self.db.is_set()
            && self.http_client.is_set()
            && self.openai_client.is_set()
            && self.telemetry.is_set()
    }
}
