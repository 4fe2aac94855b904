pub mod db;
pub mod http;
pub mod openai;
pub mod telemetry;

pub use db::create_db_pool;
pub use http::create_http_client;
pub use openai::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, OpenAiClient};
pub use telemetry::StatsClient;
