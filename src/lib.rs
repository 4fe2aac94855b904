pub mod clients;
pub mod config;
pub mod di;
pub mod entity;

// Re-export commonly used items
pub use clients::*;
pub use config::Settings;
pub use di::*;
pub use entity::*;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
