pub mod container;
pub mod lifecycle;
pub mod registry;

pub use container::ServiceContainer;
pub use lifecycle::{compose, use_all, LifecycleState, ResourceStack};
pub use registry::RegistryValue;
