mod add_balance_request;
mod deps_error;

pub use add_balance_request::AddBalanceRequest;
pub use deps_error::{LifecycleError, RegistryError, ReleaseFailure};
