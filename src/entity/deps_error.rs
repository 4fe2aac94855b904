use std::fmt;

use crate::di::LifecycleState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry slot `{0}` read before it was initialized")]
    NotInitialized(&'static str),

    #[error("Registry slot `{0}` is already initialized")]
    AlreadyInitialized(&'static str),
}

/// A resource whose release step returned an error
#[derive(Debug)]
pub struct ReleaseFailure {
    pub resource: &'static str,
    pub error: anyhow::Error,
}

impl fmt::Display for ReleaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.resource, self.error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Failed to acquire {resource}: {source:#}")]
    Acquire {
        resource: &'static str,
        source: anyhow::Error,
    },

    #[error("Failed to release {}", format_failures(.0))]
    Release(Vec<ReleaseFailure>),

    #[error("Scope body failed: {0:#}")]
    Body(anyhow::Error),

    #[error("Cannot {operation} while lifecycle is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn format_failures(failures: &[ReleaseFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
