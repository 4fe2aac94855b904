use std::fmt;
use std::sync::OnceLock;

use log::debug;

use crate::entity::RegistryError;

/// Named slot holding at most one value of `T`.
///
/// The slot is written once while resources are being acquired and read any
/// number of times afterwards. A second write is rejected so that double
/// initialization shows up as an error instead of silently replacing a live
/// client.
pub struct RegistryValue<T> {
    name: &'static str,
    value: OnceLock<T>,
}

impl<T> RegistryValue<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Store `value`, failing if the slot already holds one
    pub fn set(&self, value: T) -> Result<(), RegistryError> {
        self.value
            .set(value)
            .map_err(|_| RegistryError::AlreadyInitialized(self.name))?;
        debug!("Registry slot `{}` initialized", self.name);
        Ok(())
    }

    pub fn get(&self) -> Result<&T, RegistryError> {
        self.value
            .get()
            .ok_or(RegistryError::NotInitialized(self.name))
    }

    pub fn is_set(&self) -> bool {
        self.value.get().is_some()
    }
}

impl<T: Clone> RegistryValue<T> {
    /// Owned copy of the stored value; clients here are cheap handles
    pub fn cloned(&self) -> Result<T, RegistryError> {
        self.get().cloned()
    }
}

impl<T> fmt::Debug for RegistryValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryValue")
            .field("name", &self.name)
            .field("initialized", &self.is_set())
            .finish()
    }
}
