//! Hierarchy configuration

use std::path::PathBuf;

use tokio::runtime::Handle;

use crate::error::ConfigError;

/// Environment variable overriding the store path
pub const ENV_STORE_PATH: &str = "STRATA_STORE_PATH";
/// Environment variable overriding the save event channel capacity
pub const ENV_EVENT_CAPACITY: &str = "STRATA_EVENT_CAPACITY";

/// Configuration for a [`Hierarchy`](crate::Hierarchy).
#[derive(Debug, Clone)]
pub struct HierarchyConfig {
    /// Path of the single store file.
    pub store_path: PathBuf,
    /// Capacity of the bounded save event channel.
    pub event_capacity: usize,
    /// Runtime the Read layer is bound to. Defaults to `runtime`.
    pub ui_runtime: Option<Handle>,
    /// Runtime for Root, Bulk-Write, disposable layers and the coordinator.
    /// Defaults to the runtime `Hierarchy::open` is called on.
    pub runtime: Option<Handle>,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("strata.db"),
            event_capacity: 64,
            ui_runtime: None,
            runtime: None,
        }
    }
}

impl HierarchyConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `STRATA_STORE_PATH` and `STRATA_EVENT_CAPACITY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the capacity is not a positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = lookup(ENV_STORE_PATH) {
            config.store_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(ENV_EVENT_CAPACITY) {
            config.event_capacity = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError {
                        var: ENV_EVENT_CAPACITY.to_string(),
                        value,
                    })
                }
            };
        }
        Ok(config)
    }

    /// Set the store file path.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    /// Set the save event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Bind the Read layer to the given runtime.
    pub fn with_ui_runtime(mut self, handle: Handle) -> Self {
        self.ui_runtime = Some(handle);
        self
    }

    /// Run the other layers and the coordinator on the given runtime.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HierarchyConfig::new();
        assert_eq!(config.store_path, PathBuf::from("strata.db"));
        assert_eq!(config.event_capacity, 64);
        assert!(config.ui_runtime.is_none());
    }

    #[test]
    fn test_builder() {
        let config = HierarchyConfig::new()
            .with_store_path("/tmp/app.db")
            .with_event_capacity(8);
        assert_eq!(config.store_path, PathBuf::from("/tmp/app.db"));
        assert_eq!(config.event_capacity, 8);
    }

    #[test]
    fn test_from_lookup() {
        let config = HierarchyConfig::from_lookup(lookup(&[
            (ENV_STORE_PATH, "data/app.db"),
            (ENV_EVENT_CAPACITY, "16"),
        ]))
        .unwrap();
        assert_eq!(config.store_path, PathBuf::from("data/app.db"));
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn test_from_lookup_rejects_bad_capacity() {
        let err = HierarchyConfig::from_lookup(lookup(&[(ENV_EVENT_CAPACITY, "zero")])).unwrap_err();
        assert_eq!(err.var, ENV_EVENT_CAPACITY);
        assert_eq!(err.value, "zero");

        assert!(HierarchyConfig::from_lookup(lookup(&[(ENV_EVENT_CAPACITY, "0")])).is_err());
    }
}
