//! Table of registry backends, assembled explicitly by the application.

use crate::error::{RegistryError, Result};
use crate::registry::{MulticastRegistry, Registry};
use lanreg_core::RegistryConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds a registry from resolved configuration.
pub type RegistryConstructor =
    Arc<dyn Fn(RegistryConfig) -> Result<Arc<dyn Registry>> + Send + Sync>;

/// Maps backend names to constructors.
#[derive(Clone, Default)]
pub struct RegistryFactory {
    constructors: HashMap<String, RegistryConstructor>,
}

impl fmt::Debug for RegistryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryFactory")
            .field("backends", &self.backends())
            .finish()
    }
}

impl RegistryFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory with the built-in `multicast` backend.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.constructors.insert(
            MulticastRegistry::NAME.to_string(),
            Arc::new(|config: RegistryConfig| -> Result<Arc<dyn Registry>> {
                Ok(Arc::new(MulticastRegistry::new(config)?))
            }),
        );
        factory
    }

    /// Adds a backend.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::BackendExists`] if the name is taken.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> Result<()>
    where
        F: Fn(RegistryConfig) -> Result<Arc<dyn Registry>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(RegistryError::BackendExists(name));
        }
        self.constructors.insert(name, Arc::new(constructor));
        Ok(())
    }

    /// Builds the named backend.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownBackend`] for unregistered names, or
    /// whatever the constructor fails with.
    pub fn create(&self, name: &str, config: RegistryConfig) -> Result<Arc<dyn Registry>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))?;
        constructor(config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_multicast() {
        let factory = RegistryFactory::with_defaults();
        assert_eq!(factory.backends(), vec!["multicast".to_string()]);

        let registry = factory
            .create("multicast", RegistryConfig::default())
            .unwrap();
        assert_eq!(registry.name(), "multicast");
    }

    #[test]
    fn test_unknown_backend() {
        let factory = RegistryFactory::new();
        assert!(matches!(
            factory.create("nats", RegistryConfig::default()),
            Err(RegistryError::UnknownBackend(name)) if name == "nats"
        ));
    }

    #[test]
    fn test_duplicate_backend_is_rejected() {
        let mut factory = RegistryFactory::with_defaults();
        let result = factory.register("multicast", |config| {
            let registry: Arc<dyn Registry> = Arc::new(MulticastRegistry::new(config)?);
            Ok(registry)
        });
        assert!(matches!(result, Err(RegistryError::BackendExists(_))));

        factory
            .register("loopback", |config| {
                let registry: Arc<dyn Registry> = Arc::new(MulticastRegistry::new(config)?);
                Ok(registry)
            })
            .unwrap();
        assert!(factory.contains("loopback"));
    }

    #[test]
    fn test_constructor_errors_propagate() {
        let factory = RegistryFactory::with_defaults();
        let config = RegistryConfig {
            ttl_secs: 0,
            ..RegistryConfig::default()
        };
        assert!(matches!(
            factory.create("multicast", config),
            Err(RegistryError::Config(_))
        ));
    }
}
