//! Controller configuration.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tether_common::{GenericOptions, TetherError, TetherResult};
use tether_store::DEFAULT_ROOT_CHAIN;

use crate::ipamapi::DEFAULT_IPAM;

/// Default IPAM driver name, overridable through `TETHER_DEFAULT_IPAM_DRIVER`.
pub static DEFAULT_IPAM_DRIVER: Lazy<String> = Lazy::new(|| {
    std::env::var("TETHER_DEFAULT_IPAM_DRIVER").unwrap_or_else(|_| DEFAULT_IPAM.to_string())
});

/// Controller configuration options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// IPAM driver used by networks that do not name one.
    pub default_ipam_driver: String,
    /// Key chain prefix for every stored object.
    pub store_root: String,
    /// Network types whose driver learns about a network lazily, on first use.
    pub legacy_network_types: Vec<String>,
    /// Generic options handed to the driver loader, per network type.
    pub drivers: HashMap<String, GenericOptions>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_ipam_driver: DEFAULT_IPAM_DRIVER.clone(),
            store_root: DEFAULT_ROOT_CHAIN.to_string(),
            legacy_network_types: vec!["bridge".to_string()],
            drivers: HashMap::new(),
        }
    }
}

impl ControllerConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Config`] if the document is malformed.
    pub fn from_toml_str(source: &str) -> TetherResult<Self> {
        toml::from_str(source).map_err(|e| TetherError::Config {
            message: e.to_string(),
        })
    }

    /// Load a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> TetherResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), "Loaded controller configuration");
        Ok(config)
    }

    /// Set the default IPAM driver.
    #[must_use]
    pub fn with_default_ipam_driver(mut self, name: impl Into<String>) -> Self {
        self.default_ipam_driver = name.into();
        self
    }

    /// Set the store key root chain.
    #[must_use]
    pub fn with_store_root(mut self, root: impl Into<String>) -> Self {
        self.store_root = root.into();
        self
    }

    /// Replace the set of lazily registered network types.
    #[must_use]
    pub fn with_legacy_network_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.legacy_network_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the loader options for one network type.
    #[must_use]
    pub fn with_driver_options(
        mut self,
        network_type: impl Into<String>,
        options: GenericOptions,
    ) -> Self {
        self.drivers.insert(network_type.into(), options);
        self
    }

    /// Returns true if networks of this type are registered with their driver lazily.
    #[must_use]
    pub fn is_legacy(&self, network_type: &str) -> bool {
        self.legacy_network_types.iter().any(|t| t == network_type)
    }

    /// Loader options for a network type.
    #[must_use]
    pub fn driver_options(&self, network_type: &str) -> GenericOptions {
        self.drivers.get(network_type).cloned().unwrap_or_default()
    }
}
