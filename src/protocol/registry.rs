//! Process-wide plugin registry
//!
//! The registry is written exactly once, before any lookup, and is read-only
//! afterwards. [`Registry::install`] performs that single write explicitly;
//! [`Registry::global`] falls back to the built-in plugin set when nothing
//! was installed.

use super::{Capabilities, PluginOptions, Protocol, Transport};
use crate::{Error, Result};
use std::sync::OnceLock;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Creates a fresh dissector for one connection
pub type Factory = fn(&PluginOptions) -> Result<Box<dyn Protocol>>;

/// Plugin descriptor
#[derive(Clone, Copy)]
pub struct Plugin {
    pub name: &'static str,
    pub description: &'static str,
    pub version: u32,
    pub capabilities: Capabilities,
    pub factory: Factory,
}

impl Plugin {
    /// Instantiate the dissector with the given options
    pub fn create(&self, options: &PluginOptions) -> Result<Box<dyn Protocol>> {
        (self.factory)(options)
    }

    /// Fail unless the plugin declares support for `transport`
    pub fn require(&self, transport: Transport) -> Result<()> {
        if self.capabilities.supports(transport) {
            Ok(())
        } else {
            Err(Error::UnsupportedTransport {
                plugin: self.name,
                transport,
            })
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Append-only list of plugin descriptors
#[derive(Debug, Default)]
pub struct Registry {
    plugins: Vec<Plugin>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every plugin compiled into the crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for plugin in crate::plugins::builtin() {
            registry.register(plugin);
        }
        registry
    }

    /// Append a plugin descriptor
    pub fn register(&mut self, plugin: Plugin) {
        self.plugins.push(plugin);
    }

    /// Make `self` the process-wide registry.
    ///
    /// Fails if a registry was already installed or looked up.
    pub fn install(self) -> Result<&'static Registry> {
        REGISTRY
            .set(self)
            .map_err(|_| Error::Config("plugin registry is already initialized".to_string()))?;
        Ok(Self::global())
    }

    /// The process-wide registry
    pub fn global() -> &'static Registry {
        REGISTRY.get_or_init(Registry::builtin)
    }

    /// Find a plugin by case-insensitive name
    pub fn find(&self, name: &str) -> Result<&Plugin> {
        self.plugins
            .iter()
            .find(|plugin| plugin.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Plugin> {
        self.plugins.iter()
    }
}
