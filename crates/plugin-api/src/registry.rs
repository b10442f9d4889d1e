//! Metric registry.
//!
//! Populated once while plugins are loaded and read-only afterwards. The
//! registry is passed explicitly to the scheduler instead of living in a
//! process-wide global.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::key::{KeyError, parse_key};
use crate::plugin::{Capabilities, Plugin};

/// Fatal registration errors. These indicate a broken plugin set.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid metric key '{key}' for plugin '{plugin}': {source}")]
    InvalidKey {
        plugin: String,
        key: String,
        #[source]
        source: KeyError,
    },

    #[error("metric key '{key}' for plugin '{plugin}' must not contain parameters")]
    ParameterizedKey { plugin: String, key: String },

    #[error("plugin name '{0}' is already used by a different plugin instance")]
    NameConflict(String),

    #[error("plugin instance '{name}' is already registered as '{existing}'")]
    InstanceRenamed { name: String, existing: String },
}

/// A unique plugin instance with its cached capabilities.
pub struct RegisteredPlugin {
    name: String,
    instance: Arc<dyn Plugin>,
    capabilities: Capabilities,
}

impl RegisteredPlugin {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &Arc<dyn Plugin> {
        &self.instance
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

impl std::fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// A registered metric key.
#[derive(Debug, Clone)]
pub struct Metric {
    pub key: String,
    pub description: String,
    /// Index of the implementing plugin in [`MetricRegistry::plugins`].
    pub plugin_index: usize,
}

/// Table of metric keys and the plugin instances implementing them.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: HashMap<String, Metric>,
    plugins: Vec<Arc<RegisteredPlugin>>,
    by_name: HashMap<String, usize>,
}

fn same_instance(a: &Arc<dyn Plugin>, b: &Arc<dyn Plugin>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the metric keys implemented by a plugin instance.
    ///
    /// Registering the same instance under the same name again only adds
    /// keys. A key that is already registered is skipped with a warning.
    pub fn register_metrics(
        &mut self,
        plugin: Arc<dyn Plugin>,
        name: &str,
        metrics: &[(&str, &str)],
    ) -> Result<(), RegistryError> {
        for (key, _) in metrics {
            let (_, params) = parse_key(key).map_err(|source| RegistryError::InvalidKey {
                plugin: name.to_string(),
                key: key.to_string(),
                source,
            })?;
            if !params.is_empty() || key.contains('[') {
                return Err(RegistryError::ParameterizedKey {
                    plugin: name.to_string(),
                    key: key.to_string(),
                });
            }
        }

        let plugin_index = match self.by_name.get(name) {
            Some(&index) => {
                if !same_instance(&self.plugins[index].instance, &plugin) {
                    return Err(RegistryError::NameConflict(name.to_string()));
                }
                index
            }
            None => {
                if let Some(existing) = self
                    .plugins
                    .iter()
                    .find(|p| same_instance(&p.instance, &plugin))
                {
                    return Err(RegistryError::InstanceRenamed {
                        name: name.to_string(),
                        existing: existing.name.clone(),
                    });
                }
                let capabilities = Capabilities::probe(plugin.as_ref());
                debug!(plugin = %name, %capabilities, "Registered plugin");
                self.plugins.push(Arc::new(RegisteredPlugin {
                    name: name.to_string(),
                    instance: plugin,
                    capabilities,
                }));
                self.by_name.insert(name.to_string(), self.plugins.len() - 1);
                self.plugins.len() - 1
            }
        };

        for (key, description) in metrics {
            if let Some(existing) = self.metrics.get(*key) {
                warn!(
                    key = %key,
                    plugin = %name,
                    existing = %self.plugins[existing.plugin_index].name,
                    "Metric key is already registered, ignoring"
                );
                continue;
            }
            self.metrics.insert(
                key.to_string(),
                Metric {
                    key: key.to_string(),
                    description: description.to_string(),
                    plugin_index,
                },
            );
        }

        Ok(())
    }

    /// Look up a metric by key name (without parameters).
    pub fn get(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    /// Look up the plugin implementing a metric key.
    pub fn plugin_for(&self, key: &str) -> Option<&Arc<RegisteredPlugin>> {
        self.get(key).map(|m| &self.plugins[m.plugin_index])
    }

    /// Unique plugin instances, in registration order.
    pub fn plugins(&self) -> &[Arc<RegisteredPlugin>] {
        &self.plugins
    }

    /// Look up a plugin by name.
    pub fn plugin_by_name(&self, name: &str) -> Option<&Arc<RegisteredPlugin>> {
        self.by_name.get(name).map(|&i| &self.plugins[i])
    }

    /// All metrics sorted by key.
    pub fn metrics(&self) -> Vec<&Metric> {
        let mut metrics: Vec<&Metric> = self.metrics.values().collect();
        metrics.sort_by(|a, b| a.key.cmp(&b.key));
        metrics
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
