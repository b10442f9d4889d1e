//! Plugin capability traits.
//!
//! A plugin is any type implementing [`Plugin`]. The scheduler never asks a
//! plugin what it "is"; instead each optional capability is exposed through
//! an accessor returning `Some` when the plugin implements it. Capabilities
//! are probed once at registration and cached as [`Capabilities`].
//!
//! Plugin instances are shared by every in-flight execution of the plugin,
//! up to its capacity, so implementations must be safe for concurrent use.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::value::{ItemResult, Value};

/// Errors reported by plugin code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Unsupported metric: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl PluginError {
    /// Create a generic failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Create an invalid parameters error.
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }
}

/// Context handed to [`Exporter::export`].
#[derive(Debug, Clone)]
pub struct ExportContext {
    /// Item being exported, 0 for one-shot checks.
    pub item_id: u64,
    /// Requester on whose behalf the export runs.
    pub client_id: u64,
    /// Time budget for the export.
    pub timeout: Duration,
}

/// An item passed to [`Watcher::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchItem {
    pub item_id: u64,
    pub key: String,
    pub params: Vec<String>,
}

/// Agent-wide options passed to [`Configurator::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalOptions {
    /// Default check timeout in seconds.
    pub timeout_secs: u32,
}

/// Destination of item results.
///
/// Owned by the requester; the scheduler only writes to it.
pub trait ResultWriter: Send + Sync {
    fn write(&self, result: ItemResult);
}

impl ResultWriter for mpsc::UnboundedSender<ItemResult> {
    fn write(&self, result: ItemResult) {
        // a closed receiver means the requester went away
        let _ = self.send(result);
    }
}

/// Pull-style metric gathering, invoked once per scheduled execution.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Gather the value for `key` (the key name without parameters).
    ///
    /// Returning `Ok(None)` means there is nothing to report for this run.
    async fn export(
        &self,
        key: &str,
        params: &[String],
        ctx: &ExportContext,
    ) -> Result<Option<Value>, PluginError>;
}

/// Background self-collection on a fixed period.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self) -> Result<(), PluginError>;

    /// Collection period in seconds.
    fn period(&self) -> u32;
}

/// Lifecycle hooks for plugins that hold resources while in use.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
}

/// Event-driven monitoring. The plugin receives the complete set of watched
/// items for a requester each time it changes, and an empty set when the
/// requester stops using the plugin.
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn watch(&self, items: Vec<WatchItem>, sink: Arc<dyn ResultWriter>);
}

/// Plugin-specific configuration, applied while the agent configuration
/// is loaded.
pub trait Configurator: Send + Sync {
    fn validate(&self, options: Option<&toml::Table>) -> Result<(), PluginError>;
    fn configure(&self, global: &GlobalOptions, options: Option<&toml::Table>);
}

/// Base trait of every metric plugin.
pub trait Plugin: Send + Sync + 'static {
    /// Upper bound on the plugin's capacity, 0 for no plugin-specific bound.
    fn max_capacity(&self) -> u32 {
        0
    }

    fn as_exporter(&self) -> Option<&dyn Exporter> {
        None
    }

    fn as_collector(&self) -> Option<&dyn Collector> {
        None
    }

    fn as_runner(&self) -> Option<&dyn Runner> {
        None
    }

    fn as_watcher(&self) -> Option<&dyn Watcher> {
        None
    }

    fn as_configurator(&self) -> Option<&dyn Configurator> {
        None
    }
}

/// Capability flags of a registered plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub exporter: bool,
    pub collector: bool,
    pub runner: bool,
    pub watcher: bool,
    pub configurator: bool,
}

impl Capabilities {
    /// Probe the optional capability accessors of a plugin.
    pub fn probe(plugin: &dyn Plugin) -> Self {
        Self {
            exporter: plugin.as_exporter().is_some(),
            collector: plugin.as_collector().is_some(),
            runner: plugin.as_runner().is_some(),
            watcher: plugin.as_watcher().is_some(),
            configurator: plugin.as_configurator().is_some(),
        }
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.exporter, "exporter"),
            (self.collector, "collector"),
            (self.runner, "runner"),
            (self.watcher, "watcher"),
            (self.configurator, "configurator"),
        ];
        let mut first = true;
        for (_, name) in names.iter().filter(|(set, _)| *set) {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pinger;

    #[async_trait]
    impl Exporter for Pinger {
        async fn export(
            &self,
            _key: &str,
            _params: &[String],
            _ctx: &ExportContext,
        ) -> Result<Option<Value>, PluginError> {
            Ok(Some(Value::from(1u64)))
        }
    }

    #[async_trait]
    impl Runner for Pinger {
        async fn start(&self) {}
        async fn stop(&self) {}
    }

    impl Plugin for Pinger {
        fn as_exporter(&self) -> Option<&dyn Exporter> {
            Some(self)
        }

        fn as_runner(&self) -> Option<&dyn Runner> {
            Some(self)
        }
    }

    struct Bare;

    impl Plugin for Bare {}

    #[test]
    fn test_capabilities_probe() {
        let caps = Capabilities::probe(&Pinger);
        assert!(caps.exporter);
        assert!(caps.runner);
        assert!(!caps.collector);
        assert_eq!(caps.to_string(), "exporter, runner");
        assert_eq!(Capabilities::probe(&Bare).to_string(), "none");
    }

    #[tokio::test]
    async fn test_channel_writer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ts = chrono::Utc::now();
        tx.write(ItemResult::value(3, Some(Value::from(1u64)), ts));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.item_id, 3);
    }

    #[tokio::test]
    async fn test_export_through_accessor() {
        let plugin: Arc<dyn Plugin> = Arc::new(Pinger);
        let ctx = ExportContext {
            item_id: 1,
            client_id: 0,
            timeout: Duration::from_secs(3),
        };
        let exporter = plugin.as_exporter().unwrap();
        let value = exporter.export("ping", &[], &ctx).await.unwrap();
        assert_eq!(value, Some(Value::from(1u64)));
    }
}
