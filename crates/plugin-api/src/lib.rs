//! # Plugin API
//!
//! Building blocks shared by the hostmon agent and its metric plugins.
//!
//! ## Features
//!
//! - Optional capability traits a plugin may implement in any combination:
//!   [`Exporter`], [`Collector`], [`Runner`], [`Watcher`] and [`Configurator`]
//! - [`MetricRegistry`] mapping metric keys to plugin instances
//! - Metric key parsing (`name[param1,param2]`)
//! - The [`ItemResult`] delivered to requesters and the [`ResultWriter`] sink
//!

pub mod key;
pub mod plugin;
pub mod registry;
pub mod value;

pub use key::{KeyError, parse_key};
pub use plugin::{
    Capabilities, Collector, Configurator, ExportContext, Exporter, GlobalOptions, Plugin,
    PluginError, ResultWriter, Runner, WatchItem, Watcher,
};
pub use registry::{Metric, MetricRegistry, RegisteredPlugin, RegistryError};
pub use value::{ItemResult, Value};
