//! Agent-wide error types.

use thiserror::Error;

/// Agent-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Agent-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plugin registration failed: {0}")]
    Registry(#[from] plugin_api::RegistryError),

    #[error("Plugin '{plugin}' error: {source}")]
    Plugin {
        plugin: String,
        #[source]
        source: plugin_api::PluginError,
    },

    #[error("Timeout occurred while gathering data.")]
    Timeout,

    #[error("Scheduler is not running")]
    ChannelClosed,

    #[error("{0}")]
    Check(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn plugin(plugin: impl Into<String>, source: plugin_api::PluginError) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            source,
        }
    }
}
