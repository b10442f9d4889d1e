//! Agent self-information.

use async_trait::async_trait;
use parking_lot::Mutex;
use plugin_api::{
    Configurator, ExportContext, Exporter, GlobalOptions, Plugin, PluginError, Value,
};
use sysinfo::System;
use tracing::debug;

/// Longest accepted hostname.
const MAX_HOSTNAME_LEN: usize = 128;

pub const METRICS: &[(&str, &str)] = &[
    ("agent.hostname", "Returns the agent hostname."),
    ("agent.ping", "Returns agent availability check result."),
    ("agent.version", "Version of the agent."),
];

/// Answers questions about the agent itself.
///
/// Options:
///
/// ```toml
/// [plugins.agent.options]
/// hostname = "web-01"
/// ```
#[derive(Debug, Default)]
pub struct AgentPlugin {
    hostname: Mutex<Option<String>>,
}

impl AgentPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn hostname(&self) -> Result<String, PluginError> {
        if let Some(hostname) = self.hostname.lock().clone() {
            return Ok(hostname);
        }
        System::host_name().ok_or_else(|| PluginError::failed("Cannot obtain system hostname."))
    }
}

fn configured_hostname(options: Option<&toml::Table>) -> Result<Option<String>, PluginError> {
    let Some(value) = options.and_then(|o| o.get("hostname")) else {
        return Ok(None);
    };
    let hostname = value
        .as_str()
        .ok_or_else(|| PluginError::Configuration("hostname must be a string".to_string()))?;
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return Err(PluginError::Configuration(format!(
            "hostname must be 1 to {} characters long",
            MAX_HOSTNAME_LEN
        )));
    }
    Ok(Some(hostname.to_string()))
}

#[async_trait]
impl Exporter for AgentPlugin {
    async fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &ExportContext,
    ) -> Result<Option<Value>, PluginError> {
        if !params.is_empty() {
            return Err(PluginError::invalid_params("Too many parameters."));
        }
        match key {
            "agent.ping" => Ok(Some(Value::from(1u64))),
            "agent.version" => Ok(Some(Value::from(env!("CARGO_PKG_VERSION")))),
            "agent.hostname" => self.hostname().map(|h| Some(Value::from(h))),
            _ => Err(PluginError::Unsupported(key.to_string())),
        }
    }
}

impl Configurator for AgentPlugin {
    fn validate(&self, options: Option<&toml::Table>) -> Result<(), PluginError> {
        configured_hostname(options).map(|_| ())
    }

    fn configure(&self, _global: &GlobalOptions, options: Option<&toml::Table>) {
        // validated before configure is called
        let hostname = configured_hostname(options).unwrap_or_default();
        debug!(hostname = ?hostname, "Agent plugin configured");
        *self.hostname.lock() = hostname;
    }
}

impl Plugin for AgentPlugin {
    fn as_exporter(&self) -> Option<&dyn Exporter> {
        Some(self)
    }

    fn as_configurator(&self) -> Option<&dyn Configurator> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx() -> ExportContext {
        ExportContext {
            item_id: 1,
            client_id: 101,
            timeout: Duration::from_secs(3),
        }
    }

    fn options(src: &str) -> toml::Table {
        src.parse::<toml::Table>().unwrap()
    }

    #[tokio::test]
    async fn test_ping_and_version() {
        let plugin = AgentPlugin::new();
        assert_eq!(
            plugin.export("agent.ping", &[], &ctx()).await.unwrap(),
            Some(Value::Unsigned(1))
        );
        assert_eq!(
            plugin.export("agent.version", &[], &ctx()).await.unwrap(),
            Some(Value::Text(env!("CARGO_PKG_VERSION").to_string()))
        );
        assert!(
            plugin
                .export("agent.ping", &["x".to_string()], &ctx())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_configured_hostname() {
        let plugin = AgentPlugin::new();
        let opts = options("hostname = \"web-01\"");
        plugin.validate(Some(&opts)).unwrap();
        plugin.configure(&GlobalOptions { timeout_secs: 3 }, Some(&opts));

        assert_eq!(
            plugin.export("agent.hostname", &[], &ctx()).await.unwrap(),
            Some(Value::Text("web-01".to_string()))
        );
    }

    #[test]
    fn test_invalid_hostname_option() {
        let plugin = AgentPlugin::new();
        assert!(plugin.validate(None).is_ok());
        assert!(plugin.validate(Some(&options("hostname = 5"))).is_err());
        assert!(plugin.validate(Some(&options("hostname = \"\""))).is_err());
    }
}
