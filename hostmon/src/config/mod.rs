//! Agent configuration.
//!
//! The configuration is a TOML file. Every field has a default so an empty
//! file is a valid configuration:
//!
//! ```toml
//! timeout_secs = 3
//! refresh_unsupported_secs = 600
//! force_active_checks_on_start = 0
//!
//! [scheduler]
//! tick_interval_ms = 1000
//!
//! [log]
//! filter = "hostmon=debug"
//! directory = "/var/log/hostmon"
//!
//! [plugins.system.system]
//! capacity = 10
//!
//! [plugins.agent.options]
//! hostname = "web-01"
//!
//! [[items]]
//! key = "system.cpu.load[all,avg1]"
//! delay = "30s"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use item_delay::Delay;
use plugin_api::{GlobalOptions, parse_key};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Default check timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u32 = 3;

/// Default retry interval for failed checks, in seconds.
pub const DEFAULT_REFRESH_UNSUPPORTED_SECS: u32 = 600;

/// Default plugin capacity when the plugin has no configured capacity.
pub const DEFAULT_PLUGIN_CAPACITY: u32 = 1000;

/// Default upper bound on plugin capacity.
pub const DEFAULT_MAX_PLUGIN_CAPACITY: u32 = 1000;

/// Default scheduler tick interval in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// Default time allowed for stopping plugins at shutdown, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

const MAX_TIMEOUT_SECS: u32 = 30;

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Default check timeout in seconds.
    pub timeout_secs: u32,
    /// Retry interval for failed checks, in seconds.
    pub refresh_unsupported_secs: u32,
    /// Run active checks at once after startup (0 or 1).
    pub force_active_checks_on_start: i32,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
    /// Per-plugin settings keyed by plugin name.
    pub plugins: HashMap<String, PluginConfig>,
    /// Locally configured items, checked periodically.
    pub items: Vec<ItemConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            refresh_unsupported_secs: DEFAULT_REFRESH_UNSUPPORTED_SECS,
            force_active_checks_on_start: 0,
            scheduler: SchedulerConfig::default(),
            log: LogConfig::default(),
            plugins: HashMap::new(),
            items: Vec::new(),
        }
    }
}

/// Scheduler event loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between queue drains when nothing else happens.
    pub tick_interval_ms: u64,
    /// Time allowed for stopping plugins at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, overridden by `RUST_LOG`.
    pub filter: Option<String>,
    /// Directory for daily rotated log files; console only when unset.
    pub directory: Option<PathBuf>,
}

/// Settings of one plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub system: PluginSystemConfig,
    /// Plugin specific options, handed to the plugin's configurator.
    pub options: Option<toml::Table>,
}

/// Scheduler settings of one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSystemConfig {
    /// Maximum concurrent check weight, 0 for the default.
    pub capacity: u32,
    /// Overrides the global `force_active_checks_on_start`.
    pub force_active_checks_on_start: Option<i32>,
}

/// A locally configured item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub key: String,
    #[serde(default = "default_item_delay")]
    pub delay: String,
    /// Check timeout in seconds, the global timeout when unset.
    #[serde(default)]
    pub timeout_secs: Option<u32>,
}

fn default_item_delay() -> String {
    "60s".to_string()
}

impl AgentConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out of range values.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(Error::config(format!(
                "timeout_secs must be between 1 and {}, got {}",
                MAX_TIMEOUT_SECS, self.timeout_secs
            )));
        }
        if !(1..=item_delay::MAX_DELAY_SECS).contains(&self.refresh_unsupported_secs) {
            return Err(Error::config(format!(
                "refresh_unsupported_secs must be between 1 and {}, got {}",
                item_delay::MAX_DELAY_SECS,
                self.refresh_unsupported_secs
            )));
        }
        if !matches!(self.force_active_checks_on_start, 0 | 1) {
            return Err(Error::config(format!(
                "force_active_checks_on_start must be 0 or 1, got {}",
                self.force_active_checks_on_start
            )));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(Error::config("scheduler.tick_interval_ms must be positive"));
        }

        for (index, item) in self.items.iter().enumerate() {
            parse_key(&item.key).map_err(|e| {
                Error::config(format!("items[{}]: key '{}': {}", index, item.key, e))
            })?;
            item.delay.parse::<Delay>().map_err(|e| {
                Error::config(format!("items[{}]: key '{}': {}", index, item.key, e))
            })?;
            if let Some(timeout) = item.timeout_secs {
                if !(1..=MAX_TIMEOUT_SECS).contains(&timeout) {
                    return Err(Error::config(format!(
                        "items[{}]: timeout_secs must be between 1 and {}",
                        index, MAX_TIMEOUT_SECS
                    )));
                }
            }
        }
        Ok(())
    }

    /// Options shared with every configurator plugin.
    pub fn global_options(&self) -> GlobalOptions {
        GlobalOptions {
            timeout_secs: self.timeout_secs,
        }
    }

    /// Settings of a plugin, if configured.
    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.get(name)
    }
}

/// Resolve the capacity of a plugin.
///
/// The configured capacity (or the default when unset) is bounded by the
/// maximum the plugin declares (or the default maximum when it declares
/// none).
pub fn plugin_capacity(
    system_capacity: u32,
    default_capacity: u32,
    plugin_max_capacity: u32,
    default_max_capacity: u32,
) -> u32 {
    let capacity = if system_capacity != 0 {
        system_capacity
    } else {
        default_capacity
    };
    let max = if plugin_max_capacity > 0 {
        plugin_max_capacity
    } else {
        default_max_capacity
    };
    capacity.min(max)
}

/// Resolve whether active checks of a plugin run at once after startup.
pub fn plugin_force_active_checks(setting: Option<i32>, global: i32) -> bool {
    match setting {
        Some(1) => true,
        Some(0) => false,
        Some(other) => {
            warn!(
                value = other,
                "Invalid force_active_checks_on_start plugin value, expected 0 or 1"
            );
            false
        }
        None => global == 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AgentConfig::from_toml_str("").unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.refresh_unsupported_secs, 600);
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
    }

    #[test]
    fn test_parse_full_config() {
        let config = AgentConfig::from_toml_str(
            r#"
            timeout_secs = 5
            force_active_checks_on_start = 1

            [log]
            filter = "hostmon=debug"

            [plugins.system.system]
            capacity = 10
            force_active_checks_on_start = 0

            [plugins.agent.options]
            hostname = "web-01"

            [[items]]
            key = "agent.ping"
            delay = "10s"

            [[items]]
            key = "system.uptime"
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.log.filter.as_deref(), Some("hostmon=debug"));
        let system = config.plugin("system").unwrap();
        assert_eq!(system.system.capacity, 10);
        assert_eq!(system.system.force_active_checks_on_start, Some(0));
        assert!(system.options.is_none());
        let options = config.plugin("agent").unwrap().options.as_ref().unwrap();
        assert_eq!(options["hostname"].as_str(), Some("web-01"));
        assert_eq!(config.items.len(), 2);
        assert_eq!(config.items[1].delay, "60s");
    }

    #[test]
    fn test_validation_errors() {
        for content in [
            "timeout_secs = 0",
            "timeout_secs = 31",
            "refresh_unsupported_secs = 0",
            "force_active_checks_on_start = 2",
            "[scheduler]\ntick_interval_ms = 0",
            "[[items]]\nkey = \"bad key\"",
            "[[items]]\nkey = \"agent.ping\"\ndelay = \"1x\"",
            "[[items]]\nkey = \"agent.ping\"\ntimeout_secs = 60",
        ] {
            let err = AgentConfig::from_toml_str(content).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{content}: {err}");
        }
        assert!(matches!(
            AgentConfig::from_toml_str("timeout_secs = \"x\"").unwrap_err(),
            Error::Toml(_)
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "refresh_unsupported_secs = 120").unwrap();
        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.refresh_unsupported_secs, 120);

        let missing = AgentConfig::load("/nonexistent/hostmon.toml").unwrap_err();
        assert!(matches!(missing, Error::Configuration(_)));
    }

    #[test]
    fn test_plugin_capacity() {
        let cases = [
            (50, 1000, 100, 1000, 50),
            (150, 1000, 100, 1000, 100),
            (1500, 1000, 0, 1000, 1000),
            (1500, 1000, 2000, 1000, 1500),
            (2500, 1000, 2000, 1000, 2000),
            (0, 1000, 2000, 1000, 1000),
        ];
        for (system, default, plugin_max, default_max, expected) in cases {
            assert_eq!(
                plugin_capacity(system, default, plugin_max, default_max),
                expected,
                "capacity({system}, {default}, {plugin_max}, {default_max})"
            );
        }
    }

    #[test]
    fn test_plugin_force_active_checks() {
        assert!(plugin_force_active_checks(Some(1), 0));
        assert!(!plugin_force_active_checks(Some(0), 1));
        assert!(!plugin_force_active_checks(Some(7), 1));
        assert!(plugin_force_active_checks(None, 1));
        assert!(!plugin_force_active_checks(None, 0));
    }
}
