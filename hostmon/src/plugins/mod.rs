//! Metric plugins shipped with the agent.

pub mod agent;
pub mod system;

use std::sync::Arc;

use plugin_api::{MetricRegistry, RegistryError};

pub use agent::AgentPlugin;
pub use system::SystemPlugin;

/// Register every built-in plugin.
pub fn register_builtin(registry: &mut MetricRegistry) -> Result<(), RegistryError> {
    registry.register_metrics(Arc::new(AgentPlugin::new()), "agent", agent::METRICS)?;
    registry.register_metrics(Arc::new(SystemPlugin::new()), "system", system::METRICS)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_builtin() {
        let mut registry = MetricRegistry::new();
        register_builtin(&mut registry).unwrap();

        assert_eq!(registry.plugins().len(), 2);
        assert_eq!(registry.len(), agent::METRICS.len() + system::METRICS.len());
        assert_eq!(registry.plugin_for("agent.ping").unwrap().name(), "agent");
        assert_eq!(registry.plugin_for("vm.memory.size").unwrap().name(), "system");

        let system = registry.plugin_by_name("system").unwrap().capabilities();
        assert!(system.exporter && system.collector && system.runner);
        let agent = registry.plugin_by_name("agent").unwrap().capabilities();
        assert!(agent.exporter && agent.configurator);
    }
}
