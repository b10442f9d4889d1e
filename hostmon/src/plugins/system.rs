//! Host-level metrics backed by `sysinfo`.
//!
//! CPU and memory figures come from a snapshot refreshed by the collector
//! task; uptime is read directly.

use async_trait::async_trait;
use parking_lot::Mutex;
use plugin_api::{Collector, ExportContext, Exporter, Plugin, PluginError, Runner, Value};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, info};

/// Snapshot refresh period in seconds.
pub const COLLECT_PERIOD_SECS: u32 = 5;

pub const METRICS: &[(&str, &str)] = &[
    ("system.cpu.load", "CPU load."),
    ("system.cpu.num", "Number of CPUs."),
    ("system.uptime", "System uptime, in seconds."),
    ("vm.memory.size", "Memory size in bytes or in percentage from total."),
];

/// Figures taken by one refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Snapshot {
    cpu_num: usize,
    load: [f64; 3],
    total_memory: u64,
    free_memory: u64,
    used_memory: u64,
    available_memory: u64,
}

impl Snapshot {
    fn take(system: &mut System) -> Self {
        system.refresh_cpu_list(CpuRefreshKind::nothing());
        system.refresh_memory();
        let load = System::load_average();
        Self {
            cpu_num: system.cpus().len(),
            load: [load.one, load.five, load.fifteen],
            total_memory: system.total_memory(),
            free_memory: system.free_memory(),
            used_memory: system.used_memory(),
            available_memory: system.available_memory(),
        }
    }

    fn cpu_load(&self, params: &[String]) -> Result<Value, PluginError> {
        if params.len() > 2 {
            return Err(PluginError::invalid_params("Too many parameters."));
        }
        let per_cpu = match params.first().map(String::as_str) {
            None | Some("") | Some("all") => false,
            Some("percpu") => true,
            Some(_) => return Err(PluginError::invalid_params("Invalid first parameter.")),
        };
        let load = match params.get(1).map(String::as_str) {
            None | Some("") | Some("avg1") => self.load[0],
            Some("avg5") => self.load[1],
            Some("avg15") => self.load[2],
            Some(_) => return Err(PluginError::invalid_params("Invalid second parameter.")),
        };
        if per_cpu {
            if self.cpu_num == 0 {
                return Err(PluginError::failed("Cannot obtain number of CPUs."));
            }
            return Ok(Value::Float(load / self.cpu_num as f64));
        }
        Ok(Value::Float(load))
    }

    fn memory_size(&self, params: &[String]) -> Result<Value, PluginError> {
        if params.len() > 1 {
            return Err(PluginError::invalid_params("Too many parameters."));
        }
        let percent = |part: u64| -> Result<Value, PluginError> {
            if self.total_memory == 0 {
                return Err(PluginError::failed("Cannot calculate percentage because total is zero."));
            }
            Ok(Value::Float(part as f64 / self.total_memory as f64 * 100.0))
        };
        match params.first().map(String::as_str) {
            None | Some("") | Some("total") => Ok(Value::Unsigned(self.total_memory)),
            Some("free") => Ok(Value::Unsigned(self.free_memory)),
            Some("used") => Ok(Value::Unsigned(self.used_memory)),
            Some("available") => Ok(Value::Unsigned(self.available_memory)),
            Some("pavailable") => percent(self.available_memory),
            Some("pused") => percent(self.used_memory),
            Some(_) => Err(PluginError::invalid_params("Invalid first parameter.")),
        }
    }
}

struct State {
    system: System,
    snapshot: Option<Snapshot>,
}

/// CPU, memory and uptime metrics.
///
/// Runs as a collector so exports read a cached snapshot instead of
/// querying the operating system on every check.
pub struct SystemPlugin {
    state: Mutex<State>,
}

impl SystemPlugin {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            state: Mutex::new(State {
                system,
                snapshot: None,
            }),
        }
    }

    /// Current snapshot, taken on the spot when the collector has not run.
    fn snapshot(&self) -> Snapshot {
        let mut state = self.state.lock();
        if let Some(snapshot) = state.snapshot {
            return snapshot;
        }
        let snapshot = Snapshot::take(&mut state.system);
        state.snapshot = Some(snapshot);
        snapshot
    }

    fn refresh(&self) {
        let mut state = self.state.lock();
        let snapshot = Snapshot::take(&mut state.system);
        state.snapshot = Some(snapshot);
    }
}

impl Default for SystemPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exporter for SystemPlugin {
    async fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &ExportContext,
    ) -> Result<Option<Value>, PluginError> {
        let value = match key {
            "system.uptime" => {
                if !params.is_empty() {
                    return Err(PluginError::invalid_params("Too many parameters."));
                }
                Value::Unsigned(System::uptime())
            }
            "system.cpu.num" => {
                if params.len() > 1 {
                    return Err(PluginError::invalid_params("Too many parameters."));
                }
                match params.first().map(String::as_str) {
                    None | Some("") | Some("online") | Some("max") => {}
                    Some(_) => return Err(PluginError::invalid_params("Invalid first parameter.")),
                }
                Value::from(self.snapshot().cpu_num)
            }
            "system.cpu.load" => self.snapshot().cpu_load(params)?,
            "vm.memory.size" => self.snapshot().memory_size(params)?,
            _ => return Err(PluginError::Unsupported(key.to_string())),
        };
        Ok(Some(value))
    }
}

#[async_trait]
impl Collector for SystemPlugin {
    async fn collect(&self) -> Result<(), PluginError> {
        self.refresh();
        Ok(())
    }

    fn period(&self) -> u32 {
        COLLECT_PERIOD_SECS
    }
}

#[async_trait]
impl Runner for SystemPlugin {
    async fn start(&self) {
        self.refresh();
        info!("System metrics collection started");
    }

    async fn stop(&self) {
        self.state.lock().snapshot = None;
        debug!("System metrics collection stopped");
    }
}

impl Plugin for SystemPlugin {
    fn as_exporter(&self) -> Option<&dyn Exporter> {
        Some(self)
    }

    fn as_collector(&self) -> Option<&dyn Collector> {
        Some(self)
    }

    fn as_runner(&self) -> Option<&dyn Runner> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snapshot() -> Snapshot {
        Snapshot {
            cpu_num: 4,
            load: [2.0, 1.0, 0.5],
            total_memory: 1000,
            free_memory: 200,
            used_memory: 600,
            available_memory: 400,
        }
    }

    fn params(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_cpu_load_params() {
        let s = snapshot();
        assert_eq!(s.cpu_load(&[]).unwrap(), Value::Float(2.0));
        assert_eq!(s.cpu_load(&params(&["all", "avg5"])).unwrap(), Value::Float(1.0));
        assert_eq!(s.cpu_load(&params(&["percpu", "avg1"])).unwrap(), Value::Float(0.5));
        assert!(s.cpu_load(&params(&["some"])).is_err());
        assert!(s.cpu_load(&params(&["all", "avg2"])).is_err());
        assert!(s.cpu_load(&params(&["all", "avg1", "x"])).is_err());
    }

    #[test]
    fn test_memory_size_params() {
        let s = snapshot();
        assert_eq!(s.memory_size(&[]).unwrap(), Value::Unsigned(1000));
        assert_eq!(s.memory_size(&params(&["free"])).unwrap(), Value::Unsigned(200));
        assert_eq!(s.memory_size(&params(&["pused"])).unwrap(), Value::Float(60.0));
        assert_eq!(s.memory_size(&params(&["pavailable"])).unwrap(), Value::Float(40.0));
        assert!(s.memory_size(&params(&["cached"])).is_err());
    }

    #[tokio::test]
    async fn test_export_reads_host() {
        let plugin = SystemPlugin::new();
        let ctx = ExportContext {
            item_id: 1,
            client_id: 101,
            timeout: Duration::from_secs(3),
        };
        plugin.collect().await.unwrap();

        let Some(Value::Unsigned(total)) = plugin.export("vm.memory.size", &[], &ctx).await.unwrap()
        else {
            panic!("memory size must be unsigned");
        };
        assert!(total > 0);
        assert!(plugin.export("system.cpu.num", &params(&["bogus"]), &ctx).await.is_err());
        assert!(plugin.export("system.unknown", &[], &ctx).await.is_err());
    }
}
