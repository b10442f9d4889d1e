//! Scheduled tasks and their executions.
//!
//! A [`Task`] is one schedulable unit of work bound to one plugin. It lives in
//! the manager's task table for its whole life: while pending it is also
//! referenced by its plugin's queue, while executing it is referenced by an
//! [`Execution`] running on the runtime. The execution reports back with a
//! [`Completion`] and the manager decides whether the task runs again.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, Utc};
use futures::FutureExt;
use item_delay::{Delay, DelayError, next_check_unsupported};
use plugin_api::{ExportContext, ItemResult, RegisteredPlugin, ResultWriter, WatchItem};
use tracing::{debug, warn};

/// Retry delay used when the next check cannot be computed.
pub const FALLBACK_RETRY_SECS: i64 = 60;

/// Identifier of a task in the manager's task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a plugin in the registry and in the manager's plugin table.
pub type PluginId = usize;

/// A recurring item check for an active requester.
#[derive(Debug, Clone)]
pub struct ExporterItem {
    pub item_id: u64,
    /// Key as requested, including parameters.
    pub key: String,
    /// Key name used for plugin lookup.
    pub name: String,
    pub params: Vec<String>,
    /// Delay as requested, used to detect interval changes.
    pub delay_text: String,
    pub delay: Delay,
    pub timeout: Duration,
    /// Whether the previous execution failed.
    pub failed: bool,
}

/// A single check requested by a built-in requester.
#[derive(Clone)]
pub struct DirectRequest {
    pub item_id: u64,
    pub name: String,
    pub params: Vec<String>,
    pub timeout: Duration,
    pub sink: Arc<dyn ResultWriter>,
}

/// The full watched item set of one requester for one plugin.
#[derive(Clone)]
pub struct WatchRequest {
    pub items: Vec<WatchItem>,
    pub sink: Arc<dyn ResultWriter>,
}

/// What a task does when dispatched.
#[derive(Clone)]
pub enum TaskKind {
    Starter,
    Collector,
    Watcher(WatchRequest),
    Exporter(ExporterItem),
    Direct(DirectRequest),
    Stopper,
}

impl TaskKind {
    /// Offset added to the due time so tasks due in the same second run in
    /// a fixed order: starters first, stoppers last.
    pub fn priority(&self) -> TimeDelta {
        let offset = match self {
            TaskKind::Starter => 0,
            TaskKind::Collector => 1,
            TaskKind::Watcher(_) => 2,
            TaskKind::Exporter(_) => 3,
            TaskKind::Direct(_) => 4,
            TaskKind::Stopper => 5,
        };
        TimeDelta::nanoseconds(offset)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Starter => "starter",
            TaskKind::Collector => "collector",
            TaskKind::Watcher(_) => "watcher",
            TaskKind::Exporter(_) => "exporter",
            TaskKind::Direct(_) => "direct",
            TaskKind::Stopper => "stopper",
        }
    }

    /// Recurring tasks are rescheduled after every execution.
    pub fn is_recurring(&self) -> bool {
        matches!(self, TaskKind::Exporter(_) | TaskKind::Collector)
    }

    /// Exporter tasks share the plugin; every other kind needs all of it.
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, TaskKind::Exporter(_) | TaskKind::Direct(_))
    }
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Exporter(item) => f.debug_tuple("Exporter").field(item).finish(),
            TaskKind::Direct(req) => write!(f, "Direct({})", req.name),
            TaskKind::Watcher(req) => write!(f, "Watcher({} items)", req.items.len()),
            other => f.write_str(other.name()),
        }
    }
}

/// Inputs of a reschedule that live outside the task.
#[derive(Debug, Clone, Copy)]
pub struct RescheduleContext {
    /// Retry interval for failed exporter checks, in seconds.
    pub refresh_unsupported: u32,
    /// Collector period of the owning plugin, in seconds.
    pub collector_period: u32,
}

/// One schedulable unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub plugin: PluginId,
    /// Requester owning the task, 0 for plugin lifecycle tasks.
    pub client: u64,
    /// When the task becomes due.
    pub scheduled: DateTime<Utc>,
    /// Capacity consumed while executing.
    pub weight: u32,
    /// Cleared when the owning item or plugin usage goes away; an inactive
    /// task is discarded when its execution completes.
    pub active: bool,
    pub kind: TaskKind,
}

impl Task {
    pub fn new(id: TaskId, plugin: PluginId, client: u64, weight: u32, kind: TaskKind) -> Self {
        Self {
            id,
            plugin,
            client,
            scheduled: DateTime::<Utc>::MIN_UTC,
            weight,
            active: true,
            kind,
        }
    }

    /// Compute the next due time after `now`.
    ///
    /// On error the due time is left untouched; callers fall back to
    /// [`Task::schedule_fallback`].
    pub fn reschedule(
        &mut self,
        now: DateTime<Utc>,
        ctx: &RescheduleContext,
    ) -> Result<(), DelayError> {
        let next = match &self.kind {
            TaskKind::Exporter(item) if item.failed => {
                next_check_unsupported(item.item_id, now, ctx.refresh_unsupported)?
            }
            TaskKind::Exporter(item) => item.delay.next_check(item.item_id, now, &Local)?,
            TaskKind::Collector => {
                Delay::simple(ctx.collector_period).next_check(0, now, &Utc)?
            }
            _ => now,
        };
        self.scheduled = next + self.kind.priority();
        Ok(())
    }

    /// Schedule a retry after a failed next check computation.
    pub fn schedule_fallback(&mut self, now: DateTime<Utc>) {
        self.scheduled = now + TimeDelta::seconds(FALLBACK_RETRY_SECS) + self.kind.priority();
    }

    /// Make the task due immediately.
    pub fn schedule_now(&mut self, now: DateTime<Utc>) {
        self.scheduled = now + self.kind.priority();
    }

    /// Build the owned execution for a dispatch.
    ///
    /// `sink` is the owning requester's result writer, used by exporter
    /// tasks. Other kinds carry their own sink or produce no results.
    pub fn execution(
        &self,
        plugin: Arc<RegisteredPlugin>,
        sink: Option<Arc<dyn ResultWriter>>,
    ) -> Execution {
        let job = match &self.kind {
            TaskKind::Exporter(item) => Job::Export {
                item_id: item.item_id,
                name: item.name.clone(),
                params: item.params.clone(),
                timeout: item.timeout,
                sink,
                always_report: false,
            },
            TaskKind::Direct(req) => Job::Export {
                item_id: req.item_id,
                name: req.name.clone(),
                params: req.params.clone(),
                timeout: req.timeout,
                sink: Some(req.sink.clone()),
                always_report: true,
            },
            TaskKind::Collector => Job::Collect,
            TaskKind::Starter => Job::Start,
            TaskKind::Stopper => Job::Stop,
            TaskKind::Watcher(req) => Job::Watch {
                items: req.items.clone(),
                sink: req.sink.clone(),
            },
        };
        Execution {
            task_id: self.id,
            client_id: self.client,
            plugin,
            job,
        }
    }
}

enum Job {
    Export {
        item_id: u64,
        name: String,
        params: Vec<String>,
        timeout: Duration,
        sink: Option<Arc<dyn ResultWriter>>,
        always_report: bool,
    },
    Collect,
    Start,
    Stop,
    Watch {
        items: Vec<WatchItem>,
        sink: Arc<dyn ResultWriter>,
    },
}

/// Report sent back to the manager when an execution finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub task_id: TaskId,
    /// Whether the plugin reported an error.
    pub failed: bool,
}

/// A dispatched task, detached from the manager's state.
pub struct Execution {
    task_id: TaskId,
    client_id: u64,
    plugin: Arc<RegisteredPlugin>,
    job: Job,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Execution {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin.name()
    }

    /// Run the plugin code. Never fails: plugin errors, timeouts and panics
    /// are turned into error results so the reserved capacity is always
    /// released by the completion.
    pub async fn run(self) -> Completion {
        let plugin = self.plugin.instance().clone();
        let name = self.plugin.name();
        let mut failed = false;

        match self.job {
            Job::Export {
                item_id,
                name: key,
                params,
                timeout,
                sink,
                always_report,
            } => {
                let outcome = match plugin.as_exporter() {
                    Some(exporter) => {
                        let ctx = ExportContext {
                            item_id,
                            client_id: self.client_id,
                            timeout,
                        };
                        let call = AssertUnwindSafe(exporter.export(&key, &params, &ctx));
                        match tokio::time::timeout(timeout, call.catch_unwind()).await {
                            Ok(Ok(result)) => result.map_err(|e| e.to_string()),
                            Ok(Err(payload)) => {
                                let msg = panic_message(payload);
                                warn!(plugin = %name, key = %key, panic = %msg, "Plugin panicked during export");
                                Err(format!("Plugin failed: {}", msg))
                            }
                            Err(_) => Err(crate::Error::Timeout.to_string()),
                        }
                    }
                    None => Err("Unsupported item key.".to_string()),
                };

                let now = Utc::now();
                let result = match outcome {
                    Ok(Some(value)) => Some(ItemResult::value(item_id, Some(value), now)),
                    Ok(None) if always_report => Some(ItemResult::value(item_id, None, now)),
                    Ok(None) => None,
                    Err(error) => {
                        debug!(plugin = %name, key = %key, item_id, error = %error, "Check failed");
                        failed = true;
                        Some(ItemResult::error(item_id, error, now))
                    }
                };
                if let (Some(result), Some(sink)) = (result, sink) {
                    sink.write(result);
                }
            }
            Job::Collect => {
                if let Some(collector) = plugin.as_collector() {
                    match AssertUnwindSafe(collector.collect()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(plugin = %name, error = %e, "Collector failed");
                            failed = true;
                        }
                        Err(payload) => {
                            warn!(plugin = %name, panic = %panic_message(payload), "Collector panicked");
                            failed = true;
                        }
                    }
                }
            }
            Job::Start => {
                if let Some(runner) = plugin.as_runner() {
                    debug!(plugin = %name, "Starting plugin");
                    if let Err(payload) = AssertUnwindSafe(runner.start()).catch_unwind().await {
                        warn!(plugin = %name, panic = %panic_message(payload), "Plugin start panicked");
                        failed = true;
                    }
                }
            }
            Job::Stop => {
                if let Some(runner) = plugin.as_runner() {
                    debug!(plugin = %name, "Stopping plugin");
                    if let Err(payload) = AssertUnwindSafe(runner.stop()).catch_unwind().await {
                        warn!(plugin = %name, panic = %panic_message(payload), "Plugin stop panicked");
                        failed = true;
                    }
                }
            }
            Job::Watch { items, sink } => {
                if let Some(watcher) = plugin.as_watcher() {
                    debug!(plugin = %name, items = items.len(), "Updating watched items");
                    if let Err(payload) =
                        AssertUnwindSafe(watcher.watch(items, sink)).catch_unwind().await
                    {
                        warn!(plugin = %name, panic = %panic_message(payload), "Plugin watch panicked");
                        failed = true;
                    }
                }
            }
        }

        Completion {
            task_id: self.task_id,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exporter_item(item_id: u64, delay: &str) -> ExporterItem {
        ExporterItem {
            item_id,
            key: "debug.key".to_string(),
            name: "debug.key".to_string(),
            params: Vec::new(),
            delay_text: delay.to_string(),
            delay: delay.parse().unwrap(),
            timeout: Duration::from_secs(3),
            failed: false,
        }
    }

    fn ctx() -> RescheduleContext {
        RescheduleContext {
            refresh_unsupported: 600,
            collector_period: 10,
        }
    }

    #[test]
    fn test_priority_order() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<ItemResult>();
        let sink: Arc<dyn ResultWriter> = Arc::new(tx);
        let kinds = [
            TaskKind::Starter,
            TaskKind::Collector,
            TaskKind::Watcher(WatchRequest {
                items: Vec::new(),
                sink: sink.clone(),
            }),
            TaskKind::Exporter(exporter_item(1, "1s")),
            TaskKind::Direct(DirectRequest {
                item_id: 0,
                name: "debug.key".to_string(),
                params: Vec::new(),
                timeout: Duration::from_secs(3),
                sink,
            }),
            TaskKind::Stopper,
        ];
        assert!(kinds.windows(2).all(|w| w[0].priority() < w[1].priority()));
    }

    #[test]
    fn test_exporter_reschedule_follows_delay() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut task = Task::new(TaskId(1), 0, 101, 1, TaskKind::Exporter(exporter_item(5, "60s")));
        task.reschedule(now, &ctx()).unwrap();
        // 1_700_000_000 % 60 == 20, seed 5 gives :45 of the same minute
        assert_eq!(task.scheduled.timestamp(), 1_700_000_045);
        assert!(task.scheduled > now);
    }

    #[test]
    fn test_failed_exporter_uses_refresh_unsupported() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut item = exporter_item(0, "1s");
        item.failed = true;
        let mut task = Task::new(TaskId(1), 0, 101, 1, TaskKind::Exporter(item));
        task.reschedule(now, &ctx()).unwrap();
        // 1_700_000_000 % 600 == 200
        assert_eq!(task.scheduled.timestamp(), 1_700_000_400);
    }

    #[test]
    fn test_collector_reschedule_uses_period() {
        let now = DateTime::from_timestamp(1_700_000_003, 0).unwrap();
        let mut task = Task::new(TaskId(1), 0, 0, 10, TaskKind::Collector);
        task.reschedule(now, &ctx()).unwrap();
        assert_eq!(task.scheduled.timestamp(), 1_700_000_010);

        let zero = RescheduleContext {
            collector_period: 0,
            ..ctx()
        };
        assert!(task.reschedule(now, &zero).is_err());
        task.schedule_fallback(now);
        assert_eq!(task.scheduled.timestamp(), 1_700_000_063);
    }

    #[test]
    fn test_one_shot_kinds() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut task = Task::new(TaskId(1), 0, 0, 10, TaskKind::Stopper);
        task.reschedule(now, &ctx()).unwrap();
        assert_eq!(task.scheduled.timestamp(), now.timestamp());
        assert!(!task.kind.is_recurring());
        assert!(task.kind.is_exclusive());
    }
}
