//! Scheduler core.
//!
//! The [`Manager`] owns every piece of scheduling state: the per-plugin task
//! queues, the global queue of plugins, the task table and the requesters.
//! It is a plain synchronous state machine driven by three inputs:
//!
//! - [`Manager::process_update`] applies a requester's item batch
//! - [`Manager::process_finish`] re-admits a task after its execution
//! - [`Manager::process_queue`] pops due, admissible tasks for dispatch
//!
//! The async event loop in [`super::service`] feeds these inputs one at a
//! time, so no locking is involved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use item_delay::{Delay, DelayError};
use plugin_api::{
    ItemResult, KeyError, MetricRegistry, ResultWriter, WatchItem, parse_key,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::client::{Client, Item, is_builtin};
use super::heap::IndexedHeap;
use super::plugin_queue::PluginQueue;
use super::task::{
    Completion, DirectRequest, Execution, ExporterItem, PluginId, RescheduleContext, Task,
    TaskId, TaskKind, WatchRequest,
};
use crate::config::{
    AgentConfig, DEFAULT_MAX_PLUGIN_CAPACITY, DEFAULT_PLUGIN_CAPACITY, plugin_capacity,
    plugin_force_active_checks,
};
use crate::{Error, Result};

/// One item of an update batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub item_id: u64,
    pub key: String,
    /// Update interval, ignored for built-in requesters.
    pub delay: String,
    /// Check timeout, the agent default when unset.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(item_id: u64, key: impl Into<String>, delay: impl Into<String>) -> Self {
        Self {
            item_id,
            key: key.into(),
            delay: delay.into(),
            timeout: None,
        }
    }
}

/// The complete item set of one requester.
///
/// Items missing from a batch are removed.
#[derive(Clone)]
pub struct UpdateRequest {
    pub client_id: u64,
    pub sink: Arc<dyn ResultWriter>,
    pub requests: Vec<Request>,
    /// Retry interval for failed checks, the agent default when unset.
    pub refresh_unsupported: Option<u32>,
}

impl UpdateRequest {
    pub fn new(client_id: u64, sink: Arc<dyn ResultWriter>, requests: Vec<Request>) -> Self {
        Self {
            client_id,
            sink,
            requests,
            refresh_unsupported: None,
        }
    }
}

/// Per-item rejection reasons, reported to the requester as error results.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    #[error("Unknown metric {0}")]
    UnknownMetric(String),

    #[error(transparent)]
    InvalidDelay(#[from] DelayError),
}

/// Snapshot of the scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub plugins: usize,
    /// Plugins currently in the global queue.
    pub queued_plugins: usize,
    pub pending_tasks: usize,
    pub in_flight_tasks: usize,
    pub used_capacity: u64,
    pub clients: usize,
}

/// Snapshot of one plugin's scheduling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginStats {
    pub name: String,
    pub capacity: u32,
    pub used_capacity: u32,
    pub pending_tasks: usize,
    pub queued: bool,
    pub active: bool,
}

/// The scheduler state machine.
pub struct Manager {
    registry: Arc<MetricRegistry>,
    plugins: Vec<PluginQueue>,
    /// Plugins with pending work, keyed by their earliest due time.
    queue: IndexedHeap<PluginId, DateTime<Utc>>,
    tasks: HashMap<TaskId, Task>,
    next_task_id: u64,
    clients: HashMap<u64, Client>,
    in_flight: usize,
    default_timeout: Duration,
    refresh_unsupported: u32,
}

impl Manager {
    /// Create the scheduler state for every plugin in the registry.
    ///
    /// Plugin capacities are resolved from the configuration and each
    /// configurator plugin is validated and configured with its options.
    pub fn new(registry: Arc<MetricRegistry>, config: &AgentConfig) -> Result<Self> {
        let global = config.global_options();
        let mut plugins = Vec::with_capacity(registry.plugins().len());

        for (id, plugin) in registry.plugins().iter().enumerate() {
            let settings = config.plugin(plugin.name());
            let system = settings.map(|s| s.system.clone()).unwrap_or_default();
            let capacity = plugin_capacity(
                system.capacity,
                DEFAULT_PLUGIN_CAPACITY,
                plugin.instance().max_capacity(),
                DEFAULT_MAX_PLUGIN_CAPACITY,
            );
            let force = plugin_force_active_checks(
                system.force_active_checks_on_start,
                config.force_active_checks_on_start,
            );

            if let Some(configurator) = plugin.instance().as_configurator() {
                let options = settings.and_then(|s| s.options.as_ref());
                configurator
                    .validate(options)
                    .map_err(|e| Error::plugin(plugin.name(), e))?;
                configurator.configure(&global, options);
            }

            debug!(
                plugin = %plugin.name(),
                capacity,
                capabilities = %plugin.capabilities(),
                "Plugin queue created"
            );
            plugins.push(PluginQueue::new(id, plugin.clone(), capacity, force));
        }

        for name in config.plugins.keys() {
            if registry.plugin_by_name(name).is_none() {
                warn!(plugin = %name, "Configuration for unknown plugin ignored");
            }
        }

        info!(
            plugins = plugins.len(),
            metrics = registry.len(),
            "Scheduler initialized"
        );

        Ok(Self {
            registry,
            plugins,
            queue: IndexedHeap::new(),
            tasks: HashMap::new(),
            next_task_id: 1,
            clients: HashMap::new(),
            in_flight: 0,
            default_timeout: Duration::from_secs(u64::from(config.timeout_secs)),
            refresh_unsupported: config.refresh_unsupported_secs,
        })
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Apply a requester's item batch.
    pub fn process_update(&mut self, update: UpdateRequest, now: DateTime<Utc>) {
        let UpdateRequest {
            client_id,
            sink,
            requests,
            refresh_unsupported,
        } = update;
        debug!(client_id, requests = requests.len(), "Processing update request");

        if !self.clients.contains_key(&client_id) {
            if requests.is_empty() {
                return;
            }
            self.clients.insert(
                client_id,
                Client::new(client_id, sink.clone(), self.refresh_unsupported),
            );
        }
        let first_update = match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.sink = sink.clone();
                if let Some(refresh) = refresh_unsupported {
                    client.refresh_unsupported = refresh;
                }
                client.begin_batch();
                !client.initialized
            }
            None => return,
        };

        for request in &requests {
            if let Err(error) = self.add_request(client_id, request, &sink, now, first_update) {
                let removed = self
                    .clients
                    .get_mut(&client_id)
                    .and_then(|c| c.items.remove(&request.item_id));
                if let Some(item) = removed {
                    self.deactivate_task(item.task);
                }
                warn!(
                    client_id,
                    item_id = request.item_id,
                    key = %request.key,
                    error = %error,
                    "Cannot schedule item"
                );
                sink.write(ItemResult::error(request.item_id, &error, now));
            }
        }

        if let Some(client) = self.clients.get_mut(&client_id) {
            client.initialized = true;
        }
        self.release_unused(client_id, now);
        self.schedule_watchers(client_id, now);

        if self.clients.get(&client_id).is_some_and(Client::is_idle) {
            debug!(client_id, "Removing idle client");
            self.clients.remove(&client_id);
        }
    }

    fn add_request(
        &mut self,
        client_id: u64,
        request: &Request,
        sink: &Arc<dyn ResultWriter>,
        now: DateTime<Utc>,
        first_update: bool,
    ) -> std::result::Result<(), RequestError> {
        let (name, params) = parse_key(&request.key)?;
        let pid = self
            .registry
            .get(&name)
            .map(|m| m.plugin_index)
            .ok_or_else(|| RequestError::UnknownMetric(name.clone()))?;
        let caps = self.plugins[pid].plugin().capabilities();
        let builtin = is_builtin(client_id);
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        if caps.exporter {
            if builtin {
                let kind = TaskKind::Direct(DirectRequest {
                    item_id: request.item_id,
                    name: name.clone(),
                    params: params.clone(),
                    timeout,
                    sink: sink.clone(),
                });
                let task_id = self.create_task(pid, client_id, kind);
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.schedule_now(now);
                }
                self.enqueue_task(task_id);
            } else {
                let delay: Delay = request.delay.parse()?;
                let item = ExporterItem {
                    item_id: request.item_id,
                    key: request.key.clone(),
                    name: name.clone(),
                    params: params.clone(),
                    delay_text: request.delay.clone(),
                    delay,
                    timeout,
                    failed: false,
                };
                self.upsert_exporter(client_id, pid, item, now, first_update);
            }
        }

        self.use_plugin(client_id, pid, now);

        if caps.watcher && !builtin {
            if let Some(usage) = self
                .clients
                .get_mut(&client_id)
                .and_then(|c| c.plugins.get_mut(&pid))
            {
                usage.watch_items.push(WatchItem {
                    item_id: request.item_id,
                    key: name,
                    params,
                });
            }
        }
        Ok(())
    }

    /// Create or update the exporter task of an active requester's item.
    fn upsert_exporter(
        &mut self,
        client_id: u64,
        pid: PluginId,
        item: ExporterItem,
        now: DateTime<Utc>,
        first_update: bool,
    ) {
        let item_id = item.item_id;
        let existing = self
            .clients
            .get(&client_id)
            .and_then(|c| c.items.get(&item_id))
            .map(|i| i.task)
            .filter(|task_id| {
                self.tasks
                    .get(task_id)
                    .is_some_and(|t| t.active && t.plugin == pid)
            });

        let Some(task_id) = existing else {
            // the key may have moved the item to another plugin
            let previous = self
                .clients
                .get_mut(&client_id)
                .and_then(|c| c.items.remove(&item_id));
            if let Some(previous) = previous {
                self.deactivate_task(previous.task);
            }

            let key = item.key.clone();
            let task_id = self.create_task(pid, client_id, TaskKind::Exporter(item));
            if first_update && self.plugins[pid].force_active_checks_on_start {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.schedule_now(now);
                }
            } else {
                self.reschedule_task(task_id, now);
            }
            self.enqueue_task(task_id);
            if let Some(client) = self.clients.get_mut(&client_id) {
                let generation = client.generation;
                client.items.insert(item_id, Item { task: task_id, generation });
            }
            debug!(
                client_id,
                plugin = %self.plugins[pid].name(),
                item_id,
                key = %key,
                "Created exporter task"
            );
            return;
        };

        if let Some(client) = self.clients.get_mut(&client_id) {
            let generation = client.generation;
            if let Some(record) = client.items.get_mut(&item_id) {
                record.generation = generation;
            }
        }

        let mut delay_changed = false;
        if let Some(TaskKind::Exporter(current)) = self.tasks.get_mut(&task_id).map(|t| &mut t.kind)
        {
            delay_changed = current.delay_text != item.delay_text;
            current.key = item.key;
            current.name = item.name;
            current.params = item.params;
            current.timeout = item.timeout;
            if delay_changed {
                current.delay_text = item.delay_text;
                current.delay = item.delay;
            }
        }

        if delay_changed {
            self.reschedule_task(task_id, now);
            let due = self.tasks.get(&task_id).map(|t| t.scheduled);
            // an executing task picks up the new delay when it completes
            if let Some(due) = due {
                if self.plugins[pid].update(task_id, due) {
                    self.requeue_plugin(pid);
                }
            }
            debug!(
                client_id,
                plugin = %self.plugins[pid].name(),
                item_id,
                "Updated exporter task interval"
            );
        }
    }

    /// Record that a requester uses a plugin in the batch processed at `now`.
    fn use_plugin(&mut self, client_id: u64, pid: PluginId, now: DateTime<Utc>) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        let generation = client.generation;
        let usage = client.plugins.entry(pid).or_default();
        let newly_used = usage.generation.is_none();
        if usage.generation != Some(generation) {
            usage.watch_items.clear();
        }
        usage.generation = Some(generation);
        usage.last_used = Some(now);

        if newly_used {
            let plugin = &mut self.plugins[pid];
            plugin.refcount += 1;
            if plugin.refcount == 1 {
                self.activate_plugin(pid, now);
            }
        }
    }

    /// Drop items and plugin usage the requester no longer asks for.
    fn release_unused(&mut self, client_id: u64, now: DateTime<Utc>) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        let stale = client.stale_items();
        for (item_id, _) in &stale {
            client.items.remove(item_id);
        }
        let mut released = Vec::new();
        for pid in client.expired_plugins(now) {
            if let Some(usage) = client.plugins.remove(&pid) {
                released.push((pid, usage));
            }
        }
        let sink = client.sink.clone();
        let builtin = client.is_builtin();

        for (item_id, task_id) in stale {
            debug!(client_id, item_id, "Removing item no longer requested");
            self.deactivate_task(task_id);
        }

        for (pid, usage) in released {
            debug!(client_id, plugin = %self.plugins[pid].name(), "Releasing plugin");
            if self.plugins[pid].plugin().capabilities().watcher && !builtin {
                self.schedule_watch(client_id, pid, Vec::new(), sink.clone(), usage.watch_task, now);
            }
            let plugin = &mut self.plugins[pid];
            plugin.refcount = plugin.refcount.saturating_sub(1);
            if plugin.refcount == 0 {
                self.deactivate_plugin(pid, now);
            }
        }
    }

    /// Hand the watched item sets collected from this batch to their plugins.
    fn schedule_watchers(&mut self, client_id: u64, now: DateTime<Utc>) {
        let Some(client) = self.clients.get(&client_id) else {
            return;
        };
        if client.is_builtin() {
            return;
        }
        let sink = client.sink.clone();
        let mut updates: Vec<(PluginId, Vec<WatchItem>, Option<TaskId>)> = client
            .plugins
            .iter()
            .filter(|(pid, usage)| {
                client.uses_in_batch(usage) && self.plugins[**pid].plugin().capabilities().watcher
            })
            .map(|(pid, usage)| (*pid, usage.watch_items.clone(), usage.watch_task))
            .collect();
        updates.sort_by_key(|(pid, _, _)| *pid);

        for (pid, items, pending) in updates {
            let task_id = self.schedule_watch(client_id, pid, items, sink.clone(), pending, now);
            if let Some(usage) = self
                .clients
                .get_mut(&client_id)
                .and_then(|c| c.plugins.get_mut(&pid))
            {
                usage.watch_task = Some(task_id);
            }
        }
    }

    /// Queue a watch update, reusing a watch task that has not run yet.
    fn schedule_watch(
        &mut self,
        client_id: u64,
        pid: PluginId,
        items: Vec<WatchItem>,
        sink: Arc<dyn ResultWriter>,
        pending: Option<TaskId>,
        now: DateTime<Utc>,
    ) -> TaskId {
        if let Some(task_id) = pending.filter(|t| self.plugins[pid].contains(*t)) {
            if let Some(TaskKind::Watcher(request)) =
                self.tasks.get_mut(&task_id).map(|t| &mut t.kind)
            {
                request.items = items;
                request.sink = sink;
                return task_id;
            }
        }
        let task_id = self.create_task(
            pid,
            client_id,
            TaskKind::Watcher(WatchRequest { items, sink }),
        );
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.schedule_now(now);
        }
        self.enqueue_task(task_id);
        task_id
    }

    /// First requester started using the plugin.
    fn activate_plugin(&mut self, pid: PluginId, now: DateTime<Utc>) {
        let caps = self.plugins[pid].plugin().capabilities();
        debug!(plugin = %self.plugins[pid].name(), "Activating plugin");

        if caps.runner {
            let task_id = self.create_task(pid, 0, TaskKind::Starter);
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.schedule_now(now);
            }
            self.enqueue_task(task_id);
        }
        if caps.collector && self.plugins[pid].collector_task.is_none() {
            let task_id = self.create_task(pid, 0, TaskKind::Collector);
            self.reschedule_task(task_id, now);
            self.enqueue_task(task_id);
            self.plugins[pid].collector_task = Some(task_id);
        }
    }

    /// Last requester stopped using the plugin.
    fn deactivate_plugin(&mut self, pid: PluginId, now: DateTime<Utc>) {
        debug!(plugin = %self.plugins[pid].name(), "Deactivating plugin");
        if let Some(task_id) = self.plugins[pid].collector_task.take() {
            self.deactivate_task(task_id);
        }
        if self.plugins[pid].plugin().capabilities().runner {
            let task_id = self.create_task(pid, 0, TaskKind::Stopper);
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.schedule_now(now);
            }
            self.enqueue_task(task_id);
        }
    }

    fn create_task(&mut self, pid: PluginId, client_id: u64, kind: TaskKind) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;
        let weight = if kind.is_exclusive() {
            self.plugins[pid].capacity()
        } else {
            1
        };
        self.tasks.insert(id, Task::new(id, pid, client_id, weight, kind));
        id
    }

    fn reschedule_context(&self, task: &Task) -> RescheduleContext {
        let refresh_unsupported = self
            .clients
            .get(&task.client)
            .map(|c| c.refresh_unsupported)
            .unwrap_or(self.refresh_unsupported);
        let collector_period = self.plugins[task.plugin]
            .plugin()
            .instance()
            .as_collector()
            .map(|c| c.period())
            .unwrap_or(0);
        RescheduleContext {
            refresh_unsupported,
            collector_period,
        }
    }

    /// Compute a task's next due time, falling back to a fixed retry delay
    /// and reporting the failure to the owning requester.
    fn reschedule_task(&mut self, task_id: TaskId, now: DateTime<Utc>) {
        let Some(ctx) = self.tasks.get(&task_id).map(|t| self.reschedule_context(t)) else {
            return;
        };
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if let Err(error) = task.reschedule(now, &ctx) {
            task.schedule_fallback(now);
            warn!(
                task = %task_id,
                kind = task.kind.name(),
                error = %error,
                "Cannot compute next check, retrying later"
            );
            if let TaskKind::Exporter(item) = &task.kind {
                if let Some(client) = self.clients.get(&task.client) {
                    client.sink.write(ItemResult::error(item.item_id, &error, now));
                }
            }
        }
    }

    fn enqueue_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        let pid = task.plugin;
        self.plugins[pid].enqueue(task_id, task.scheduled, task.weight);
        self.requeue_plugin(pid);
    }

    /// Stop scheduling a task. A pending task is dropped at once, an
    /// executing one when its completion arrives.
    fn deactivate_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        task.active = false;
        let pid = task.plugin;
        if self.plugins[pid].remove(task_id) {
            self.tasks.remove(&task_id);
            self.requeue_plugin(pid);
        }
    }

    /// Reposition a plugin in the global queue after its earliest task or
    /// its free capacity changed.
    ///
    /// A plugin with no pending tasks leaves the queue. A plugin that is not
    /// queued only enters it when its earliest task fits its free capacity.
    fn requeue_plugin(&mut self, pid: PluginId) {
        let plugin = &self.plugins[pid];
        match plugin.peek() {
            None => {
                self.queue.remove(pid);
            }
            Some((_, due)) => {
                if self.queue.contains(pid) {
                    self.queue.update(pid, due);
                } else if plugin.has_capacity() {
                    self.queue.push(pid, due);
                }
            }
        }
    }

    /// Run one drain pass: pop every due task whose plugin has capacity.
    ///
    /// A plugin that cannot admit its earliest task is left out of the
    /// global queue until one of its executions completes.
    pub fn process_queue(&mut self, now: DateTime<Utc>) -> Vec<Execution> {
        let mut executions = Vec::new();
        let now_secs = now.timestamp();

        while let Some((pid, _)) = self.queue.peek() {
            let plugin = &mut self.plugins[pid];
            let Some((_, due)) = plugin.peek() else {
                self.queue.pop();
                continue;
            };
            if due.timestamp() > now_secs {
                break;
            }
            self.queue.pop();

            let Some((task_id, weight)) = plugin.begin_task() else {
                debug!(
                    plugin = %plugin.name(),
                    used = plugin.used_capacity(),
                    capacity = plugin.capacity(),
                    "Plugin has no free capacity"
                );
                continue;
            };
            let registered = plugin.plugin().clone();
            if plugin.has_capacity() {
                if let Some((_, next_due)) = plugin.peek() {
                    self.queue.push(pid, next_due);
                }
            }

            match self.tasks.get(&task_id) {
                Some(task) => {
                    let sink = self.clients.get(&task.client).map(|c| c.sink.clone());
                    debug!(
                        task = %task_id,
                        kind = task.kind.name(),
                        plugin = %registered.name(),
                        "Dispatching task"
                    );
                    executions.push(task.execution(registered, sink));
                    self.in_flight += 1;
                }
                None => {
                    warn!(task = %task_id, "Queued task has no entry, dropping");
                    self.plugins[pid].end_task(weight);
                    self.requeue_plugin(pid);
                }
            }
        }
        executions
    }

    /// Release the capacity of a finished execution and re-admit the task
    /// when it is recurring and still wanted.
    pub fn process_finish(&mut self, completion: Completion, now: DateTime<Utc>) {
        let Some(mut task) = self.tasks.remove(&completion.task_id) else {
            warn!(task = %completion.task_id, "Completion for unknown task");
            return;
        };
        self.in_flight = self.in_flight.saturating_sub(1);
        let pid = task.plugin;
        self.plugins[pid].end_task(task.weight);

        if task.active && task.kind.is_recurring() {
            if let TaskKind::Exporter(item) = &mut task.kind {
                item.failed = completion.failed;
            }
            let task_id = task.id;
            self.tasks.insert(task_id, task);
            self.reschedule_task(task_id, now);
            self.enqueue_task(task_id);
        } else {
            debug!(task = %task.id, kind = task.kind.name(), "Task finished");
            self.requeue_plugin(pid);
        }
    }

    /// Runner plugins that are still in use.
    pub fn active_runners(&self) -> Vec<Arc<plugin_api::RegisteredPlugin>> {
        self.plugins
            .iter()
            .filter(|p| p.is_active() && p.plugin().capabilities().runner)
            .map(|p| p.plugin().clone())
            .collect()
    }

    /// Stop every runner plugin still in use.
    pub async fn stop_runners(&self) {
        for plugin in self.active_runners() {
            if let Some(runner) = plugin.instance().as_runner() {
                info!(plugin = %plugin.name(), "Stopping plugin");
                runner.stop().await;
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            plugins: self.plugins.len(),
            queued_plugins: self.queue.len(),
            pending_tasks: self.plugins.iter().map(PluginQueue::len).sum(),
            in_flight_tasks: self.in_flight,
            used_capacity: self
                .plugins
                .iter()
                .map(|p| u64::from(p.used_capacity()))
                .sum(),
            clients: self.clients.len(),
        }
    }

    pub fn plugin_stats(&self, name: &str) -> Option<PluginStats> {
        let plugin = self.plugins.iter().find(|p| p.name() == name)?;
        Some(PluginStats {
            name: plugin.name().to_string(),
            capacity: plugin.capacity(),
            used_capacity: plugin.used_capacity(),
            pending_tasks: plugin.len(),
            queued: self.queue.contains(plugin.id()),
            active: plugin.is_active(),
        })
    }

    /// Due time of the earliest pending task across all queued plugins.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue.peek().map(|(_, due)| *due)
    }

    /// Check the internal consistency of the scheduling state.
    pub fn verify(&self) -> std::result::Result<(), String> {
        if !self.queue.is_valid() {
            return Err("global queue violates the heap property".to_string());
        }

        let mut executing_weight = vec![0u32; self.plugins.len()];
        let mut executing = 0;
        for (id, task) in &self.tasks {
            let queued_in = self.plugins.iter().filter(|p| p.contains(*id)).count();
            match queued_in {
                0 => {
                    executing += 1;
                    executing_weight[task.plugin] += task.weight;
                }
                1 if self.plugins[task.plugin].contains(*id) => {}
                _ => return Err(format!("task {} is queued in the wrong place", id)),
            }
        }
        if executing != self.in_flight {
            return Err(format!(
                "{} tasks are executing but {} are accounted",
                executing, self.in_flight
            ));
        }

        for plugin in &self.plugins {
            if plugin.used_capacity() > plugin.capacity() {
                return Err(format!("plugin {} exceeds its capacity", plugin.name()));
            }
            if plugin.used_capacity() != executing_weight[plugin.id()] {
                return Err(format!(
                    "plugin {} uses {} but executes weight {}",
                    plugin.name(),
                    plugin.used_capacity(),
                    executing_weight[plugin.id()]
                ));
            }
            if !plugin.is_valid() {
                return Err(format!("plugin {} queue violates the heap property", plugin.name()));
            }
            match (self.queue.key(plugin.id()), plugin.peek()) {
                (Some(_), None) => {
                    return Err(format!("plugin {} is queued without tasks", plugin.name()));
                }
                (Some(key), Some((_, due))) if *key != due => {
                    return Err(format!("plugin {} is queued at a stale time", plugin.name()));
                }
                (None, Some(_)) if plugin.has_capacity() => {
                    return Err(format!(
                        "plugin {} has admissible work but is not queued",
                        plugin.name()
                    ));
                }
                _ => {}
            }
            for (task_id, _) in plugin.pending() {
                if !self.tasks.contains_key(&task_id) {
                    return Err(format!("plugin {} queues unknown task {}", plugin.name(), task_id));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plugin_api::{ExportContext, Exporter, Plugin, PluginError, Runner, Value};
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl Exporter for Echo {
        async fn export(
            &self,
            key: &str,
            _params: &[String],
            _ctx: &ExportContext,
        ) -> std::result::Result<Option<Value>, PluginError> {
            Ok(Some(Value::from(key)))
        }
    }

    impl Plugin for Echo {
        fn as_exporter(&self) -> Option<&dyn Exporter> {
            Some(self)
        }
    }

    struct Service;

    #[async_trait]
    impl Runner for Service {
        async fn start(&self) {}
        async fn stop(&self) {}
    }

    #[async_trait]
    impl Exporter for Service {
        async fn export(
            &self,
            _key: &str,
            _params: &[String],
            _ctx: &ExportContext,
        ) -> std::result::Result<Option<Value>, PluginError> {
            Ok(Some(Value::from(1u64)))
        }
    }

    impl Plugin for Service {
        fn max_capacity(&self) -> u32 {
            2
        }

        fn as_exporter(&self) -> Option<&dyn Exporter> {
            Some(self)
        }

        fn as_runner(&self) -> Option<&dyn Runner> {
            Some(self)
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn manager() -> Manager {
        let mut registry = MetricRegistry::new();
        registry
            .register_metrics(Arc::new(Echo), "echo", &[("echo.value", "Echo the key")])
            .unwrap();
        registry
            .register_metrics(Arc::new(Service), "service", &[("service.up", "Service state")])
            .unwrap();
        Manager::new(Arc::new(registry), &AgentConfig::default()).unwrap()
    }

    fn sink() -> (Arc<dyn ResultWriter>, mpsc::UnboundedReceiver<ItemResult>) {
        let (tx, rx) = mpsc::unbounded_channel::<ItemResult>();
        (Arc::new(tx), rx)
    }

    #[test]
    fn test_unknown_metric_reports_error() {
        let mut manager = manager();
        let (sink, mut rx) = sink();
        let update = UpdateRequest::new(101, sink, vec![Request::new(7, "missing.key", "10s")]);
        manager.process_update(update, at(1_700_000_000));

        let result = rx.try_recv().unwrap();
        assert_eq!(result.item_id, 7);
        assert_eq!(result.error.as_deref(), Some("Unknown metric missing.key"));
        assert_eq!(manager.stats().clients, 0);
        manager.verify().unwrap();
    }

    #[test]
    fn test_invalid_delay_reports_error() {
        let mut manager = manager();
        let (sink, mut rx) = sink();
        let update = UpdateRequest::new(101, sink, vec![Request::new(3, "echo.value", "0")]);
        manager.process_update(update, at(1_700_000_000));

        let result = rx.try_recv().unwrap();
        assert_eq!(result.item_id, 3);
        assert!(result.is_error());
        assert_eq!(manager.stats().pending_tasks, 0);
        manager.verify().unwrap();
    }

    #[tokio::test]
    async fn test_exporter_runs_and_is_rescheduled() {
        let mut manager = manager();
        let (sink, mut rx) = sink();
        let update = UpdateRequest::new(101, sink, vec![Request::new(1, "echo.value", "10s")]);
        manager.process_update(update, at(1_700_000_000));

        assert!(manager.process_queue(at(1_700_000_000)).is_empty());
        let executions = manager.process_queue(at(1_700_000_001));
        assert_eq!(executions.len(), 1);
        assert_eq!(manager.stats().in_flight_tasks, 1);
        manager.verify().unwrap();

        let completion = executions.into_iter().next().unwrap().run().await;
        assert!(!completion.failed);
        manager.process_finish(completion, at(1_700_000_001));
        manager.verify().unwrap();

        let result = rx.try_recv().unwrap();
        assert_eq!(result.value, Some(Value::from("echo.value")));
        assert_eq!(manager.next_due().map(|t| t.timestamp()), Some(1_700_000_011));
    }

    #[test]
    fn test_starter_excludes_other_tasks() {
        let mut manager = manager();
        let (sink, _rx) = sink();
        let requests = vec![
            Request::new(1, "service.up", "1s"),
            Request::new(2, "service.up", "1s"),
        ];
        manager.process_update(UpdateRequest::new(101, sink, requests), at(1_700_000_000));

        let executions = manager.process_queue(at(1_700_000_000));
        assert_eq!(executions.len(), 1);
        let stats = manager.plugin_stats("service").unwrap();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.used_capacity, 2);
        assert!(!stats.queued);
        manager.verify().unwrap();

        // the exporters stay blocked while the starter runs
        assert!(manager.process_queue(at(1_700_000_005)).is_empty());

        let starter = executions[0].task_id();
        manager.process_finish(Completion { task_id: starter, failed: false }, at(1_700_000_005));
        manager.verify().unwrap();

        let executions = manager.process_queue(at(1_700_000_005));
        assert_eq!(executions.len(), 2);
        assert_eq!(manager.plugin_stats("service").unwrap().used_capacity, 2);
        manager.verify().unwrap();
    }

    #[test]
    fn test_empty_batch_for_unknown_client_is_ignored() {
        let mut manager = manager();
        let (sink, _rx) = sink();
        manager.process_update(UpdateRequest::new(200, sink, Vec::new()), at(1_700_000_000));
        assert_eq!(manager.stats(), SchedulerStats {
            plugins: 2,
            ..SchedulerStats::default()
        });
    }
}
