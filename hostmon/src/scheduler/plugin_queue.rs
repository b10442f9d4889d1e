//! Per-plugin task queue with capacity admission.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use plugin_api::RegisteredPlugin;

use super::heap::IndexedHeap;
use super::task::{PluginId, TaskId};

/// Scheduling state of one plugin instance.
///
/// Pending tasks are kept in a min-heap by due time. The sum of the weights
/// of executing tasks never exceeds the plugin capacity.
#[derive(Debug)]
pub struct PluginQueue {
    id: PluginId,
    plugin: Arc<RegisteredPlugin>,
    capacity: u32,
    used_capacity: u32,
    tasks: IndexedHeap<TaskId, DateTime<Utc>>,
    weights: HashMap<TaskId, u32>,
    /// Number of requesters currently using the plugin.
    pub(crate) refcount: usize,
    /// Background collection task while the plugin is in use.
    pub(crate) collector_task: Option<TaskId>,
    /// Whether exporter tasks from a requester's first update run at once.
    pub(crate) force_active_checks_on_start: bool,
}

impl PluginQueue {
    pub fn new(
        id: PluginId,
        plugin: Arc<RegisteredPlugin>,
        capacity: u32,
        force_active_checks_on_start: bool,
    ) -> Self {
        Self {
            id,
            plugin,
            capacity: capacity.max(1),
            used_capacity: 0,
            tasks: IndexedHeap::new(),
            weights: HashMap::new(),
            refcount: 0,
            collector_task: None,
            force_active_checks_on_start,
        }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn plugin(&self) -> &Arc<RegisteredPlugin> {
        &self.plugin
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used_capacity(&self) -> u32 {
        self.used_capacity
    }

    /// Whether any requester uses the plugin.
    pub fn is_active(&self) -> bool {
        self.refcount > 0
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.tasks.contains(task)
    }

    /// Add a pending task.
    pub fn enqueue(&mut self, task: TaskId, due: DateTime<Utc>, weight: u32) {
        self.weights.insert(task, weight);
        self.tasks.push(task, due);
    }

    /// Move a pending task to a new due time. Returns false if not queued.
    pub fn update(&mut self, task: TaskId, due: DateTime<Utc>) -> bool {
        self.tasks.update(task, due)
    }

    /// Drop a pending task. Returns false if not queued.
    pub fn remove(&mut self, task: TaskId) -> bool {
        self.weights.remove(&task);
        self.tasks.remove(task).is_some()
    }

    /// The earliest pending task and its due time.
    pub fn peek(&self) -> Option<(TaskId, DateTime<Utc>)> {
        self.tasks.peek().map(|(id, due)| (id, *due))
    }

    /// Whether the earliest pending task fits into the free capacity.
    pub fn has_capacity(&self) -> bool {
        match self.peek() {
            Some((task, _)) => self.capacity - self.used_capacity >= self.weight_of(task),
            None => false,
        }
    }

    /// Admit the earliest pending task: pop it and reserve its weight.
    ///
    /// Returns `None` and leaves the queue untouched when the task does not
    /// fit into the free capacity.
    pub fn begin_task(&mut self) -> Option<(TaskId, u32)> {
        if !self.has_capacity() {
            return None;
        }
        let (task, _) = self.tasks.pop()?;
        let weight = self.weights.remove(&task).unwrap_or(1);
        self.used_capacity += weight;
        Some((task, weight))
    }

    /// Release the capacity reserved by a finished task.
    pub fn end_task(&mut self, weight: u32) {
        debug_assert!(weight <= self.used_capacity);
        self.used_capacity = self.used_capacity.saturating_sub(weight);
    }

    /// Pending tasks in heap order, for diagnostics.
    pub fn pending(&self) -> impl Iterator<Item = (TaskId, &DateTime<Utc>)> {
        self.tasks.iter()
    }

    /// Check the heap property of the task queue.
    pub fn is_valid(&self) -> bool {
        self.tasks.is_valid() && self.weights.len() == self.tasks.len()
    }

    fn weight_of(&self, task: TaskId) -> u32 {
        self.weights.get(&task).copied().unwrap_or(1)
    }
}
