//! Task scheduling.
//!
//! Requesters submit item batches; the scheduler turns them into tasks on
//! per-plugin queues and dispatches due tasks within each plugin's capacity.
//!
//! - [`heap`]: indexed min-heap shared by both queue levels
//! - [`task`]: task kinds, rescheduling and execution
//! - [`plugin_queue`]: per-plugin queue with capacity admission
//! - [`client`]: requester bookkeeping
//! - [`manager`]: the scheduling state machine
//! - [`service`]: the async event loop and its handle

pub mod client;
pub mod heap;
pub mod manager;
pub mod plugin_queue;
pub mod service;
pub mod task;

pub use client::{LOCAL_CLIENT_ID, MAX_BUILTIN_CLIENT_ID, PASSIVE_CLIENT_ID, is_builtin};
pub use manager::{
    Manager, PluginStats, Request, RequestError, SchedulerStats, UpdateRequest,
};
pub use service::{SchedulerHandle, SchedulerMessage, SchedulerService};
pub use task::{Completion, Execution, TaskId};
