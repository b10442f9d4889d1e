//! Requester bookkeeping.
//!
//! Every requester (a server session, the passive check listener, the local
//! item list) is a client. A client owns its items and tracks which plugins
//! it uses; the manager derives plugin activation from this usage.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use plugin_api::{ResultWriter, WatchItem};

use super::task::{PluginId, TaskId};

/// Requester id of the local caller.
pub const LOCAL_CLIENT_ID: u64 = 0;

/// Requester id of the passive check listener.
pub const PASSIVE_CLIENT_ID: u64 = 1;

/// Ids up to this value are reserved for built-in requesters, whose checks
/// run once instead of being scheduled periodically.
pub const MAX_BUILTIN_CLIENT_ID: u64 = 100;

/// How long the passive requester keeps a plugin in use after its last
/// request, in seconds.
pub const PASSIVE_USAGE_TTL_SECS: i64 = 24 * 60 * 60;

/// Whether a requester id belongs to a built-in requester.
pub fn is_builtin(client_id: u64) -> bool {
    client_id <= MAX_BUILTIN_CLIENT_ID
}

/// Scheduler-side record of a requested item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    /// Task checking the item.
    pub task: TaskId,
    /// Generation of the last update batch that included the item.
    pub generation: u64,
}

/// A requester's use of one plugin.
#[derive(Debug, Clone, Default)]
pub struct PluginUsage {
    /// Generation of the last update batch that used the plugin.
    pub generation: Option<u64>,
    /// Time of the last request using the plugin.
    pub last_used: Option<DateTime<Utc>>,
    /// Watched items collected from the current batch.
    pub watch_items: Vec<WatchItem>,
    /// Watcher task not yet executed, reused by the next batch.
    pub watch_task: Option<TaskId>,
}

/// One requester.
pub struct Client {
    pub id: u64,
    pub sink: Arc<dyn ResultWriter>,
    pub items: HashMap<u64, Item>,
    pub plugins: HashMap<PluginId, PluginUsage>,
    /// Retry interval for failed checks, in seconds.
    pub refresh_unsupported: u32,
    /// Set once the first update batch has been processed.
    pub initialized: bool,
    /// Counter of processed update batches.
    pub generation: u64,
}

impl Client {
    pub fn new(id: u64, sink: Arc<dyn ResultWriter>, refresh_unsupported: u32) -> Self {
        Self {
            id,
            sink,
            items: HashMap::new(),
            plugins: HashMap::new(),
            refresh_unsupported,
            initialized: false,
            generation: 0,
        }
    }

    pub fn is_builtin(&self) -> bool {
        is_builtin(self.id)
    }

    /// Start a new update batch.
    pub fn begin_batch(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Whether the plugin was used by the current batch.
    pub fn uses_in_batch(&self, usage: &PluginUsage) -> bool {
        usage.generation == Some(self.generation)
    }

    /// Plugins whose usage has expired.
    ///
    /// Active requesters release plugins missing from the current batch. The
    /// passive requester keeps them for a day after the last request.
    pub fn expired_plugins(&self, now: DateTime<Utc>) -> Vec<PluginId> {
        let mut expired: Vec<PluginId> = self
            .plugins
            .iter()
            .filter(|(_, usage)| !self.uses_in_batch(usage))
            .filter(|(_, usage)| {
                self.id != PASSIVE_CLIENT_ID
                    || usage.last_used.is_none_or(|used| {
                        used < now - TimeDelta::seconds(PASSIVE_USAGE_TTL_SECS)
                    })
            })
            .map(|(&id, _)| id)
            .collect();
        expired.sort_unstable();
        expired
    }

    /// Items that were not part of the current batch.
    pub fn stale_items(&self) -> Vec<(u64, TaskId)> {
        let mut stale: Vec<(u64, TaskId)> = self
            .items
            .iter()
            .filter(|(_, item)| item.generation != self.generation)
            .map(|(&item_id, item)| (item_id, item.task))
            .collect();
        stale.sort_unstable();
        stale
    }

    /// A client without items and plugin usage can be forgotten.
    pub fn is_idle(&self) -> bool {
        self.items.is_empty() && self.plugins.is_empty()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("items", &self.items.len())
            .field("plugins", &self.plugins.len())
            .field("refresh_unsupported", &self.refresh_unsupported)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_api::ItemResult;
    use tokio::sync::mpsc;

    fn client(id: u64) -> Client {
        let (tx, _rx) = mpsc::unbounded_channel::<ItemResult>();
        Client::new(id, Arc::new(tx), 600)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_builtin_ids() {
        assert!(is_builtin(LOCAL_CLIENT_ID));
        assert!(is_builtin(PASSIVE_CLIENT_ID));
        assert!(is_builtin(MAX_BUILTIN_CLIENT_ID));
        assert!(!is_builtin(MAX_BUILTIN_CLIENT_ID + 1));
    }

    fn used(generation: u64, secs: i64) -> PluginUsage {
        PluginUsage {
            generation: Some(generation),
            last_used: Some(at(secs)),
            ..Default::default()
        }
    }

    #[test]
    fn test_active_client_releases_unused_plugins_immediately() {
        let mut c = client(200);
        c.begin_batch();
        let current = c.begin_batch();
        c.plugins.insert(0, used(current - 1, 0));
        c.plugins.insert(1, used(current, 0));
        assert_eq!(c.expired_plugins(at(0)), vec![0]);
        assert!(!c.is_builtin());
    }

    #[test]
    fn test_passive_client_keeps_plugins_for_a_day() {
        let mut c = client(PASSIVE_CLIENT_ID);
        let first = c.begin_batch();
        c.plugins.insert(0, used(first, 0));
        c.begin_batch();
        assert!(c.expired_plugins(at(3600)).is_empty());
        assert!(c.expired_plugins(at(86_400)).is_empty());
        assert_eq!(c.expired_plugins(at(86_401)), vec![0]);
        // a plugin used by the current batch never expires
        let current = c.begin_batch();
        c.plugins.insert(1, used(current, -100_000));
        assert_eq!(c.expired_plugins(at(86_401)), vec![0]);
        assert!(c.is_builtin());
    }

    #[test]
    fn test_stale_items() {
        let mut c = client(200);
        let previous = c.begin_batch();
        let current = c.begin_batch();
        c.items.insert(1, Item { task: TaskId(10), generation: current });
        c.items.insert(2, Item { task: TaskId(11), generation: previous });
        assert_eq!(c.stale_items(), vec![(2, TaskId(11))]);
        assert!(!c.is_idle());
    }
}
