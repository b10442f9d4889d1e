//! Async driver of the scheduler.
//!
//! [`SchedulerService::start`] moves a [`Manager`] into a single event loop
//! task. Requesters talk to it through a cloneable [`SchedulerHandle`];
//! executions report back over the same channel. After every event the loop
//! runs a drain pass and spawns the dispatched executions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use plugin_api::{ItemResult, MetricRegistry, ResultWriter, Value, parse_key};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::client::is_builtin;
use super::manager::{Manager, Request, SchedulerStats, UpdateRequest};
use super::task::Completion;
use crate::config::SchedulerConfig;
use crate::{Error, Result};

/// Messages processed by the event loop.
pub enum SchedulerMessage {
    Update(UpdateRequest),
    Finish(Completion),
    Query(oneshot::Sender<SchedulerStats>),
    Stop,
}

/// Spawns the scheduler event loop.
pub struct SchedulerService;

impl SchedulerService {
    /// Start the event loop on the current runtime.
    pub fn start(manager: Manager, config: &SchedulerConfig) -> SchedulerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let registry = manager.registry().clone();
        let default_timeout = manager.default_timeout();
        let tick = Duration::from_millis(config.tick_interval_ms.max(1));

        let handle = tokio::spawn(Self::run_loop(manager, receiver, sender.downgrade(), tick));

        SchedulerHandle {
            sender,
            registry,
            default_timeout,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    async fn run_loop(
        mut manager: Manager,
        mut receiver: mpsc::UnboundedReceiver<SchedulerMessage>,
        completions: mpsc::WeakUnboundedSender<SchedulerMessage>,
        tick: Duration,
    ) -> Manager {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = tick.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                message = receiver.recv() => {
                    match message {
                        Some(SchedulerMessage::Update(update)) => {
                            manager.process_update(update, Utc::now());
                        }
                        Some(SchedulerMessage::Finish(completion)) => {
                            manager.process_finish(completion, Utc::now());
                        }
                        Some(SchedulerMessage::Query(reply)) => {
                            let _ = reply.send(manager.stats());
                            continue;
                        }
                        Some(SchedulerMessage::Stop) | None => break,
                    }
                }

                _ = ticker.tick() => {}
            }

            Self::dispatch(&mut manager, &completions);
        }

        Self::drain_input(&mut manager, &mut receiver);
        info!(stats = ?manager.stats(), "Scheduler stopped");
        manager
    }

    /// Consume messages queued behind the stop sentinel without dispatching.
    fn drain_input(
        manager: &mut Manager,
        receiver: &mut mpsc::UnboundedReceiver<SchedulerMessage>,
    ) {
        receiver.close();
        while let Ok(message) = receiver.try_recv() {
            match message {
                SchedulerMessage::Finish(completion) => {
                    manager.process_finish(completion, Utc::now());
                }
                SchedulerMessage::Query(reply) => {
                    let _ = reply.send(manager.stats());
                }
                SchedulerMessage::Update(update) => {
                    debug!(client_id = update.client_id, "Dropping update received after stop");
                }
                SchedulerMessage::Stop => {}
            }
        }
    }

    fn dispatch(manager: &mut Manager, completions: &mpsc::WeakUnboundedSender<SchedulerMessage>) {
        for execution in manager.process_queue(Utc::now()) {
            let Some(sender) = completions.upgrade() else {
                // every handle is gone, the loop exits on the next receive
                return;
            };
            debug!(
                task = %execution.task_id(),
                plugin = %execution.plugin_name(),
                "Spawning execution"
            );
            tokio::spawn(async move {
                let completion = execution.run().await;
                let _ = sender.send(SchedulerMessage::Finish(completion));
            });
        }
    }
}

/// Delivers the first result written to it through a oneshot channel.
struct OneShotWriter {
    reply: Mutex<Option<oneshot::Sender<ItemResult>>>,
}

impl ResultWriter for OneShotWriter {
    fn write(&self, result: ItemResult) {
        if let Some(reply) = self.reply.lock().take() {
            let _ = reply.send(result);
        }
    }
}

/// Cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::UnboundedSender<SchedulerMessage>,
    registry: Arc<MetricRegistry>,
    default_timeout: Duration,
    shutdown_timeout: Duration,
    task: Arc<Mutex<Option<JoinHandle<Manager>>>>,
}

impl SchedulerHandle {
    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    /// Replace the item set of a requester.
    pub fn update_tasks(
        &self,
        client_id: u64,
        sink: Arc<dyn ResultWriter>,
        requests: Vec<Request>,
        refresh_unsupported: Option<u32>,
    ) -> Result<()> {
        self.send_update(UpdateRequest {
            client_id,
            sink,
            requests,
            refresh_unsupported,
        })
    }

    pub fn send_update(&self, update: UpdateRequest) -> Result<()> {
        self.sender
            .send(SchedulerMessage::Update(update))
            .map_err(|_| Error::ChannelClosed)
    }

    /// Run a single check on behalf of a built-in requester and wait for its
    /// result.
    ///
    /// Fails with [`Error::Timeout`] when no result arrives within `timeout`
    /// (the agent default when unset).
    pub async fn perform_task(
        &self,
        key: &str,
        timeout: Option<Duration>,
        client_id: u64,
    ) -> Result<Option<Value>> {
        if !is_builtin(client_id) {
            return Err(Error::validation(format!(
                "requester {} cannot perform single checks",
                client_id
            )));
        }
        let (name, _) = parse_key(key).map_err(|e| Error::Check(e.to_string()))?;
        let plugin = self
            .registry
            .plugin_for(&name)
            .ok_or_else(|| Error::Check(format!("Unknown metric {}", name)))?;
        if !plugin.capabilities().exporter {
            return Err(Error::Check("Unsupported item key.".to_string()));
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let (reply, result) = oneshot::channel();
        let writer = Arc::new(OneShotWriter {
            reply: Mutex::new(Some(reply)),
        });
        let request = Request {
            timeout: Some(timeout),
            ..Request::new(0, key, "")
        };
        self.send_update(UpdateRequest::new(client_id, writer, vec![request]))?;

        let result = match tokio::time::timeout(timeout, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(Error::ChannelClosed),
            Err(_) => {
                warn!(key, client_id, "Single check timed out");
                return Err(Error::Timeout);
            }
        };
        match result.error {
            Some(error) => Err(Error::Check(error)),
            None => Ok(result.value),
        }
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (reply, stats) = oneshot::channel();
        self.sender
            .send(SchedulerMessage::Query(reply))
            .map_err(|_| Error::ChannelClosed)?;
        stats.await.map_err(|_| Error::ChannelClosed)
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the event loop and every runner plugin still in use.
    ///
    /// Messages already queued when the loop sees the stop request are
    /// drained: completions release capacity, stats queries are answered and
    /// updates are dropped. Pending tasks are abandoned and in-flight
    /// executions are not awaited.
    pub async fn stop(&self) -> Result<()> {
        let Some(task) = self.task.lock().take() else {
            return Ok(());
        };
        let _ = self.sender.send(SchedulerMessage::Stop);

        let shutdown = async {
            let manager = task
                .await
                .map_err(|e| Error::Other(format!("Scheduler task failed: {}", e)))?;
            manager.stop_runners().await;
            Ok::<_, Error>(())
        };
        match tokio::time::timeout(self.shutdown_timeout, shutdown).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Scheduler did not stop in time"
                );
                Err(Error::Other("Scheduler did not stop in time".to_string()))
            }
        }
    }
}
