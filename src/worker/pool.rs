//! Worker pool: pulls work, routes it to the replay engine or the activity
//! executor, and reports outcomes back through the [`ActionSink`]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityExecutor;
use crate::cancellation::CancellationToken;
use crate::dispatch::{ActionSink, DispatchError, WorkDispatcher, WorkItem};
use crate::engine::ReplayEngine;

use super::backpressure::{BackpressureConfig, BackpressureState};
use super::poller::{PollerConfig, WorkPoller};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub worker_group: String,
    pub max_concurrency: usize,
    pub backpressure: BackpressureConfig,
    pub poller: PollerConfig,
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            worker_group: "default".to_string(),
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_worker_group(mut self, group: impl Into<String>) -> Self {
        self.worker_group = group.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Pulls [`WorkItem`]s and routes each to the [`ReplayEngine`] or the
/// [`ActivityExecutor`] under a concurrency limit and backpressure gate
pub struct WorkerPool {
    dispatcher: Arc<dyn WorkDispatcher>,
    sink: Arc<dyn ActionSink>,
    engine: Arc<ReplayEngine>,
    activity_executor: Arc<ActivityExecutor>,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: std::sync::RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    cancellation: CancellationToken,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        dispatcher: Arc<dyn WorkDispatcher>,
        sink: Arc<dyn ActionSink>,
        engine: Arc<ReplayEngine>,
        activity_executor: Arc<ActivityExecutor>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(config.backpressure.clone(), config.max_concurrency));

        Self {
            dispatcher,
            sink,
            engine,
            activity_executor,
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            backpressure,
            config,
            shutdown_tx,
            shutdown_rx,
            status: std::sync::RwLock::new(WorkerPoolStatus::Stopped),
            cancellation: CancellationToken::new(),
            poll_handle: std::sync::Mutex::new(None),
        }
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        *self.status.write().unwrap() = WorkerPoolStatus::Running;

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move { pool.run_poll_loop().await });
        *self.poll_handle.lock().unwrap() = Some(handle);

        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        *self.status.write().unwrap() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);
        self.cancellation.cancel();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrency {
                debug!("all in-flight work completed");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.config.max_concurrency - available, "shutdown timeout reached");
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write().unwrap() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read().unwrap()
    }

    pub fn current_load(&self) -> usize {
        self.backpressure.current_load()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn is_accepting(&self) -> bool {
        self.backpressure.is_accepting() && self.status() == WorkerPoolStatus::Running
    }

    async fn run_poll_loop(self: Arc<Self>) {
        let mut poller = WorkPoller::new(self.dispatcher.clone(), self.config.poller.clone(), self.shutdown_rx.clone());

        loop {
            if poller.is_shutdown() {
                break;
            }

            if !self.backpressure.should_accept() {
                if poller.wait().await {
                    break;
                }
                continue;
            }

            let available = self.backpressure.available_slots();
            let items = match poller.poll(available).await {
                Ok(items) => items,
                Err(err) => {
                    error!(%err, "poll failed");
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }
            };

            if items.is_empty() {
                if poller.wait().await {
                    break;
                }
                continue;
            }

            for item in items {
                self.spawn_item(item);
            }
        }
    }

    fn spawn_item(self: &Arc<Self>, item: WorkItem) {
        let pool = Arc::clone(self);
        let permit = match pool.active_tasks.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return,
        };

        pool.backpressure.task_started();
        tokio::spawn(async move {
            let _permit = permit;
            pool.process_item(item).await;
            pool.backpressure.task_completed();
        });
    }

    #[instrument(skip(self, item), fields(instance_id = %item.instance_id(), task_name = %item.task_name()))]
    async fn process_item(&self, item: WorkItem) {
        match item {
            WorkItem::OrchestrationTurn {
                instance_id,
                task_name,
                history_before,
                new_events,
            } => {
                let input = starting_input(&history_before, &new_events);
                let output = self
                    .engine
                    .run_turn(&instance_id, &task_name, &history_before, &new_events, input)
                    .await;

                if let Err(err) = self.sink.record_turn_actions(&instance_id, output.actions).await {
                    error!(%err, %instance_id, "failed to record turn actions");
                }
            }
            WorkItem::ActivityInvocation {
                instance_id,
                task_event_id,
                task_name,
                input,
                attempt,
                max_attempts,
            } => {
                let work = crate::activity::ActivityWorkItem {
                    instance_id: instance_id.clone(),
                    task_event_id,
                    task_name,
                    input,
                    attempt,
                    max_attempts,
                };
                let outcome = self.activity_executor.run(work, self.cancellation.clone()).await;
                if let Err(err) = self
                    .sink
                    .record_activity_outcome(&instance_id, task_event_id, outcome)
                    .await
                {
                    error!(%err, %instance_id, "failed to record activity outcome");
                }
            }
        }
    }
}

/// The input payload an orchestration turn should be driven with: whatever
/// `ExecutionStarted` carried, found in whichever of the two event lists
/// holds it (it is only ever present once, at the start of an execution)
fn starting_input(
    history_before: &[crate::history::HistoryEvent],
    new_events: &[crate::history::HistoryEvent],
) -> crate::payload::Payload {
    history_before
        .iter()
        .chain(new_events.iter())
        .find_map(|e| match e {
            crate::history::HistoryEvent::ExecutionStarted { input, .. } => Some(input.clone()),
            _ => None,
        })
        .unwrap_or_else(crate::payload::Payload::null)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
