//! Work polling with adaptive backoff

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::dispatch::{DispatchError, WorkDispatcher, WorkItem};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when work is available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no work is found
    pub backoff_multiplier: f64,

    /// Maximum work items to pull per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Pulls work with exponential backoff, resetting to the minimum interval
/// whenever work is found
pub struct WorkPoller {
    dispatcher: Arc<dyn WorkDispatcher>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkPoller {
    pub fn new(
        dispatcher: Arc<dyn WorkDispatcher>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            dispatcher,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    #[instrument(skip(self))]
    pub async fn poll(&mut self, max_items: usize) -> Result<Vec<WorkItem>, DispatchError> {
        if *self.shutdown_rx.borrow() {
            return Ok(vec![]);
        }

        let batch_size = max_items.min(self.config.batch_size);
        let items = self.dispatcher.poll(batch_size).await?;

        if items.is_empty() {
            self.increase_backoff();
            trace!(interval_ms = self.current_interval.as_millis(), "no work found, backing off");
        } else {
            self.reset_backoff();
            debug!(count = items.len(), "pulled work items");
        }

        Ok(items)
    }

    /// Wait out the current backoff interval, or return early on shutdown
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval =
            Duration::from_secs_f64(self.current_interval.as_secs_f64() * self.config.backoff_multiplier);
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

/// Adaptive poll interval calculator, driven by a rolling window of recent
/// poll yields
pub struct AdaptivePoller {
    config: PollerConfig,
    recent_item_counts: Vec<usize>,
    window_size: usize,
}

impl AdaptivePoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            recent_item_counts: Vec::with_capacity(10),
            window_size: 10,
        }
    }

    pub fn record_poll(&mut self, items_found: usize) {
        if self.recent_item_counts.len() >= self.window_size {
            self.recent_item_counts.remove(0);
        }
        self.recent_item_counts.push(items_found);
    }

    pub fn optimal_interval(&self) -> Duration {
        if self.recent_item_counts.is_empty() {
            return self.config.min_interval;
        }

        let avg: f64 =
            self.recent_item_counts.iter().sum::<usize>() as f64 / self.recent_item_counts.len() as f64;

        if avg > 0.8 * self.config.batch_size as f64 {
            self.config.min_interval
        } else if avg < 0.2 * self.config.batch_size as f64 {
            self.config.max_interval.min(self.config.min_interval * 4)
        } else {
            let ratio = 1.0 - (avg / self.config.batch_size as f64);
            let range = self.config.max_interval.as_secs_f64() - self.config.min_interval.as_secs_f64();
            Duration::from_secs_f64(self.config.min_interval.as_secs_f64() + ratio * range * 0.5)
        }
    }

    pub fn average_items_per_poll(&self) -> f64 {
        if self.recent_item_counts.is_empty() {
            0.0
        } else {
            self.recent_item_counts.iter().sum::<usize>() as f64 / self.recent_item_counts.len() as f64
        }
    }
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
