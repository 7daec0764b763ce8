//! The worker loop: pulls [`crate::dispatch::WorkItem`]s and drives them
//! through the [`crate::engine::ReplayEngine`] or
//! [`crate::activity::ActivityExecutor`]
//!
//! This module provides:
//! - [`WorkerPool`] - concurrent work execution under a backpressure gate
//! - [`BackpressureConfig`] - load-aware work acceptance configuration
//! - [`PollerConfig`] / [`WorkPoller`] - work polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                              │
//! │  ┌─────────────┐                      ┌─────────────────┐   │
//! │  │ WorkPoller  │                      │ BackpressureState│   │
//! │  │  (polling)  │ ──── WorkItem ──────▶ │ (watermarks)     │   │
//! │  └──────┬──────┘                      └─────────────────┘   │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │      Semaphore-limited dispatch                     │    │
//! │  │  OrchestrationTurn -> ReplayEngine                   │    │
//! │  │  ActivityInvocation -> ActivityExecutor              │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use durable_task_core::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let pool = Arc::new(WorkerPool::new(dispatcher, sink, engine, activity_executor, WorkerPoolConfig::new()));
//! pool.start()?;
//! pool.shutdown().await?;
//! ```

mod backpressure;
mod poller;
mod pool;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use poller::{AdaptivePoller, PollerConfig, WorkPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
