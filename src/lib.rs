//! # Durable Task Core
//!
//! A client-side runtime for long-running, failure-tolerant orchestrations
//! composed of activities, durable timers, external events, and
//! sub-orchestrations, replayed deterministically against a journaled
//! history.
//!
//! ## Features
//!
//! - **Event-sourced orchestrations**: orchestrator code is replayed against
//!   history rather than resumed, so crash recovery is just re-running a
//!   pure function over the same events
//! - **Automatic retries**: configurable retry policies with exponential
//!   backoff and an optional imperative retry handler
//! - **Deterministic time and randomness**: `ctx.current_time()` and
//!   `ctx.new_guid()` never touch the wall clock or a real RNG during replay
//! - **Backend-agnostic worker loop**: pulls work and reports outcomes
//!   through two narrow traits, leaving persistence and transport to the host
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                             │
//! │  (pulls WorkItems, dispatches to the engine or the executor) │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────────┐  ┌─────────────────────────┐
//! │          ReplayEngine          │  │    ActivityExecutor      │
//! │  (C4: drives one orchestration │  │  (C3: runs one activity  │
//! │   turn to its fixed point)     │  │   invocation to ground)  │
//! └───────────────────────────────┘  └─────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Registry                              │
//! │       (C2: task-name -> Orchestration/Activity lookup)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_task_core::prelude::*;
//!
//! struct ProcessOrder;
//!
//! #[async_trait::async_trait(?Send)]
//! impl Orchestration for ProcessOrder {
//!     const TYPE: &'static str = "ProcessOrder";
//!     type Input = OrderInput;
//!     type Output = OrderResult;
//!
//!     async fn run(
//!         &self,
//!         ctx: OrchestrationContext,
//!         input: Self::Input,
//!     ) -> Result<Self::Output, OrchestrationFailure> {
//!         let charged = ctx
//!             .schedule_task::<f64>("ChargeCard", input.payment, None)
//!             .await?;
//!         ctx.create_timer(std::time::Duration::from_secs(3600)).await?;
//!         Ok(OrderResult { charged })
//!     }
//! }
//! ```

pub mod action;
pub mod activity;
pub mod cancellation;
pub mod codec;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod failure;
pub mod history;
pub mod orchestration;
pub mod payload;
pub mod registry;
pub mod reliability;
pub mod standalone;
pub mod task_name;
pub mod worker;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::action::Action;
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityExecutor};
    pub use crate::codec::{Codec, DynCodec, JsonCodec};
    pub use crate::context::OrchestrationContext;
    pub use crate::dispatch::{ActionSink, DispatchError, WorkDispatcher, WorkItem};
    pub use crate::engine::{EngineConfig, ReplayEngine, TerminalOutcome, TurnOutput};
    pub use crate::failure::FailureDetails;
    pub use crate::history::{HistoryEvent, OrchestrationRuntimeState};
    pub use crate::orchestration::{Orchestration, OrchestrationFailure};
    pub use crate::payload::Payload;
    pub use crate::registry::{Registry, RegistryError};
    pub use crate::reliability::RetryPolicy;
    pub use crate::task_name::TaskName;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

// Re-export key types at crate root
pub use action::Action;
pub use activity::{Activity, ActivityContext, ActivityError, ActivityExecutor};
pub use codec::{Codec, DynCodec, JsonCodec};
pub use context::OrchestrationContext;
pub use dispatch::{ActionSink, DispatchError, WorkDispatcher, WorkItem};
pub use engine::{EngineConfig, ReplayEngine, TerminalOutcome, TurnOutput};
pub use failure::FailureDetails;
pub use history::{HistoryEvent, OrchestrationRuntimeState};
pub use orchestration::{Orchestration, OrchestrationFailure};
pub use payload::Payload;
pub use registry::{Registry, RegistryError};
pub use reliability::RetryPolicy;
pub use task_name::TaskName;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
