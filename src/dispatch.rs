//! Dispatch: the two narrow interfaces the worker loop needs from whatever
//! backend journals history and queues work
//!
//! The teacher's `WorkflowEventStore` (see
//! `examples/everruns-everruns/crates/durable/src/persistence/store.rs`)
//! conflates workflow CRUD, task queueing, signals, worker registration, a
//! DLQ, and circuit-breaker bookkeeping into one trait tightly coupled to
//! Postgres. Persistence is out of scope here; the core only needs to pull
//! work and push results, so it depends on these two small abstract traits
//! instead and leaves the backend unspecified.

use async_trait::async_trait;
use thiserror::Error;

use crate::action::Action;
use crate::history::HistoryEvent;
use crate::payload::Payload;
use crate::task_name::TaskName;

/// One unit of pullable work: either an orchestration turn to run, or an
/// activity invocation to execute
#[derive(Debug, Clone)]
pub enum WorkItem {
    OrchestrationTurn {
        instance_id: String,
        task_name: TaskName,
        history_before: Vec<HistoryEvent>,
        new_events: Vec<HistoryEvent>,
    },
    ActivityInvocation {
        instance_id: String,
        task_event_id: u64,
        task_name: TaskName,
        input: Payload,
        attempt: u32,
        max_attempts: u32,
    },
}

impl WorkItem {
    pub fn instance_id(&self) -> &str {
        match self {
            WorkItem::OrchestrationTurn { instance_id, .. } => instance_id,
            WorkItem::ActivityInvocation { instance_id, .. } => instance_id,
        }
    }

    pub fn task_name(&self) -> &TaskName {
        match self {
            WorkItem::OrchestrationTurn { task_name, .. } => task_name,
            WorkItem::ActivityInvocation { task_name, .. } => task_name,
        }
    }
}

/// The result the worker loop reports back after processing a [`WorkItem`]
#[derive(Debug, Clone)]
pub enum WorkResult {
    /// An orchestration turn ran; here are the actions it produced
    TurnActions {
        instance_id: String,
        actions: Vec<Action>,
    },
    /// An activity ran to completion (success or failure)
    ActivityOutcome {
        instance_id: String,
        task_event_id: u64,
        outcome: crate::activity::ActivityOutcome,
    },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("work item not found or already claimed: {0}")]
    NotFound(String),
}

/// Pulls pending work for this worker to process
///
/// Implementations decide how work is queued, leased, and deduplicated
/// across workers; the core only ever asks for the next batch and reports
/// back through [`ActionSink`].
#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    /// Fetch up to `max_items` units of work, or fewer if none are ready
    async fn poll(&self, max_items: usize) -> Result<Vec<WorkItem>, DispatchError>;
}

/// Records the outcome of processed work back to the backend
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// Journal the actions an orchestration turn produced
    async fn record_turn_actions(
        &self,
        instance_id: &str,
        actions: Vec<Action>,
    ) -> Result<(), DispatchError>;

    /// Journal an activity's outcome
    async fn record_activity_outcome(
        &self,
        instance_id: &str,
        task_event_id: u64,
        outcome: crate::activity::ActivityOutcome,
    ) -> Result<(), DispatchError>;
}
