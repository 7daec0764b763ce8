//! History: the append-only, replayable event log for one orchestration instance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::FailureDetails;
use crate::payload::Payload;
use crate::task_name::TaskName;

/// One entry in an orchestration instance's history
///
/// `HistoryEvent` is the unit the replay engine folds over to reconstruct
/// durable-future state (spec.md §3, §4.4.2). Every variant that the engine
/// itself appends carries a strictly-increasing `event_id`; variants that
/// only describe engine-level lifecycle transitions (start/complete/
/// terminate/suspend/resume/continue-as-new) do not need one since nothing
/// ever resolves against them by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum HistoryEvent {
    /// The first event in every execution's history
    ExecutionStarted {
        name: TaskName,
        instance_id: String,
        input: Payload,
        parent_instance_id: Option<String>,
        scheduled_start_time: Option<DateTime<Utc>>,
    },

    /// The orchestration reached a terminal successful or failed state
    ExecutionCompleted {
        status: OrchestrationStatus,
        result: Payload,
        failure: Option<FailureDetails>,
    },

    /// The orchestration was terminated from outside
    ExecutionTerminated { reason: Payload },

    /// The orchestration was suspended; new external events still buffer but
    /// the orchestrator does not run
    ExecutionSuspended { reason: Option<String> },

    /// A previously suspended orchestration was resumed
    ExecutionResumed { reason: Option<String> },

    /// The execution is restarting as a new execution with fresh history
    OrchestratorStarted,

    /// Emitted once per `ContinueAsNew` action; terminates the current
    /// execution and seeds the next one's `ExecutionStarted`
    ContinueAsNew {
        input: Payload,
        carryover_events: Vec<HistoryEvent>,
    },

    /// An activity was scheduled
    TaskScheduled {
        event_id: u64,
        name: TaskName,
        input: Payload,
    },

    /// A scheduled activity completed successfully
    TaskCompleted { event_id: u64, result: Payload },

    /// A scheduled activity failed (after retries were exhausted, if any)
    TaskFailed {
        event_id: u64,
        failure: FailureDetails,
    },

    /// A sub-orchestration was scheduled
    SubOrchestrationInstanceCreated {
        event_id: u64,
        name: TaskName,
        instance_id: String,
        input: Payload,
    },

    /// A scheduled sub-orchestration completed successfully
    SubOrchestrationInstanceCompleted { event_id: u64, result: Payload },

    /// A scheduled sub-orchestration failed
    SubOrchestrationInstanceFailed {
        event_id: u64,
        failure: FailureDetails,
    },

    /// A durable timer was created
    TimerCreated { event_id: u64, fire_at: DateTime<Utc> },

    /// A durable timer fired
    TimerFired { event_id: u64, fire_at: DateTime<Utc> },

    /// An external event arrived for this instance
    EventRaised { name: String, input: Payload },

    /// This instance sent an external event to another (or itself)
    EventSent {
        target_instance_id: String,
        name: String,
        input: Payload,
    },

    /// A generic, engine-opaque event, reserved for caller-defined extensions
    GenericEvent { data: Payload },
}

impl HistoryEvent {
    /// The `event_id` this history event resolves, if any
    ///
    /// Used by the replay map (spec.md §4.4.2): completions/firings are
    /// matched against the schedule that allocated the same id.
    pub fn event_id(&self) -> Option<u64> {
        match self {
            HistoryEvent::TaskScheduled { event_id, .. }
            | HistoryEvent::TaskCompleted { event_id, .. }
            | HistoryEvent::TaskFailed { event_id, .. }
            | HistoryEvent::SubOrchestrationInstanceCreated { event_id, .. }
            | HistoryEvent::SubOrchestrationInstanceCompleted { event_id, .. }
            | HistoryEvent::SubOrchestrationInstanceFailed { event_id, .. }
            | HistoryEvent::TimerCreated { event_id, .. }
            | HistoryEvent::TimerFired { event_id, .. } => Some(*event_id),
            _ => None,
        }
    }

    /// Is this the kind of event that delivers a result for a prior schedule
    /// (a completion, failure, or timer firing)?
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            HistoryEvent::TaskCompleted { .. }
                | HistoryEvent::TaskFailed { .. }
                | HistoryEvent::SubOrchestrationInstanceCompleted { .. }
                | HistoryEvent::SubOrchestrationInstanceFailed { .. }
                | HistoryEvent::TimerFired { .. }
        )
    }
}

/// Terminal status of one orchestration execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Completed,
    Failed,
}

/// The full replay-relevant state of one instance: committed history plus the
/// new events a turn is being asked to fold in
///
/// Mirrors the turn input contract of spec.md §4.2: `historyBefore` is
/// authoritative and never re-derived; `newEvents` is what this turn
/// processes.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationRuntimeState {
    pub instance_id: String,
    pub history: Vec<HistoryEvent>,
}

impl OrchestrationRuntimeState {
    pub fn new(instance_id: impl Into<String>, history: Vec<HistoryEvent>) -> Self {
        Self {
            instance_id: instance_id.into(),
            history,
        }
    }

    /// Has this instance already reached a terminal state?
    pub fn is_completed(&self) -> bool {
        self.history
            .iter()
            .any(|e| matches!(e, HistoryEvent::ExecutionCompleted { .. }))
    }

    /// The next `event_id` to allocate: one past the maximum seen so far
    pub fn next_event_id(&self) -> u64 {
        self.history
            .iter()
            .filter_map(HistoryEvent::event_id)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }
}
