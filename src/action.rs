//! Actions: the decisions a turn emits for the backend to journal and route

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::FailureDetails;
use crate::payload::Payload;
use crate::reliability::RetryPolicy;
use crate::task_name::TaskName;

/// A decision produced by one turn of the replay engine
///
/// Ordering within a single turn's `actions` list is the total order the
/// engine imposes on effects (spec.md §5); `eventId` values on the
/// scheduling variants are unique and strictly increasing within that list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Schedule an activity for execution
    ScheduleTask {
        event_id: u64,
        task_name: TaskName,
        input: Payload,
        retry_policy: Option<RetryPolicy>,
    },

    /// Schedule a sub-orchestration
    ScheduleSubOrchestration {
        event_id: u64,
        task_name: TaskName,
        instance_id: String,
        input: Payload,
        retry_policy: Option<RetryPolicy>,
    },

    /// Create a durable timer that fires at `fire_at`
    CreateTimer { event_id: u64, fire_at: DateTime<Utc> },

    /// Send an external event to another (or this) instance
    SendEvent {
        target_instance_id: String,
        name: String,
        payload: Payload,
    },

    /// Complete the orchestration successfully
    Complete { output: Payload },

    /// Fail the orchestration
    Fail { failure: FailureDetails },

    /// Continue this instance as a new execution
    ContinueAsNew {
        input: Payload,
        preserve_unconsumed_events: bool,
    },

    /// Set the orchestration's custom status payload
    SetCustomStatus { custom_status: Payload },
}

impl Action {
    /// The `eventId` of a scheduling action, if it allocates one
    ///
    /// Used by the determinism check (spec.md §4.4.2 point 5) and by tests
    /// asserting eventId monotonicity (spec.md §8).
    pub fn event_id(&self) -> Option<u64> {
        match self {
            Action::ScheduleTask { event_id, .. }
            | Action::ScheduleSubOrchestration { event_id, .. }
            | Action::CreateTimer { event_id, .. } => Some(*event_id),
            _ => None,
        }
    }

    pub fn timer(event_id: u64, fire_at: DateTime<Utc>) -> Self {
        Action::CreateTimer { event_id, fire_at }
    }

    pub fn complete(output: Payload) -> Self {
        Action::Complete { output }
    }

    pub fn fail(failure: FailureDetails) -> Self {
        Action::Fail { failure }
    }
}

/// Clamp a requested timer duration into a chain of `CreateTimer` actions,
/// each respecting `maximum_timer_interval` (spec.md §4.4.3 and the Open
/// Question on chained clamping, resolved in DESIGN.md)
///
/// Returns the list of `(offset_from_now, is_final)` pairs the caller should
/// turn into chained timers, firing one after another; only the final one is
/// the orchestration-visible timer.
pub fn clamp_timer_chain(total: Duration, maximum_timer_interval: Duration) -> Vec<Duration> {
    if maximum_timer_interval.is_zero() {
        return vec![total];
    }

    let mut remaining = total;
    let mut chain = Vec::new();

    while remaining > maximum_timer_interval {
        chain.push(maximum_timer_interval);
        remaining -= maximum_timer_interval;
    }
    chain.push(remaining);
    chain
}
