//! Activity execution context

use uuid::Uuid;

use crate::cancellation::CancellationToken;

/// Context provided to activities during execution
///
/// The context carries attempt bookkeeping and a cooperative cancellation
/// token; it does not carry a heartbeat channel (heartbeating is an
/// operator/worker-facing liveness concern, out of scope for the execution
/// core — see the Non-goals in the module's owning spec document).
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed for this invocation, if a retry policy applies
    pub max_attempts: u32,

    /// Orchestration instance ID that owns this activity
    pub instance_id: String,

    /// The scheduling `event_id` this activity execution resolves
    pub task_event_id: u64,

    cancellation: CancellationToken,
}

impl ActivityContext {
    pub fn new(instance_id: impl Into<String>, task_event_id: u64, attempt: u32, max_attempts: u32) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            instance_id: instance_id.into(),
            task_event_id,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Borrow the cancellation token for use in `tokio::select!`
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Is this the final attempt, such that a failure here will not be retried?
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
