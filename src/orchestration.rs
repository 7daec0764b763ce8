//! The orchestration trait: user-defined workflow code expressed as a single
//! resumable async function

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::OrchestrationContext;
use crate::failure::FailureDetails;

/// An orchestration failed outright (as opposed to one of its scheduled
/// activities failing, which the orchestration can choose to catch and
/// recover from)
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationFailure(pub FailureDetails);

impl OrchestrationFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self(FailureDetails::new(error_type, message))
    }
}

impl From<FailureDetails> for OrchestrationFailure {
    fn from(failure: FailureDetails) -> Self {
        Self(failure)
    }
}

impl std::fmt::Display for OrchestrationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.error_message)
    }
}

impl std::error::Error for OrchestrationFailure {}

/// A durable orchestration: code whose control flow is replayed, turn by
/// turn, against its own history
///
/// Unlike [`crate::activity::Activity`], `run` is not retried on failure by
/// the engine — an orchestration failure is terminal for the execution
/// (spec.md §4.4.2). Recoverable failures belong inside `run`, catching a
/// failed activity/sub-orchestration future and deciding what to do next.
///
/// `?Send`: the context's durable futures close over `Rc`, so orchestration
/// futures are not `Send`. This is intentional — a turn runs to completion
/// on one thread before the engine ever looks at it again.
#[async_trait(?Send)]
pub trait Orchestration: Send + Sync + 'static {
    /// Unique type identifier, looked up in the registry
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned;
    type Output: Serialize + DeserializeOwned;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        input: Self::Input,
    ) -> Result<Self::Output, OrchestrationFailure>;
}
