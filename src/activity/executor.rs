//! Activity executor: runs one scheduled activity invocation to completion

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{instrument, warn};

use crate::cancellation::CancellationToken;
use crate::codec::Codec;
use crate::failure::FailureDetails;
use crate::payload::Payload;
use crate::task_name::TaskName;

use super::ActivityContext;

/// Outcome of one activity execution attempt
#[derive(Debug, Clone)]
pub enum ActivityOutcome {
    Completed(Payload),
    Failed(FailureDetails),
}

/// A type-erased activity invocation, produced by the registry
///
/// Mirrors [`crate::registry::AnyOrchestration`]'s role for activities: the
/// executor never needs the concrete `Activity::Input`/`Output` types,
/// only this trait object.
#[async_trait]
pub trait AnyActivity: Send + Sync {
    fn task_name(&self) -> &TaskName;

    async fn invoke(&self, ctx: &ActivityContext, input: &Payload, codec: &dyn Codec) -> ActivityOutcome;
}

pub(crate) struct ActivityWrapper<A> {
    pub(crate) task_name: TaskName,
    pub(crate) activity: Arc<A>,
}

#[async_trait]
impl<A> AnyActivity for ActivityWrapper<A>
where
    A: super::Activity,
{
    fn task_name(&self) -> &TaskName {
        &self.task_name
    }

    async fn invoke(&self, ctx: &ActivityContext, input: &Payload, codec: &dyn Codec) -> ActivityOutcome {
        let typed_input: A::Input = match codec.decode(input) {
            Ok(value) => value,
            Err(err) => {
                return ActivityOutcome::Failed(FailureDetails::new(
                    "InputDeserializationError",
                    err.to_string(),
                ))
            }
        };

        match self.activity.execute(ctx, typed_input).await {
            Ok(output) => match codec.encode(&output) {
                Ok(payload) => ActivityOutcome::Completed(payload),
                Err(err) => ActivityOutcome::Failed(FailureDetails::new(
                    "OutputSerializationError",
                    err.to_string(),
                )),
            },
            Err(err) => ActivityOutcome::Failed(err.into_failure_details()),
        }
    }
}

/// A unit of work dispatched to the activity executor: one scheduled task
/// plus the bookkeeping the executor needs to run (and, on failure, retry)
/// it.
#[derive(Debug, Clone)]
pub struct ActivityWorkItem {
    pub instance_id: String,
    pub task_event_id: u64,
    pub task_name: TaskName,
    pub input: Payload,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Runs scheduled activities against a [`crate::registry::Registry`]
///
/// `C3` in the execution core: stateless with respect to any one
/// orchestration instance, trivially shardable across worker processes.
pub struct ActivityExecutor {
    registry: Arc<crate::registry::Registry>,
    codec: crate::codec::DynCodec,
}

impl ActivityExecutor {
    pub fn new(registry: Arc<crate::registry::Registry>) -> Self {
        Self {
            registry,
            codec: crate::codec::DynCodec::default(),
        }
    }

    pub fn with_codec(mut self, codec: crate::codec::DynCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Run one activity invocation to completion, honoring `cancellation`
    #[instrument(skip(self, cancellation, work), fields(task_name = %work.task_name, instance_id = %work.instance_id))]
    pub async fn run(&self, work: ActivityWorkItem, cancellation: CancellationToken) -> ActivityOutcome {
        let activity = match self.registry.lookup_activity(&work.task_name) {
            Some(activity) => activity,
            None => {
                warn!(task_name = %work.task_name, "no activity registered for task name");
                return ActivityOutcome::Failed(FailureDetails::unknown_task(&work.task_name));
            }
        };

        let ctx = ActivityContext::new(
            work.instance_id.clone(),
            work.task_event_id,
            work.attempt,
            work.max_attempts,
        )
        .with_cancellation(cancellation.clone());

        let started = Instant::now();
        let outcome = tokio::select! {
            outcome = activity.invoke(&ctx, &work.input, &*self.codec) => outcome,
            _ = cancellation.cancelled() => {
                ActivityOutcome::Failed(FailureDetails::new("Cancelled", "activity execution was cancelled"))
            }
        };
        tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "activity execution finished");
        outcome
    }
}

/// A catch-all JSON envelope used only by tests and standalone entry points
/// that want to inspect activity output without a concrete output type
pub type RawOutcome = Result<JsonValue, FailureDetails>;
