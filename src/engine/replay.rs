//! The replay engine itself: builds turn-local state from history and
//! drives the orchestration's future to a fixed point

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace, warn};

use crate::action::Action;
use crate::cancellation::CancellationToken;
use crate::codec::DynCodec;
use crate::context::{OrchestrationContext, Resolution, ScheduledSignature};
use crate::failure::FailureDetails;
use crate::history::HistoryEvent;
use crate::orchestration::OrchestrationFailure;
use crate::payload::Payload;
use crate::registry::Registry;
use crate::task_name::TaskName;

/// Configuration for the replay engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Durable timers requested for longer than this are split into a chain
    /// of shorter timers (spec.md §4.4.3); `None` disables clamping
    #[serde(with = "crate::reliability::retry::option_duration_millis", default)]
    pub maximum_timer_interval: Option<Duration>,

    /// Safety cap on poll-to-fixpoint iterations per turn, guarding against
    /// a combinator that never stabilizes
    pub max_poll_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            maximum_timer_interval: None,
            max_poll_iterations: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_maximum_timer_interval(mut self, interval: Duration) -> Self {
        self.maximum_timer_interval = Some(interval);
        self
    }

    pub fn with_max_poll_iterations(mut self, max: usize) -> Self {
        self.max_poll_iterations = max.max(1);
        self
    }
}

/// What a turn decided for the orchestration as a whole, beyond the list of
/// actions it wants journaled
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Completed(Payload),
    Failed(FailureDetails),
}

/// Everything one call into the engine produces
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    pub actions: Vec<Action>,
    pub custom_status: Option<Payload>,
    pub terminal_outcome: Option<TerminalOutcome>,
}

/// Drives one orchestration's history + new events to a fixed point for one
/// turn (`C4` in the execution core)
///
/// Stateless across turns by design: every call rebuilds its
/// [`OrchestrationContext`] from scratch and re-executes the orchestration's
/// `run` from the top, so the engine itself carries nothing between calls —
/// all durability lives in the history the caller passes in.
pub struct ReplayEngine {
    registry: Arc<Registry>,
    codec: DynCodec,
    config: EngineConfig,
    cancellation: CancellationToken,
}

impl ReplayEngine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            codec: DynCodec::default(),
            config: EngineConfig::default(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_codec(mut self, codec: DynCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach this instance's cancellation token
    ///
    /// Defaults to a token that never fires. A turn never observes
    /// cancellation requested *during* that same turn (the token is read
    /// once per durable future, at the start of the turn it's polled in);
    /// the effect is visible starting the turn after `cancel()` is called.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Run one turn
    #[instrument(skip(self, history_before, new_events, input), fields(instance_id = %instance_id, task_name = %task_name))]
    pub async fn run_turn(
        &self,
        instance_id: &str,
        task_name: &TaskName,
        history_before: &[HistoryEvent],
        new_events: &[HistoryEvent],
        input: Payload,
    ) -> TurnOutput {
        let orchestration = match self.registry.lookup_orchestration(task_name) {
            Some(o) => o,
            None => {
                warn!(%task_name, "no orchestration registered for task name");
                return TurnOutput {
                    actions: vec![],
                    custom_status: None,
                    terminal_outcome: Some(TerminalOutcome::Failed(FailureDetails::unknown_task(task_name))),
                };
            }
        };

        let execution_start_time = history_before
            .iter()
            .chain(new_events.iter())
            .find_map(|e| match e {
                HistoryEvent::ExecutionStarted { scheduled_start_time, .. } => {
                    scheduled_start_time.or(Some(Utc::now()))
                }
                _ => None,
            })
            .unwrap_or_else(Utc::now);

        let (resolutions, scheduled, from_new_events) = build_resolutions(history_before, new_events);

        let ctx = OrchestrationContext::new(
            instance_id.to_string(),
            execution_start_time,
            resolutions,
            scheduled,
            from_new_events,
            self.codec.clone(),
            self.config.maximum_timer_interval,
            self.cancellation.clone(),
        );

        for event in history_before.iter().chain(new_events.iter()) {
            if let HistoryEvent::EventRaised { name, input } = event {
                ctx.raise_event(name.clone(), input.clone());
            }
            if let HistoryEvent::TimerFired { fire_at, .. } = event {
                ctx.advance_clock(*fire_at);
            }
        }

        let future = orchestration.run(ctx.clone(), input, self.codec.clone());
        let outcome = TurnDriver::new(future, &ctx, self.config.max_poll_iterations).drive().await;

        let mut actions = ctx.drain_actions();
        let custom_status = ctx.take_custom_status();
        let continue_as_new = ctx.take_continue_as_new();

        let terminal_outcome = if continue_as_new.is_some() {
            // Continue-as-new takes precedence over whatever `run` itself
            // returned: the orchestration asked to restart, so its
            // completion/failure for *this* execution is moot.
            None
        } else {
            match outcome {
                TurnProgress::Ready(Ok(output)) => Some(TerminalOutcome::Completed(output)),
                TurnProgress::Ready(Err(failure)) => Some(TerminalOutcome::Failed(failure.0)),
                TurnProgress::Blocked => None,
            }
        };

        if let Some(continue_as_new_action) = continue_as_new {
            let preserve = matches!(
                &continue_as_new_action,
                Action::ContinueAsNew { preserve_unconsumed_events: true, .. }
            );
            actions.push(continue_as_new_action);

            if preserve {
                for (name, payload) in ctx.drain_unconsumed_external_events() {
                    actions.push(Action::SendEvent {
                        target_instance_id: instance_id.to_string(),
                        name,
                        payload,
                    });
                }
            }
        }

        TurnOutput {
            actions,
            custom_status,
            terminal_outcome,
        }
    }
}

enum TurnProgress {
    Ready(Result<Payload, OrchestrationFailure>),
    Blocked,
}

/// Manually polls an orchestration's future to a fixed point
///
/// A no-op waker is correct here: nothing outside this turn will ever wake
/// this future (there is no external I/O to wait on — every durable future
/// resolves from the pre-built resolution map or never resolves this turn),
/// so there is nothing useful a real waker would do.
struct TurnDriver<'a, F> {
    future: Pin<Box<F>>,
    ctx: &'a OrchestrationContext,
    max_iterations: usize,
}

impl<'a, F> TurnDriver<'a, F>
where
    F: Future<Output = Result<Payload, OrchestrationFailure>>,
{
    fn new(future: F, ctx: &'a OrchestrationContext, max_iterations: usize) -> Self {
        Self {
            future: Box::pin(future),
            ctx,
            max_iterations,
        }
    }

    async fn drive(mut self) -> TurnProgress {
        let waker = futures::task::noop_waker();
        let mut task_cx = TaskContext::from_waker(&waker);

        let mut last_version = self.ctx.version();
        for iteration in 0..self.max_iterations {
            match self.future.as_mut().poll(&mut task_cx) {
                Poll::Ready(output) => return TurnProgress::Ready(output),
                Poll::Pending => {
                    let version = self.ctx.version();
                    if version == last_version {
                        trace!(iteration, "turn blocked: no progress since last poll");
                        return TurnProgress::Blocked;
                    }
                    last_version = version;
                }
            }
        }
        warn!(max_iterations = self.max_iterations, "turn driver hit its iteration cap without stabilizing");
        TurnProgress::Blocked
    }
}

/// Fold `historyBefore` and `newEvents` into the resolution map a turn's
/// durable futures consume, tagging which ids resolved from `newEvents`, and
/// into the map of already-journaled schedule points (spec.md §4.4.2 point
/// 3). The latter lets a replayed future recognize an `event_id` it already
/// scheduled in a prior turn instead of re-emitting the scheduling action,
/// and lets it detect the same `event_id` being scheduled under a different
/// name/kind on replay (spec.md §8 scenario 6).
fn build_resolutions(
    history_before: &[HistoryEvent],
    new_events: &[HistoryEvent],
) -> (HashMap<u64, Resolution>, HashMap<u64, ScheduledSignature>, HashSet<u64>) {
    let mut resolutions = HashMap::new();
    let mut scheduled = HashMap::new();
    let mut from_new = HashSet::new();

    let tagged = history_before
        .iter()
        .map(|e| (false, e))
        .chain(new_events.iter().map(|e| (true, e)));

    for (is_new, event) in tagged {
        match event {
            HistoryEvent::TaskScheduled { event_id, name, .. } => {
                scheduled.insert(*event_id, ScheduledSignature::Task(name.clone()));
                continue;
            }
            HistoryEvent::SubOrchestrationInstanceCreated { event_id, name, .. } => {
                scheduled.insert(*event_id, ScheduledSignature::SubOrchestration(name.clone()));
                continue;
            }
            HistoryEvent::TimerCreated { event_id, .. } => {
                scheduled.insert(*event_id, ScheduledSignature::Timer);
                continue;
            }
            _ => {}
        }

        let (event_id, resolution) = match event {
            HistoryEvent::TaskCompleted { event_id, result } => (*event_id, Resolution::Task(Ok(result.clone()))),
            HistoryEvent::TaskFailed { event_id, failure } => (*event_id, Resolution::Task(Err(failure.clone()))),
            HistoryEvent::SubOrchestrationInstanceCompleted { event_id, result } => {
                (*event_id, Resolution::SubOrchestration(Ok(result.clone())))
            }
            HistoryEvent::SubOrchestrationInstanceFailed { event_id, failure } => {
                (*event_id, Resolution::SubOrchestration(Err(failure.clone())))
            }
            HistoryEvent::TimerFired { event_id, .. } => (*event_id, Resolution::Timer),
            _ => continue,
        };
        resolutions.insert(event_id, resolution);
        if is_new {
            from_new.insert(event_id);
        }
    }

    (resolutions, scheduled, from_new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::orchestration::Orchestration;
    use crate::task_name::TaskName;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Input {
        n: i32,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Output {
        doubled: i32,
    }

    struct DoublesViaActivity;

    #[async_trait(?Send)]
    impl Orchestration for DoublesViaActivity {
        const TYPE: &'static str = "DoublesViaActivity";
        type Input = Input;
        type Output = Output;

        async fn run(
            &self,
            ctx: OrchestrationContext,
            input: Input,
        ) -> Result<Output, OrchestrationFailure> {
            let doubled: i32 = ctx
                .schedule_task(TaskName::new("Double"), input.n, None)
                .await
                .map_err(OrchestrationFailure::from)?;
            Ok(Output { doubled })
        }
    }

    fn engine() -> ReplayEngine {
        let mut registry = Registry::new();
        registry.register_orchestration(DoublesViaActivity).unwrap();
        ReplayEngine::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn first_turn_schedules_the_activity_and_blocks() {
        let engine = engine();
        let codec = JsonCodec;
        let input = codec.encode(&Input { n: 21 }).unwrap();

        let output = engine
            .run_turn("inst-1", &TaskName::new("DoublesViaActivity"), &[], &[], input)
            .await;

        assert_eq!(output.actions.len(), 1);
        assert!(matches!(output.actions[0], Action::ScheduleTask { event_id: 0, .. }));
        assert!(output.terminal_outcome.is_none());
    }

    #[tokio::test]
    async fn second_turn_completes_once_the_activity_result_is_available() {
        let engine = engine();
        let codec = JsonCodec;
        let input = codec.encode(&Input { n: 21 }).unwrap();

        let history_before = vec![HistoryEvent::TaskScheduled {
            event_id: 0,
            name: TaskName::new("Double"),
            input: Payload::null(),
        }];
        let new_events = vec![HistoryEvent::TaskCompleted {
            event_id: 0,
            result: codec.encode(&42i32).unwrap(),
        }];

        let output = engine
            .run_turn(
                "inst-1",
                &TaskName::new("DoublesViaActivity"),
                &history_before,
                &new_events,
                input,
            )
            .await;

        assert!(output.actions.is_empty());
        match output.terminal_outcome {
            Some(TerminalOutcome::Completed(payload)) => {
                let out: Output = codec.decode(&payload).unwrap();
                assert_eq!(out, Output { doubled: 42 });
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_task_name_fails_immediately() {
        let engine = engine();
        let output = engine
            .run_turn("inst-1", &TaskName::new("NotRegistered"), &[], &[], Payload::null())
            .await;

        match output.terminal_outcome {
            Some(TerminalOutcome::Failed(failure)) => assert_eq!(failure.error_type, "UnknownTaskError"),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
