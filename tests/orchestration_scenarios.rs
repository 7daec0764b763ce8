//! End-to-end scenarios driving the replay engine turn by turn, the way a
//! worker loop would: build history, run a turn, inspect the actions it
//! produced, simulate the backend resolving them, and run the next turn.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use durable_task_core::cancellation::CancellationToken;
use durable_task_core::codec::{Codec, JsonCodec};
use durable_task_core::context::OrchestrationContext;
use durable_task_core::history::HistoryEvent;
use durable_task_core::orchestration::{Orchestration, OrchestrationFailure};
use durable_task_core::payload::Payload;
use durable_task_core::registry::Registry;
use durable_task_core::reliability::RetryPolicy;
use durable_task_core::task_name::TaskName;
use durable_task_core::{Action, EngineConfig, ReplayEngine, TerminalOutcome};

fn codec() -> JsonCodec {
    JsonCodec
}

// ---------------------------------------------------------------------
// Scenario 1: a simple two-activity chain
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct ChainInput {
    start: i32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ChainOutput {
    result: i32,
}

struct TwoStepChain;

#[async_trait(?Send)]
impl Orchestration for TwoStepChain {
    const TYPE: &'static str = "TwoStepChain";
    type Input = ChainInput;
    type Output = ChainOutput;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        input: ChainInput,
    ) -> Result<ChainOutput, OrchestrationFailure> {
        let once: i32 = ctx
            .schedule_task(TaskName::new("Increment"), input.start, None)
            .await
            .map_err(OrchestrationFailure::from)?;
        let twice: i32 = ctx
            .schedule_task(TaskName::new("Increment"), once, None)
            .await
            .map_err(OrchestrationFailure::from)?;
        Ok(ChainOutput { result: twice })
    }
}

#[tokio::test]
async fn simple_activity_chain_runs_across_three_turns() {
    let mut registry = Registry::new();
    registry.register_orchestration(TwoStepChain).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("TwoStepChain");
    let input = codec.encode(&ChainInput { start: 1 }).unwrap();

    // Turn 1: schedules the first Increment, blocks
    let turn1 = engine.run_turn("inst-1", &task_name, &[], &[], input.clone()).await;
    assert_eq!(turn1.actions.len(), 1);
    assert!(matches!(turn1.actions[0], Action::ScheduleTask { event_id: 0, .. }));
    assert!(turn1.terminal_outcome.is_none());

    // Turn 2: first activity resolves, schedules the second, blocks again
    let history_before = vec![HistoryEvent::TaskScheduled {
        event_id: 0,
        name: TaskName::new("Increment"),
        input: Payload::null(),
    }];
    let new_events = vec![HistoryEvent::TaskCompleted {
        event_id: 0,
        result: codec.encode(&2i32).unwrap(),
    }];
    let turn2 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input.clone())
        .await;
    assert_eq!(turn2.actions.len(), 1);
    assert!(matches!(turn2.actions[0], Action::ScheduleTask { event_id: 1, .. }));
    assert!(turn2.terminal_outcome.is_none());

    // Turn 3: second activity resolves, orchestration completes
    let history_before = vec![
        HistoryEvent::TaskScheduled { event_id: 0, name: TaskName::new("Increment"), input: Payload::null() },
        HistoryEvent::TaskCompleted { event_id: 0, result: codec.encode(&2i32).unwrap() },
        HistoryEvent::TaskScheduled { event_id: 1, name: TaskName::new("Increment"), input: Payload::null() },
    ];
    let new_events = vec![HistoryEvent::TaskCompleted {
        event_id: 1,
        result: codec.encode(&3i32).unwrap(),
    }];
    let turn3 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input)
        .await;
    assert!(turn3.actions.is_empty());
    match turn3.terminal_outcome {
        Some(TerminalOutcome::Completed(payload)) => {
            let out: ChainOutput = codec.decode(&payload).unwrap();
            assert_eq!(out, ChainOutput { result: 3 });
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

// ---------------------------------------------------------------------
// Scenario 2: fan-out / fan-in over a variable number of activities
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct FanInput {
    count: i32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct FanOutput {
    sum: i32,
}

struct FanOutFanIn;

#[async_trait(?Send)]
impl Orchestration for FanOutFanIn {
    const TYPE: &'static str = "FanOutFanIn";
    type Input = FanInput;
    type Output = FanOutput;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        input: FanInput,
    ) -> Result<FanOutput, OrchestrationFailure> {
        let futures: Vec<_> = (0..input.count)
            .map(|i| ctx.schedule_task::<i32>(TaskName::new("Double"), i, None))
            .collect();

        let mut sum = 0;
        for fut in futures {
            sum += fut.await.map_err(OrchestrationFailure::from)?;
        }
        Ok(FanOutput { sum })
    }
}

#[tokio::test]
async fn fan_out_fan_in_schedules_all_activities_in_one_turn() {
    let mut registry = Registry::new();
    registry.register_orchestration(FanOutFanIn).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("FanOutFanIn");
    let input = codec.encode(&FanInput { count: 5 }).unwrap();

    let turn1 = engine.run_turn("inst-1", &task_name, &[], &[], input.clone()).await;
    assert_eq!(turn1.actions.len(), 5);
    for (i, action) in turn1.actions.iter().enumerate() {
        assert!(matches!(action, Action::ScheduleTask { event_id, .. } if *event_id == i as u64));
    }
    assert!(turn1.terminal_outcome.is_none());

    // Resolve all five at once
    let history_before: Vec<_> = (0..5)
        .map(|i| HistoryEvent::TaskScheduled { event_id: i, name: TaskName::new("Double"), input: Payload::null() })
        .collect();
    let new_events: Vec<_> = (0..5)
        .map(|i| HistoryEvent::TaskCompleted { event_id: i, result: codec.encode(&(i as i32 * 2)).unwrap() })
        .collect();

    let turn2 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input)
        .await;
    assert!(turn2.actions.is_empty());
    match turn2.terminal_outcome {
        Some(TerminalOutcome::Completed(payload)) => {
            let out: FanOutput = codec.decode(&payload).unwrap();
            assert_eq!(out, FanOutput { sum: 0 + 2 + 4 + 6 + 8 });
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

// ---------------------------------------------------------------------
// Scenario 3: orchestration-level manual retry over a transient failure
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct RetryInput {
    attempts: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct RetryOutput {
    succeeded_on_attempt: u32,
}

struct RetriesUntilSuccess;

#[async_trait(?Send)]
impl Orchestration for RetriesUntilSuccess {
    const TYPE: &'static str = "RetriesUntilSuccess";
    type Input = RetryInput;
    type Output = RetryOutput;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        _input: RetryInput,
    ) -> Result<RetryOutput, OrchestrationFailure> {
        let policy = RetryPolicy::exponential().with_max_attempts(3);
        let mut attempt = 1;
        loop {
            let result: Result<String, _> = ctx
                .schedule_task(TaskName::new("FlakyCall"), attempt, None)
                .await;

            match result {
                Ok(_) => return Ok(RetryOutput { succeeded_on_attempt: attempt }),
                Err(failure) if attempt < policy.max_attempts => {
                    if !policy.should_retry(&failure, attempt, Duration::ZERO) {
                        return Err(failure.into());
                    }
                    attempt += 1;
                }
                Err(failure) => return Err(failure.into()),
            }
        }
    }
}

#[tokio::test]
async fn orchestration_retries_past_a_transient_failure_then_succeeds() {
    let mut registry = Registry::new();
    registry.register_orchestration(RetriesUntilSuccess).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("RetriesUntilSuccess");
    let input = codec.encode(&RetryInput { attempts: 3 }).unwrap();

    // Turn 1: schedules attempt 1
    let turn1 = engine.run_turn("inst-1", &task_name, &[], &[], input.clone()).await;
    assert_eq!(turn1.actions.len(), 1);

    // Turn 2: attempt 1 fails transiently, orchestration schedules attempt 2
    let history_before = vec![HistoryEvent::TaskScheduled {
        event_id: 0,
        name: TaskName::new("FlakyCall"),
        input: Payload::null(),
    }];
    let new_events = vec![HistoryEvent::TaskFailed {
        event_id: 0,
        failure: durable_task_core::FailureDetails::new("TransientError", "connection reset"),
    }];
    let turn2 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input.clone())
        .await;
    assert_eq!(turn2.actions.len(), 1);
    assert!(matches!(turn2.actions[0], Action::ScheduleTask { event_id: 1, .. }));
    assert!(turn2.terminal_outcome.is_none());

    // Turn 3: attempt 2 succeeds
    let history_before = vec![
        HistoryEvent::TaskScheduled { event_id: 0, name: TaskName::new("FlakyCall"), input: Payload::null() },
        HistoryEvent::TaskFailed {
            event_id: 0,
            failure: durable_task_core::FailureDetails::new("TransientError", "connection reset"),
        },
        HistoryEvent::TaskScheduled { event_id: 1, name: TaskName::new("FlakyCall"), input: Payload::null() },
    ];
    let new_events = vec![HistoryEvent::TaskCompleted {
        event_id: 1,
        result: codec.encode(&"ok".to_string()).unwrap(),
    }];
    let turn3 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input)
        .await;
    match turn3.terminal_outcome {
        Some(TerminalOutcome::Completed(payload)) => {
            let out: RetryOutput = codec.decode(&payload).unwrap();
            assert_eq!(out, RetryOutput { succeeded_on_attempt: 2 });
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

// ---------------------------------------------------------------------
// Scenario 3b: an attached retry policy drives retries automatically,
// with no loop in the orchestration body
// ---------------------------------------------------------------------

struct SchedulesWithAutomaticRetry;

#[async_trait(?Send)]
impl Orchestration for SchedulesWithAutomaticRetry {
    const TYPE: &'static str = "SchedulesWithAutomaticRetry";
    type Input = RetryInput;
    type Output = RetryOutput;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        _input: RetryInput,
    ) -> Result<RetryOutput, OrchestrationFailure> {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(2)
            .with_first_interval(Duration::from_secs(5));

        let succeeded_on_attempt: u32 = ctx
            .schedule_task(TaskName::new("FlakyCall"), 0, Some(policy))
            .await
            .map_err(OrchestrationFailure::from)?;

        Ok(RetryOutput { succeeded_on_attempt })
    }
}

#[tokio::test]
async fn attached_retry_policy_reschedules_through_a_backoff_timer_automatically() {
    let mut registry = Registry::new();
    registry.register_orchestration(SchedulesWithAutomaticRetry).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("SchedulesWithAutomaticRetry");
    let input = codec.encode(&RetryInput { attempts: 2 }).unwrap();

    // Turn 1: schedules attempt 1, no retry loop in the orchestration body
    let turn1 = engine.run_turn("inst-1", &task_name, &[], &[], input.clone()).await;
    assert_eq!(turn1.actions.len(), 1);
    assert!(matches!(turn1.actions[0], Action::ScheduleTask { event_id: 0, .. }));

    // Turn 2: attempt 1 fails; the engine itself emits the backoff timer
    let history_before = vec![HistoryEvent::TaskScheduled {
        event_id: 0,
        name: TaskName::new("FlakyCall"),
        input: Payload::null(),
    }];
    let new_events = vec![HistoryEvent::TaskFailed {
        event_id: 0,
        failure: durable_task_core::FailureDetails::new("TransientError", "flaky"),
    }];
    let turn2 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input.clone())
        .await;
    assert_eq!(turn2.actions.len(), 1);
    assert!(matches!(turn2.actions[0], Action::CreateTimer { event_id: 1, .. }));

    // Turn 3: the backoff timer fires, attempt 2 is scheduled automatically
    let fire_at = chrono::Utc::now();
    let history_before = vec![
        HistoryEvent::TaskScheduled { event_id: 0, name: TaskName::new("FlakyCall"), input: Payload::null() },
        HistoryEvent::TaskFailed {
            event_id: 0,
            failure: durable_task_core::FailureDetails::new("TransientError", "flaky"),
        },
        HistoryEvent::TimerCreated { event_id: 1, fire_at },
    ];
    let new_events = vec![HistoryEvent::TimerFired { event_id: 1, fire_at }];
    let turn3 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input.clone())
        .await;
    assert_eq!(turn3.actions.len(), 1);
    assert!(matches!(turn3.actions[0], Action::ScheduleTask { event_id: 2, .. }));

    // Turn 4: attempt 2 succeeds
    let history_before = vec![
        HistoryEvent::TaskScheduled { event_id: 0, name: TaskName::new("FlakyCall"), input: Payload::null() },
        HistoryEvent::TaskFailed {
            event_id: 0,
            failure: durable_task_core::FailureDetails::new("TransientError", "flaky"),
        },
        HistoryEvent::TimerCreated { event_id: 1, fire_at },
        HistoryEvent::TimerFired { event_id: 1, fire_at },
        HistoryEvent::TaskScheduled { event_id: 2, name: TaskName::new("FlakyCall"), input: Payload::null() },
    ];
    let new_events = vec![HistoryEvent::TaskCompleted {
        event_id: 2,
        result: codec.encode(&2u32).unwrap(),
    }];
    let turn4 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input)
        .await;
    assert!(turn4.actions.is_empty());
    match turn4.terminal_outcome {
        Some(TerminalOutcome::Completed(payload)) => {
            let out: RetryOutput = codec.decode(&payload).unwrap();
            assert_eq!(out, RetryOutput { succeeded_on_attempt: 2 });
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

// ---------------------------------------------------------------------
// Scenario 4: racing an external event against a timeout timer
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct ApprovalInput;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ApprovalOutput {
    approved: bool,
}

struct WaitForApprovalOrTimeout;

#[async_trait(?Send)]
impl Orchestration for WaitForApprovalOrTimeout {
    const TYPE: &'static str = "WaitForApprovalOrTimeout";
    type Input = ApprovalInput;
    type Output = ApprovalOutput;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        _input: ApprovalInput,
    ) -> Result<ApprovalOutput, OrchestrationFailure> {
        let approval = ctx.wait_for_external_event::<bool>("Approval");
        let timeout = ctx.create_timer(Duration::from_secs(3600));

        futures::pin_mut!(approval);
        futures::pin_mut!(timeout);

        match futures::future::select(approval, timeout).await {
            futures::future::Either::Left((approved, _)) => Ok(ApprovalOutput { approved }),
            futures::future::Either::Right((timer_result, _)) => {
                timer_result.map_err(OrchestrationFailure::from)?;
                Ok(ApprovalOutput { approved: false })
            }
        }
    }
}

#[tokio::test]
async fn external_event_arriving_before_the_timer_wins_the_race() {
    let mut registry = Registry::new();
    registry.register_orchestration(WaitForApprovalOrTimeout).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("WaitForApprovalOrTimeout");
    let input = Payload::null();

    // Turn 1: both the timer and the wait are registered, nothing resolves yet
    let turn1 = engine.run_turn("inst-1", &task_name, &[], &[], input.clone()).await;
    assert_eq!(turn1.actions.len(), 1);
    assert!(matches!(turn1.actions[0], Action::CreateTimer { event_id: 0, .. }));
    assert!(turn1.terminal_outcome.is_none());

    // Turn 2: the approval event arrives before the timer fires
    let history_before = vec![HistoryEvent::TimerCreated {
        event_id: 0,
        fire_at: chrono::Utc::now() + chrono::Duration::hours(1),
    }];
    let new_events = vec![HistoryEvent::EventRaised {
        name: "Approval".to_string(),
        input: codec.encode(&true).unwrap(),
    }];
    let turn2 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input)
        .await;
    match turn2.terminal_outcome {
        Some(TerminalOutcome::Completed(payload)) => {
            let out: ApprovalOutput = codec.decode(&payload).unwrap();
            assert_eq!(out, ApprovalOutput { approved: true });
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn timer_firing_before_any_approval_event_times_out() {
    let mut registry = Registry::new();
    registry.register_orchestration(WaitForApprovalOrTimeout).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let task_name = TaskName::new("WaitForApprovalOrTimeout");
    let input = Payload::null();

    let turn1 = engine.run_turn("inst-1", &task_name, &[], &[], input.clone()).await;
    assert_eq!(turn1.actions.len(), 1);

    let fire_at = chrono::Utc::now() + chrono::Duration::hours(1);
    let history_before = vec![HistoryEvent::TimerCreated { event_id: 0, fire_at }];
    let new_events = vec![HistoryEvent::TimerFired { event_id: 0, fire_at }];
    let turn2 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input)
        .await;

    match turn2.terminal_outcome {
        Some(TerminalOutcome::Completed(payload)) => {
            let out: ApprovalOutput = JsonCodec.decode(&payload).unwrap();
            assert_eq!(out, ApprovalOutput { approved: false });
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

// ---------------------------------------------------------------------
// Scenario 5: continue-as-new, preserving unconsumed events
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CounterInput {
    n: i32,
}

struct RestartingCounter;

#[async_trait(?Send)]
impl Orchestration for RestartingCounter {
    const TYPE: &'static str = "RestartingCounter";
    type Input = CounterInput;
    type Output = CounterInput;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        input: CounterInput,
    ) -> Result<CounterInput, OrchestrationFailure> {
        if input.n < 3 {
            ctx.continue_as_new(CounterInput { n: input.n + 1 }, true);
            // The value returned here never reaches the caller: continue-as-new
            // always takes precedence over this execution's own completion.
            return Ok(CounterInput { n: input.n });
        }
        Ok(input)
    }
}

#[tokio::test]
async fn continue_as_new_action_is_emitted_with_no_terminal_outcome() {
    let mut registry = Registry::new();
    registry.register_orchestration(RestartingCounter).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("RestartingCounter");
    let input = codec.encode(&CounterInput { n: 0 }).unwrap();

    let turn = engine.run_turn("inst-1", &task_name, &[], &[], input).await;

    assert!(turn.terminal_outcome.is_none());
    assert_eq!(turn.actions.len(), 1);
    match &turn.actions[0] {
        Action::ContinueAsNew { input, preserve_unconsumed_events } => {
            let next: CounterInput = codec.decode(input).unwrap();
            assert_eq!(next.n, 1);
            assert!(*preserve_unconsumed_events);
        }
        other => panic!("expected ContinueAsNew, got {other:?}"),
    }
}

#[tokio::test]
async fn final_execution_completes_normally() {
    let mut registry = Registry::new();
    registry.register_orchestration(RestartingCounter).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("RestartingCounter");
    let input = codec.encode(&CounterInput { n: 3 }).unwrap();

    let turn = engine.run_turn("inst-1", &task_name, &[], &[], input).await;
    assert!(turn.actions.is_empty());
    match turn.terminal_outcome {
        Some(TerminalOutcome::Completed(payload)) => {
            let out: CounterInput = codec.decode(&payload).unwrap();
            assert_eq!(out.n, 3);
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

struct ContinuesAfterBufferingEvents;

#[async_trait(?Send)]
impl Orchestration for ContinuesAfterBufferingEvents {
    const TYPE: &'static str = "ContinuesAfterBufferingEvents";
    type Input = ();
    type Output = ();

    async fn run(&self, ctx: OrchestrationContext, _input: ()) -> Result<(), OrchestrationFailure> {
        ctx.continue_as_new((), true);
        Ok(())
    }
}

#[tokio::test]
async fn continue_as_new_re_emits_unconsumed_buffered_events_in_arrival_order() {
    let mut registry = Registry::new();
    registry.register_orchestration(ContinuesAfterBufferingEvents).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("ContinuesAfterBufferingEvents");
    let input = codec.encode(&()).unwrap();

    let history = vec![
        HistoryEvent::EventRaised { name: "X".into(), input: codec.encode(&"a").unwrap() },
        HistoryEvent::EventRaised { name: "X".into(), input: codec.encode(&"b").unwrap() },
    ];

    let turn = engine.run_turn("inst-1", &task_name, &history, &[], input).await;

    assert_eq!(turn.actions.len(), 3);
    assert!(matches!(turn.actions[0], Action::ContinueAsNew { preserve_unconsumed_events: true, .. }));
    for (idx, expected) in [(1, "a"), (2, "b")] {
        match &turn.actions[idx] {
            Action::SendEvent { target_instance_id, name, payload } => {
                assert_eq!(target_instance_id, "inst-1");
                assert_eq!(name, "X");
                let value: String = codec.decode(payload).unwrap();
                assert_eq!(value, expected);
            }
            other => panic!("expected SendEvent, got {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------
// Scenario 6: nondeterminism detection
// ---------------------------------------------------------------------

struct SchedulesOneActivity;

#[async_trait(?Send)]
impl Orchestration for SchedulesOneActivity {
    const TYPE: &'static str = "SchedulesOneActivity";
    type Input = ChainInput;
    type Output = ChainOutput;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        input: ChainInput,
    ) -> Result<ChainOutput, OrchestrationFailure> {
        let result: i32 = ctx
            .schedule_task(TaskName::new("Increment"), input.start, None)
            .await
            .map_err(OrchestrationFailure::from)?;
        Ok(ChainOutput { result })
    }
}

#[tokio::test]
async fn mismatched_resolution_kind_surfaces_as_nondeterminism_failure() {
    let mut registry = Registry::new();
    registry.register_orchestration(SchedulesOneActivity).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("SchedulesOneActivity");
    let input = codec.encode(&ChainInput { start: 1 }).unwrap();

    // The orchestration's first await expects a task resolution at event 0,
    // but history records a timer firing at that id instead -- a rebuilt
    // binary that reordered operations would produce exactly this shape.
    let fire_at = chrono::Utc::now();
    let history_before = vec![HistoryEvent::TimerCreated { event_id: 0, fire_at }];
    let new_events = vec![HistoryEvent::TimerFired { event_id: 0, fire_at }];

    let turn = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input)
        .await;

    match turn.terminal_outcome {
        Some(TerminalOutcome::Failed(failure)) => {
            assert_eq!(failure.error_type, "NondeterministicExecution");
        }
        other => panic!("expected a nondeterminism failure, got {other:?}"),
    }
}

#[tokio::test]
async fn same_event_id_scheduled_under_a_different_task_name_is_nondeterministic() {
    let mut registry = Registry::new();
    registry.register_orchestration(SchedulesOneActivity).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("SchedulesOneActivity");
    let input = codec.encode(&ChainInput { start: 1 }).unwrap();

    // History recorded event 0 as a call to "SomeOtherActivity", but replaying
    // this orchestration schedules "Increment" at that same event id -- the
    // shape a rebuilt binary with reordered or renamed calls would produce.
    let history_before = vec![HistoryEvent::TaskScheduled {
        event_id: 0,
        name: TaskName::new("SomeOtherActivity"),
        input: Payload::null(),
    }];
    let new_events = vec![HistoryEvent::TaskCompleted {
        event_id: 0,
        result: codec.encode(&2i32).unwrap(),
    }];

    let turn = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input)
        .await;

    match turn.terminal_outcome {
        Some(TerminalOutcome::Failed(failure)) => {
            assert_eq!(failure.error_type, "NondeterministicExecution");
        }
        other => panic!("expected a nondeterminism failure, got {other:?}"),
    }
}

#[tokio::test]
async fn unregistered_orchestration_fails_the_first_turn() {
    let registry = Registry::new();
    let engine = ReplayEngine::new(Arc::new(registry));

    let turn = engine
        .run_turn("inst-1", &TaskName::new("Ghost"), &[], &[], Payload::null())
        .await;

    match turn.terminal_outcome {
        Some(TerminalOutcome::Failed(failure)) => assert_eq!(failure.error_type, "UnknownTaskError"),
        other => panic!("expected failure, got {other:?}"),
    }
}

// ---------------------------------------------------------------------
// Scenario 7: ctx.with_retry chains a timer between failed attempts
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ViaHelperOutput {
    attempt: u32,
}

struct RetriesViaHelper;

#[async_trait(?Send)]
impl Orchestration for RetriesViaHelper {
    const TYPE: &'static str = "RetriesViaHelper";
    type Input = RetryInput;
    type Output = ViaHelperOutput;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        _input: RetryInput,
    ) -> Result<ViaHelperOutput, OrchestrationFailure> {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(2)
            .with_first_interval(Duration::from_secs(5));

        let attempt: u32 = ctx
            .with_retry(policy, |attempt| {
                let ctx = ctx.clone();
                async move {
                    ctx.schedule_task(TaskName::new("FlakyCall"), attempt, None)
                        .await
                }
            })
            .await
            .map_err(OrchestrationFailure::from)?;

        Ok(ViaHelperOutput { attempt })
    }
}

#[tokio::test]
async fn with_retry_creates_a_timer_between_a_failed_and_a_successful_attempt() {
    let mut registry = Registry::new();
    registry.register_orchestration(RetriesViaHelper).unwrap();
    let engine = ReplayEngine::new(Arc::new(registry));
    let codec = codec();
    let task_name = TaskName::new("RetriesViaHelper");
    let input = codec.encode(&RetryInput { attempts: 2 }).unwrap();

    // Turn 1: schedules attempt 1
    let turn1 = engine.run_turn("inst-1", &task_name, &[], &[], input.clone()).await;
    assert_eq!(turn1.actions.len(), 1);
    assert!(matches!(turn1.actions[0], Action::ScheduleTask { event_id: 0, .. }));

    // Turn 2: attempt 1 fails, with_retry waits out the backoff via a timer
    let history_before = vec![HistoryEvent::TaskScheduled {
        event_id: 0,
        name: TaskName::new("FlakyCall"),
        input: Payload::null(),
    }];
    let new_events = vec![HistoryEvent::TaskFailed {
        event_id: 0,
        failure: durable_task_core::FailureDetails::new("TransientError", "still flaky"),
    }];
    let turn2 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input.clone())
        .await;
    assert_eq!(turn2.actions.len(), 1);
    assert!(matches!(turn2.actions[0], Action::CreateTimer { event_id: 1, .. }));

    // Turn 3: the backoff timer fires, schedules attempt 2
    let fire_at = chrono::Utc::now();
    let history_before = vec![
        HistoryEvent::TaskScheduled { event_id: 0, name: TaskName::new("FlakyCall"), input: Payload::null() },
        HistoryEvent::TaskFailed {
            event_id: 0,
            failure: durable_task_core::FailureDetails::new("TransientError", "still flaky"),
        },
        HistoryEvent::TimerCreated { event_id: 1, fire_at },
    ];
    let new_events = vec![HistoryEvent::TimerFired { event_id: 1, fire_at }];
    let turn3 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input.clone())
        .await;
    assert_eq!(turn3.actions.len(), 1);
    assert!(matches!(turn3.actions[0], Action::ScheduleTask { event_id: 2, .. }));

    // Turn 4: attempt 2 succeeds
    let history_before = vec![
        HistoryEvent::TaskScheduled { event_id: 0, name: TaskName::new("FlakyCall"), input: Payload::null() },
        HistoryEvent::TaskFailed {
            event_id: 0,
            failure: durable_task_core::FailureDetails::new("TransientError", "still flaky"),
        },
        HistoryEvent::TimerCreated { event_id: 1, fire_at },
        HistoryEvent::TimerFired { event_id: 1, fire_at },
        HistoryEvent::TaskScheduled { event_id: 2, name: TaskName::new("FlakyCall"), input: Payload::null() },
    ];
    let new_events = vec![HistoryEvent::TaskCompleted {
        event_id: 2,
        result: codec.encode(&2u32).unwrap(),
    }];
    let turn4 = engine
        .run_turn("inst-1", &task_name, &history_before, &new_events, input)
        .await;
    match turn4.terminal_outcome {
        Some(TerminalOutcome::Completed(payload)) => {
            let out: ViaHelperOutput = codec.decode(&payload).unwrap();
            assert_eq!(out, ViaHelperOutput { attempt: 2 });
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

// ---------------------------------------------------------------------
// Scenario 8: cooperative cancellation
// ---------------------------------------------------------------------

#[tokio::test]
async fn cancelling_before_the_first_turn_fails_with_no_actions_emitted() {
    let mut registry = Registry::new();
    registry.register_orchestration(SchedulesOneActivity).unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let engine = ReplayEngine::new(Arc::new(registry)).with_cancellation(token);
    let codec = codec();
    let task_name = TaskName::new("SchedulesOneActivity");
    let input = codec.encode(&ChainInput { start: 1 }).unwrap();

    let turn = engine.run_turn("inst-1", &task_name, &[], &[], input).await;

    assert!(turn.actions.is_empty());
    match turn.terminal_outcome {
        Some(TerminalOutcome::Failed(failure)) => assert_eq!(failure.error_type, "Cancelled"),
        other => panic!("expected a cancellation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn engine_config_builder_sets_fields() {
    let config = EngineConfig::new()
        .with_maximum_timer_interval(Duration::from_secs(60))
        .with_max_poll_iterations(500);
    assert_eq!(config.maximum_timer_interval, Some(Duration::from_secs(60)));
    assert_eq!(config.max_poll_iterations, 500);
}
