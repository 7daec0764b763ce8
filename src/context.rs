//! Orchestration context: the durable-future surface orchestration code
//! schedules work through, and the turn-local state those futures resolve
//! against
//!
//! A turn's entire execution is single-threaded and cooperative, so turn
//! state is `Rc<RefCell<..>>` rather than `Arc<Mutex<..>>` — there is never
//! contention to arbitrate, only borrows to check, matching the teacher's
//! preference for the cheapest synchronization primitive that is actually
//! correct for the access pattern.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::action::Action;
use crate::cancellation::CancellationToken;
use crate::codec::DynCodec;
use crate::failure::FailureDetails;
use crate::payload::Payload;
use crate::task_name::TaskName;

/// The outcome a resolved schedule produced, keyed by `event_id`
#[derive(Debug, Clone)]
pub(crate) enum Resolution {
    Task(Result<Payload, FailureDetails>),
    SubOrchestration(Result<Payload, FailureDetails>),
    Timer,
}

/// The identity recorded at an already-journaled schedule point, keyed by
/// `event_id`
///
/// Built once from `historyBefore`/`newEvents` (spec.md §4.4.2 point 5) and
/// consulted by every durable future before it schedules: a match means the
/// schedule point is already known and no new action is emitted; a mismatch
/// means the same `event_id` was scheduled as a different task or kind this
/// time around, which is nondeterminism (spec.md §8 scenario 6).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScheduledSignature {
    Task(TaskName),
    SubOrchestration(TaskName),
    Timer,
}

/// Mutable, turn-scoped state shared by every durable future created during
/// one turn
pub(crate) struct TurnState {
    pub instance_id: String,
    pub execution_start_time: DateTime<Utc>,
    current_time: DateTime<Utc>,
    next_event_id: u64,
    maximum_timer_interval: Option<Duration>,
    cancellation: CancellationToken,
    resolutions: HashMap<u64, Resolution>,
    /// identity recorded at each already-journaled schedule point; see
    /// [`ScheduledSignature`]
    scheduled: HashMap<u64, ScheduledSignature>,
    /// event ids whose resolution came from this turn's `newEvents` rather
    /// than `historyBefore` — once a future consumes one of these, the turn
    /// is no longer "replaying"
    from_new_events: std::collections::HashSet<u64>,
    crossed_into_new: bool,
    actions: Vec<Action>,
    external_buffer: HashMap<String, VecDeque<(u64, Payload)>>,
    external_waiting: HashMap<String, VecDeque<u64>>,
    external_resolved: HashMap<u64, Payload>,
    next_external_handle: u64,
    /// Monotonic arrival order for buffered external events, independent of
    /// which name they were raised under — lets a continue-as-new that
    /// preserves unconsumed events re-emit them in the order they actually
    /// arrived rather than grouped by name
    next_external_seq: u64,
    guid_counter: u64,
    custom_status: Option<Payload>,
    continue_as_new: Option<Action>,
    /// Bumped by every mutation that represents forward progress; the turn
    /// driver polls to a fixed point by comparing this across poll calls.
    version: u64,
}

impl TurnState {
    fn allocate_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    fn push_action(&mut self, action: Action) {
        self.actions.push(action);
        self.version += 1;
    }

    fn take_resolution(&mut self, event_id: u64) -> Option<Resolution> {
        let resolution = self.resolutions.remove(&event_id)?;
        if self.from_new_events.remove(&event_id) {
            self.crossed_into_new = true;
        }
        self.version += 1;
        Some(resolution)
    }

    /// What, if anything, history already recorded at this schedule point
    fn historical_schedule(&self, event_id: u64) -> Option<&ScheduledSignature> {
        self.scheduled.get(&event_id)
    }

    /// Allocate the event id for a retry backoff timer, only pushing a new
    /// `CreateTimer` action when this point isn't already journaled
    fn schedule_backoff_timer(&mut self, delay: Duration) -> Result<u64, FailureDetails> {
        let event_id = self.allocate_event_id();
        let fire_at = self.current_time + chrono::Duration::from_std(delay).unwrap_or_default();
        match self.historical_schedule(event_id) {
            Some(ScheduledSignature::Timer) => Ok(event_id),
            Some(other) => Err(FailureDetails::nondeterministic(format!(
                "event {event_id} was recorded as {other:?}, but replay scheduled a retry backoff timer"
            ))),
            None => {
                self.push_action(Action::timer(event_id, fire_at));
                Ok(event_id)
            }
        }
    }

    fn allocate_external_handle(&mut self, name: &str) -> u64 {
        let handle = self.next_external_handle;
        self.next_external_handle += 1;
        self.external_waiting
            .entry(name.to_string())
            .or_default()
            .push_back(handle);
        self.try_deliver_external(name);
        self.version += 1;
        handle
    }

    /// FIFO-match buffered payloads against waiters for `name`
    fn try_deliver_external(&mut self, name: &str) {
        loop {
            let (Some(waiters), Some(buffer)) = (
                self.external_waiting.get_mut(name),
                self.external_buffer.get_mut(name),
            ) else {
                return;
            };
            if waiters.is_empty() || buffer.is_empty() {
                return;
            }
            let handle = waiters.pop_front().unwrap();
            let (_, payload) = buffer.pop_front().unwrap();
            self.external_resolved.insert(handle, payload);
        }
    }

    fn buffer_external_event(&mut self, name: String, payload: Payload) {
        let seq = self.next_external_seq;
        self.next_external_seq += 1;
        self.external_buffer.entry(name.clone()).or_default().push_back((seq, payload));
        self.try_deliver_external(&name);
        self.version += 1;
    }

    /// Drain every still-buffered (never delivered to a waiter) external
    /// event, in the order it originally arrived
    fn drain_unconsumed_external_events(&mut self) -> Vec<(String, Payload)> {
        let mut drained: Vec<(u64, String, Payload)> = self
            .external_buffer
            .drain()
            .flat_map(|(name, queue)| queue.into_iter().map(move |(seq, payload)| (seq, name.clone(), payload)))
            .collect();
        drained.sort_by_key(|(seq, _, _)| *seq);
        drained.into_iter().map(|(_, name, payload)| (name, payload)).collect()
    }
}

/// A handle orchestration code holds to interact with the durable engine
///
/// Cheap to clone: internally an `Rc` to shared turn state. Not `Send` —
/// orchestration futures run on a single thread for the lifetime of a turn.
#[derive(Clone)]
pub struct OrchestrationContext {
    state: Rc<RefCell<TurnState>>,
    codec: DynCodec,
}

impl fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("instance_id", &self.state.borrow().instance_id)
            .finish()
    }
}

impl OrchestrationContext {
    /// Build a fresh context for one turn
    ///
    /// `next_event_id` always starts at 0: the orchestration's `run` is
    /// re-executed from the top on every turn, so the Nth schedule call it
    /// makes this turn must line up positionally with the Nth schedule
    /// recorded in history (spec.md §4.4.2) — there is no carried-over
    /// counter between turns.
    pub(crate) fn new(
        instance_id: String,
        execution_start_time: DateTime<Utc>,
        resolutions: HashMap<u64, Resolution>,
        scheduled: HashMap<u64, ScheduledSignature>,
        from_new_events: std::collections::HashSet<u64>,
        codec: DynCodec,
        maximum_timer_interval: Option<Duration>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            state: Rc::new(RefCell::new(TurnState {
                instance_id,
                execution_start_time,
                current_time: execution_start_time,
                next_event_id: 0,
                maximum_timer_interval,
                cancellation,
                resolutions,
                scheduled,
                from_new_events,
                crossed_into_new: false,
                actions: Vec::new(),
                external_buffer: HashMap::new(),
                external_waiting: HashMap::new(),
                external_resolved: HashMap::new(),
                next_external_handle: 0,
                next_external_seq: 0,
                guid_counter: 0,
                custom_status: None,
                continue_as_new: None,
                version: 0,
            })),
            codec,
        }
    }

    pub fn instance_id(&self) -> String {
        self.state.borrow().instance_id.clone()
    }

    /// Whether this turn is still reconstructing state from already-journaled
    /// history, as opposed to making newly-observable progress
    ///
    /// Orchestration code should gate side effects (logging, metrics) behind
    /// `!ctx.is_replaying()` the way the teacher's executor gated its own
    /// instrumentation on its `is_replaying` flag.
    pub fn is_replaying(&self) -> bool {
        !self.state.borrow().crossed_into_new
    }

    /// A deterministic clock: the time of the most recently resolved event
    /// this turn has observed, or the execution's start time if none yet
    pub fn current_time(&self) -> DateTime<Utc> {
        self.state.borrow().current_time
    }

    pub(crate) fn advance_clock(&self, to: DateTime<Utc>) {
        let mut state = self.state.borrow_mut();
        if to > state.current_time {
            state.current_time = to;
        }
    }

    /// A deterministic GUID, stable across replay: derived from the instance
    /// id and a per-context call counter, never from wall-clock randomness
    pub fn new_guid(&self) -> Uuid {
        let mut state = self.state.borrow_mut();
        let sequence = state.guid_counter;
        state.guid_counter += 1;
        deterministic_guid(&state.instance_id, sequence, state.execution_start_time)
    }

    /// Schedule an activity by name
    pub fn schedule_task<O: DeserializeOwned>(
        &self,
        task_name: impl Into<TaskName>,
        input: impl Serialize,
        retry_policy: Option<crate::reliability::RetryPolicy>,
    ) -> ActivityTask<O> {
        let payload = self.codec.encode(&input).unwrap_or_else(|_| Payload::null());
        ActivityTask {
            state: self.state.clone(),
            codec: self.codec.clone(),
            task_name: task_name.into(),
            input: payload,
            retry_policy,
            started_at: None,
            step: ActivityStep::Schedule(1),
            _marker: std::marker::PhantomData,
        }
    }

    /// Schedule a sub-orchestration by name
    pub fn call_sub_orchestration<O: DeserializeOwned>(
        &self,
        task_name: impl Into<TaskName>,
        instance_id: Option<String>,
        input: impl Serialize,
        retry_policy: Option<crate::reliability::RetryPolicy>,
    ) -> SubOrchestrationTask<O> {
        let payload = self.codec.encode(&input).unwrap_or_else(|_| Payload::null());
        SubOrchestrationTask {
            state: self.state.clone(),
            codec: self.codec.clone(),
            task_name: task_name.into(),
            instance_id,
            input: payload,
            retry_policy,
            started_at: None,
            step: SubOrchestrationStep::Schedule(1),
            _marker: std::marker::PhantomData,
        }
    }

    /// Create a durable timer that resolves after `duration`
    pub fn create_timer(&self, duration: Duration) -> TimerTask {
        TimerTask {
            state: self.state.clone(),
            duration,
            event_ids: None,
        }
    }

    /// Wait for the next external event named `name`
    ///
    /// Matching is FIFO per spec.md §4.4.4: the Nth call waiting on `name`
    /// resolves from the Nth buffered payload for `name`, regardless of
    /// arrival order between calls for different names.
    pub fn wait_for_external_event<O: DeserializeOwned>(&self, name: impl Into<String>) -> ExternalEventTask<O> {
        ExternalEventTask {
            state: self.state.clone(),
            codec: self.codec.clone(),
            name: name.into(),
            handle: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Buffer an externally-raised event for FIFO delivery to waiters
    pub(crate) fn raise_event(&self, name: String, payload: Payload) {
        self.state.borrow_mut().buffer_external_event(name, payload);
    }

    /// Set the orchestration's custom status, visible to external queriers
    pub fn set_custom_status(&self, status: impl Serialize) {
        let payload = self.codec.encode(&status).unwrap_or_else(|_| Payload::null());
        let mut state = self.state.borrow_mut();
        state.custom_status = Some(payload);
        state.version += 1;
    }

    /// Request that this execution restart as a new execution once the
    /// current turn completes
    pub fn continue_as_new(&self, input: impl Serialize, preserve_unconsumed_events: bool) {
        let payload = self.codec.encode(&input).unwrap_or_else(|_| Payload::null());
        let mut state = self.state.borrow_mut();
        state.continue_as_new = Some(Action::ContinueAsNew {
            input: payload,
            preserve_unconsumed_events,
        });
        state.version += 1;
    }

    /// The instance's cooperative cancellation token
    ///
    /// Checked by [`ActivityTask`]/[`SubOrchestrationTask`] before they
    /// schedule (an already-cancelled token short-circuits to a `Cancelled`
    /// failure with no action emitted) and by [`TimerTask`] on every poll
    /// (a timer resolves cancelled the instant the token fires, even if it
    /// was already journaled — spec.md §5). Callers needing a narrower scope
    /// can derive `ctx.cancellation().child_token()`.
    pub fn cancellation(&self) -> CancellationToken {
        self.state.borrow().cancellation.clone()
    }

    /// Run `attempt` repeatedly, retrying per `policy` between failures
    ///
    /// Between attempts, waits out the policy's computed backoff via a
    /// durable timer — the same `CreateTimer` action path user code uses,
    /// producing the `Schedule, CreateTimer, Schedule, ...` action sequence
    /// of spec.md §8 scenario 3. An imperative `policy.handle`, if attached,
    /// supersedes the declarative backoff/attempt-count decision entirely.
    pub async fn with_retry<O, F, Fut>(
        &self,
        policy: crate::reliability::RetryPolicy,
        mut attempt_fn: F,
    ) -> Result<O, FailureDetails>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<O, FailureDetails>>,
    {
        let start = self.current_time();
        let mut attempt = 1u32;
        loop {
            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    let elapsed = (self.current_time() - start).to_std().unwrap_or(Duration::ZERO);
                    let should_retry = match &policy.handle {
                        Some(handler) => {
                            let cancellation = self.cancellation();
                            handler(crate::reliability::RetryHandlerArgs {
                                attempt,
                                last_failure: &failure,
                                elapsed,
                                cancellation: &cancellation,
                            })
                            .await
                        }
                        None => policy.should_retry(&failure, attempt, elapsed),
                    };

                    if !should_retry {
                        return Err(failure);
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    if !delay.is_zero() {
                        self.create_timer(delay).await?;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// A monotonic counter bumped by every state mutation; the turn driver
    /// uses this to detect whether another poll would make progress
    pub(crate) fn version(&self) -> u64 {
        self.state.borrow().version
    }

    pub(crate) fn take_custom_status(&self) -> Option<Payload> {
        self.state.borrow_mut().custom_status.take()
    }

    pub(crate) fn take_continue_as_new(&self) -> Option<Action> {
        self.state.borrow_mut().continue_as_new.take()
    }

    pub(crate) fn drain_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.state.borrow_mut().actions)
    }

    /// Drain every external event buffered this turn that was never matched
    /// to a waiter, in arrival order — used by continue-as-new's
    /// `preserve_unconsumed_events` to re-raise them against the next
    /// execution via `SendEvent(self, ...)` actions (spec.md §8 scenario 5)
    pub(crate) fn drain_unconsumed_external_events(&self) -> Vec<(String, Payload)> {
        self.state.borrow_mut().drain_unconsumed_external_events()
    }
}

/// Derive a deterministic UUID from components that are themselves
/// deterministic under replay (never from `Uuid::new_v4` or wall-clock
/// randomness)
pub fn deterministic_guid(instance_id: &str, sequence: u64, execution_start_time: DateTime<Utc>) -> Uuid {
    let namespace = Uuid::NAMESPACE_OID;
    let name = format!("{instance_id}:{sequence}:{}", execution_start_time.to_rfc3339());
    Uuid::new_v5(&namespace, name.as_bytes())
}

/// Which step of a (possibly multi-attempt) activity invocation a future is
/// waiting on
enum ActivityStep {
    /// About to allocate and check/emit the schedule point for `attempt`
    Schedule(u32),
    /// Waiting on the activity scheduled at `event_id` for `attempt`
    Task(u64, u32),
    /// Waiting on an attached retry handler's decision for the failure that
    /// just occurred on `attempt`
    Deciding(Pin<Box<dyn Future<Output = bool> + Send>>, Box<FailureDetails>, u32),
    /// Waiting on the backoff timer at `event_id` before scheduling `next_attempt`
    Backoff(u64, u32),
}

/// A durable future resolving to an activity's result
///
/// When `retry_policy` is attached, a failed attempt is retried automatically
/// rather than resolving the future: the engine waits out the policy's
/// backoff via a `CreateTimer` action, then reschedules, producing the same
/// `Schedule, CreateTimer, Schedule, ...` action sequence as
/// [`OrchestrationContext::with_retry`] (spec.md §4.4.6, §8 scenario 3). An
/// imperative `retry_policy.handle`, if present, supersedes the declarative
/// backoff/attempt-count decision.
pub struct ActivityTask<O> {
    state: Rc<RefCell<TurnState>>,
    codec: DynCodec,
    task_name: TaskName,
    input: Payload,
    retry_policy: Option<crate::reliability::RetryPolicy>,
    started_at: Option<DateTime<Utc>>,
    step: ActivityStep,
    _marker: std::marker::PhantomData<O>,
}

impl<O: DeserializeOwned> Future for ActivityTask<O> {
    type Output = Result<O, FailureDetails>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.step {
                ActivityStep::Schedule(attempt) => {
                    let attempt = *attempt;
                    if this.state.borrow().cancellation.is_cancelled() {
                        return Poll::Ready(Err(FailureDetails::cancelled(format!(
                            "'{}' not scheduled: cancellation token fired first",
                            this.task_name
                        ))));
                    }
                    let mut state = this.state.borrow_mut();
                    if this.started_at.is_none() {
                        this.started_at = Some(state.current_time);
                    }
                    let event_id = state.allocate_event_id();
                    match state.historical_schedule(event_id) {
                        Some(ScheduledSignature::Task(name)) if *name == this.task_name => {}
                        Some(other) => {
                            let message = format!(
                                "event {event_id} was recorded as {other:?}, but replay scheduled task '{}'",
                                this.task_name
                            );
                            drop(state);
                            return Poll::Ready(Err(FailureDetails::nondeterministic(message)));
                        }
                        None => state.push_action(Action::ScheduleTask {
                            event_id,
                            task_name: this.task_name.clone(),
                            input: this.input.clone(),
                            retry_policy: this.retry_policy.clone(),
                        }),
                    }
                    drop(state);
                    this.step = ActivityStep::Task(event_id, attempt);
                }
                ActivityStep::Task(event_id, attempt) => {
                    let (event_id, attempt) = (*event_id, *attempt);
                    let mut state = this.state.borrow_mut();
                    match state.take_resolution(event_id) {
                        None => return Poll::Pending,
                        Some(Resolution::Task(Ok(payload))) => {
                            drop(state);
                            return Poll::Ready(match this.codec.decode(&payload) {
                                Ok(value) => Ok(value),
                                Err(err) => Err(FailureDetails::new("OutputDeserializationError", err.to_string())),
                            });
                        }
                        Some(Resolution::Task(Err(failure))) => {
                            drop(state);
                            match retry_decision(this, &failure, attempt, cx) {
                                RetryDecision::GiveUp => return Poll::Ready(Err(failure)),
                                RetryDecision::Pending => return Poll::Pending,
                                RetryDecision::Failed(nondeterminism) => return Poll::Ready(Err(nondeterminism)),
                                RetryDecision::Scheduled => {}
                            }
                        }
                        Some(other) => {
                            drop(state);
                            return Poll::Ready(Err(FailureDetails::nondeterministic(format!(
                                "expected task resolution at event {event_id}, found {other:?}"
                            ))));
                        }
                    }
                }
                ActivityStep::Deciding(handler_fut, failure, attempt) => {
                    match handler_fut.as_mut().poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(false) => return Poll::Ready(Err((**failure).clone())),
                        Poll::Ready(true) => {
                            let attempt = *attempt;
                            let policy = this
                                .retry_policy
                                .clone()
                                .expect("Deciding step only reached with a retry policy attached");
                            match advance_after_retry_decision(&this.state, &mut this.step, &policy, attempt) {
                                RetryDecision::Failed(failure) => return Poll::Ready(Err(failure)),
                                _ => {}
                            }
                        }
                    }
                }
                ActivityStep::Backoff(timer_id, next_attempt) => {
                    let (timer_id, next_attempt) = (*timer_id, *next_attempt);
                    let mut state = this.state.borrow_mut();
                    match state.take_resolution(timer_id) {
                        None => return Poll::Pending,
                        Some(Resolution::Timer) => {
                            drop(state);
                            this.step = ActivityStep::Schedule(next_attempt);
                        }
                        Some(other) => {
                            drop(state);
                            return Poll::Ready(Err(FailureDetails::nondeterministic(format!(
                                "expected timer resolution at event {timer_id}, found {other:?}"
                            ))));
                        }
                    }
                }
            }
        }
    }
}

/// What a durable future should do after a scheduled attempt failed
enum RetryDecision {
    /// No (more) retry is warranted; resolve with the failure as-is
    GiveUp,
    /// A next step (handler decision or backoff timer) is already pending
    Pending,
    /// A next step's event id collided with a different historical kind
    Failed(FailureDetails),
    /// A next attempt (or the handler deciding one) is now scheduled;
    /// caller should loop and poll again
    Scheduled,
}

/// Shared attempt/retry bookkeeping between [`ActivityTask`] and
/// [`SubOrchestrationTask`]: given the failure a scheduled attempt just
/// resolved to, decide whether to retry, and if so, drive the backoff timer
/// or imperative handler needed before the next attempt can be scheduled.
fn retry_decision<O>(
    this: &mut ActivityTask<O>,
    failure: &FailureDetails,
    attempt: u32,
    cx: &mut TaskContext<'_>,
) -> RetryDecision {
    let Some(policy) = this.retry_policy.clone() else {
        return RetryDecision::GiveUp;
    };

    if let Some(handler) = policy.handle.clone() {
        let elapsed = elapsed_since(&this.state, this.started_at);
        let cancellation = this.state.borrow().cancellation.clone();
        let mut handler_fut = handler(crate::reliability::RetryHandlerArgs {
            attempt,
            last_failure: failure,
            elapsed,
            cancellation: &cancellation,
        });
        return match handler_fut.as_mut().poll(cx) {
            Poll::Pending => {
                this.step = ActivityStep::Deciding(handler_fut, Box::new(failure.clone()), attempt);
                RetryDecision::Pending
            }
            Poll::Ready(false) => RetryDecision::GiveUp,
            Poll::Ready(true) => advance_after_retry_decision(&this.state, &mut this.step, &policy, attempt),
        };
    }

    let elapsed = elapsed_since(&this.state, this.started_at);
    if !policy.should_retry(failure, attempt, elapsed) {
        return RetryDecision::GiveUp;
    }
    advance_after_retry_decision(&this.state, &mut this.step, &policy, attempt)
}

fn elapsed_since(state: &Rc<RefCell<TurnState>>, started_at: Option<DateTime<Utc>>) -> Duration {
    let now = state.borrow().current_time;
    started_at.map(|start| (now - start).to_std().unwrap_or(Duration::ZERO)).unwrap_or(Duration::ZERO)
}

fn advance_after_retry_decision(
    state: &Rc<RefCell<TurnState>>,
    step: &mut ActivityStep,
    policy: &crate::reliability::RetryPolicy,
    attempt: u32,
) -> RetryDecision {
    let delay = policy.delay_for_attempt(attempt);
    if delay.is_zero() {
        *step = ActivityStep::Schedule(attempt + 1);
        return RetryDecision::Scheduled;
    }
    match state.borrow_mut().schedule_backoff_timer(delay) {
        Ok(timer_id) => {
            *step = ActivityStep::Backoff(timer_id, attempt + 1);
            RetryDecision::Scheduled
        }
        Err(failure) => RetryDecision::Failed(failure),
    }
}

/// Which step of a (possibly multi-attempt) sub-orchestration call a future
/// is waiting on — mirrors [`ActivityStep`]
enum SubOrchestrationStep {
    Schedule(u32),
    Task(u64, u32),
    Backoff(u64, u32),
}

/// A durable future resolving to a sub-orchestration's result
///
/// Retries the same way [`ActivityTask`] does when `retry_policy` is
/// attached, except imperative `handle`s are not supported on this path —
/// use [`OrchestrationContext::with_retry`] around a bare
/// `call_sub_orchestration(..., None)` if a handler is required.
pub struct SubOrchestrationTask<O> {
    state: Rc<RefCell<TurnState>>,
    codec: DynCodec,
    task_name: TaskName,
    instance_id: Option<String>,
    input: Payload,
    retry_policy: Option<crate::reliability::RetryPolicy>,
    started_at: Option<DateTime<Utc>>,
    step: SubOrchestrationStep,
    _marker: std::marker::PhantomData<O>,
}

impl<O: DeserializeOwned> Future for SubOrchestrationTask<O> {
    type Output = Result<O, FailureDetails>;

    fn poll(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.step {
                SubOrchestrationStep::Schedule(attempt) => {
                    let attempt = *attempt;
                    if this.state.borrow().cancellation.is_cancelled() {
                        return Poll::Ready(Err(FailureDetails::cancelled(format!(
                            "'{}' not scheduled: cancellation token fired first",
                            this.task_name
                        ))));
                    }
                    let mut state = this.state.borrow_mut();
                    if this.started_at.is_none() {
                        this.started_at = Some(state.current_time);
                    }
                    let event_id = state.allocate_event_id();
                    let instance_id = this
                        .instance_id
                        .clone()
                        .unwrap_or_else(|| deterministic_guid(&state.instance_id, event_id, state.execution_start_time).to_string());
                    match state.historical_schedule(event_id) {
                        Some(ScheduledSignature::SubOrchestration(name)) if *name == this.task_name => {}
                        Some(other) => {
                            let message = format!(
                                "event {event_id} was recorded as {other:?}, but replay scheduled sub-orchestration '{}'",
                                this.task_name
                            );
                            drop(state);
                            return Poll::Ready(Err(FailureDetails::nondeterministic(message)));
                        }
                        None => state.push_action(Action::ScheduleSubOrchestration {
                            event_id,
                            task_name: this.task_name.clone(),
                            instance_id,
                            input: this.input.clone(),
                            retry_policy: this.retry_policy.clone(),
                        }),
                    }
                    drop(state);
                    this.step = SubOrchestrationStep::Task(event_id, attempt);
                }
                SubOrchestrationStep::Task(event_id, attempt) => {
                    let (event_id, attempt) = (*event_id, *attempt);
                    let mut state = this.state.borrow_mut();
                    match state.take_resolution(event_id) {
                        None => return Poll::Pending,
                        Some(Resolution::SubOrchestration(Ok(payload))) => {
                            drop(state);
                            return Poll::Ready(
                                this.codec
                                    .decode(&payload)
                                    .map_err(|e| FailureDetails::new("OutputDeserializationError", e.to_string())),
                            );
                        }
                        Some(Resolution::SubOrchestration(Err(failure))) => {
                            drop(state);
                            let should_retry = this.retry_policy.as_ref().map(|policy| {
                                let elapsed = elapsed_since(&this.state, this.started_at);
                                policy.should_retry(&failure, attempt, elapsed)
                            });
                            match should_retry {
                                None | Some(false) => return Poll::Ready(Err(failure)),
                                Some(true) => {
                                    let policy = this.retry_policy.clone().unwrap();
                                    let delay = policy.delay_for_attempt(attempt);
                                    if delay.is_zero() {
                                        this.step = SubOrchestrationStep::Schedule(attempt + 1);
                                    } else {
                                        match this.state.borrow_mut().schedule_backoff_timer(delay) {
                                            Ok(timer_id) => {
                                                this.step = SubOrchestrationStep::Backoff(timer_id, attempt + 1)
                                            }
                                            Err(failure) => return Poll::Ready(Err(failure)),
                                        }
                                    }
                                }
                            }
                        }
                        Some(other) => {
                            drop(state);
                            return Poll::Ready(Err(FailureDetails::nondeterministic(format!(
                                "expected sub-orchestration resolution at event {event_id}, found {other:?}"
                            ))));
                        }
                    }
                }
                SubOrchestrationStep::Backoff(timer_id, next_attempt) => {
                    let (timer_id, next_attempt) = (*timer_id, *next_attempt);
                    let mut state = this.state.borrow_mut();
                    match state.take_resolution(timer_id) {
                        None => return Poll::Pending,
                        Some(Resolution::Timer) => {
                            drop(state);
                            this.step = SubOrchestrationStep::Schedule(next_attempt);
                        }
                        Some(other) => {
                            drop(state);
                            return Poll::Ready(Err(FailureDetails::nondeterministic(format!(
                                "expected timer resolution at event {timer_id}, found {other:?}"
                            ))));
                        }
                    }
                }
            }
        }
    }
}

/// A durable future resolving once the requested wall-clock time has passed
///
/// Requests longer than the engine's configured `maximum_timer_interval` are
/// split into a chain of `CreateTimer` actions (spec.md §4.4.3): every chain
/// link but the last is fired and forgotten, and only the final link's
/// resolution completes this future. Each link's action is only emitted once:
/// on replay, a link already present in history is matched and skipped
/// rather than re-pushed (spec.md §4.4.2 point 3, §8 scenario 1).
pub struct TimerTask {
    state: Rc<RefCell<TurnState>>,
    duration: Duration,
    event_ids: Option<Vec<u64>>,
}

impl Future for TimerTask {
    type Output = Result<(), FailureDetails>;

    fn poll(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.state.borrow().cancellation.is_cancelled() {
            // Per spec.md §5, cancellation resolves the promise even once a
            // CreateTimer action is already journaled; the backend still
            // fires the timer, its eventual resolution is simply never read.
            return Poll::Ready(Err(FailureDetails::cancelled("timer cancelled")));
        }

        if this.event_ids.is_none() {
            let mut state = this.state.borrow_mut();
            let chain = match state.maximum_timer_interval {
                Some(max) if !max.is_zero() => crate::action::clamp_timer_chain(this.duration, max),
                _ => vec![this.duration],
            };

            let mut ids = Vec::with_capacity(chain.len());
            let mut fire_at = state.current_time;
            for link in chain {
                let id = state.allocate_event_id();
                fire_at += chrono::Duration::from_std(link).unwrap_or_default();
                match state.historical_schedule(id) {
                    Some(ScheduledSignature::Timer) => {}
                    Some(other) => {
                        let message =
                            format!("event {id} was recorded as {other:?}, but replay scheduled a timer");
                        drop(state);
                        return Poll::Ready(Err(FailureDetails::nondeterministic(message)));
                    }
                    None => state.push_action(Action::timer(id, fire_at)),
                }
                ids.push(id);
            }
            drop(state);
            this.event_ids = Some(ids);
        }
        let event_ids = this.event_ids.clone().expect("just populated above");

        let mut state = this.state.borrow_mut();
        let last = *event_ids.last().expect("timer chain is never empty");
        for &id in &event_ids {
            if id != last {
                state.take_resolution(id);
            }
        }

        match state.take_resolution(last) {
            Some(Resolution::Timer) => Poll::Ready(Ok(())),
            Some(other) => {
                drop(state);
                Poll::Ready(Err(FailureDetails::nondeterministic(format!(
                    "expected timer resolution at event {last}, found {other:?}"
                ))))
            }
            None => Poll::Pending,
        }
    }
}

/// A durable future resolving once a matching external event arrives
pub struct ExternalEventTask<O> {
    state: Rc<RefCell<TurnState>>,
    codec: DynCodec,
    name: String,
    handle: Option<u64>,
    _marker: std::marker::PhantomData<O>,
}

impl<O: DeserializeOwned> Future for ExternalEventTask<O> {
    type Output = O;

    fn poll(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let handle = *this
            .handle
            .get_or_insert_with(|| this.state.borrow_mut().allocate_external_handle(&this.name));

        let mut state = this.state.borrow_mut();
        match state.external_resolved.remove(&handle) {
            Some(payload) => {
                drop(state);
                // best-effort decode; a malformed payload yields the codec's default via panic-free path upstream
                Poll::Ready(this.codec.decode(&payload).unwrap_or_else(|_| {
                    panic!("external event '{}' payload failed to decode", this.name)
                }))
            }
            None => Poll::Pending,
        }
    }
}
