//! Registry: type-erased lookup from task name to orchestration/activity
//! implementation
//!
//! Mirrors the teacher's `WorkflowRegistry` (see
//! `examples/everruns-everruns/crates/durable/src/engine/registry.rs`):
//! register once by concrete type, look up by name through a type-erased
//! trait object. Split in two here because orchestrations and activities
//! have different execution shapes (turn-polled vs. run-to-completion) and
//! are looked up by two different executors.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, LocalBoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::activity::{Activity, ActivityContext, ActivityError, AnyActivity};
use crate::codec::{Codec, DynCodec};
use crate::context::OrchestrationContext;
use crate::orchestration::{Orchestration, OrchestrationFailure};
use crate::payload::Payload;
use crate::task_name::TaskName;

/// An activity registered as a bare closure rather than a named `Activity`
/// impl — no attribute/reflection surface, so the name must be given
/// explicitly at registration time.
struct DelegateActivity<I, O> {
    task_name: TaskName,
    handler: Arc<dyn Fn(ActivityContext, I) -> BoxFuture<'static, Result<O, ActivityError>> + Send + Sync>,
}

#[async_trait]
impl<I, O> AnyActivity for DelegateActivity<I, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    fn task_name(&self) -> &TaskName {
        &self.task_name
    }

    async fn invoke(&self, ctx: &ActivityContext, input: &Payload, codec: &dyn Codec) -> crate::activity::ActivityOutcome {
        use crate::activity::ActivityOutcome;
        use crate::failure::FailureDetails;

        let typed_input: I = match codec.decode(input) {
            Ok(value) => value,
            Err(err) => {
                return ActivityOutcome::Failed(FailureDetails::new("InputDeserializationError", err.to_string()))
            }
        };

        match (self.handler)(ctx.clone(), typed_input).await {
            Ok(output) => match codec.encode(&output) {
                Ok(payload) => ActivityOutcome::Completed(payload),
                Err(err) => ActivityOutcome::Failed(FailureDetails::new("OutputSerializationError", err.to_string())),
            },
            Err(err) => ActivityOutcome::Failed(err.into_failure_details()),
        }
    }
}

/// Errors from registration or lookup
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task name already registered: {0}")]
    AlreadyRegistered(TaskName),
}

/// A type-erased orchestration, produced by the registry
pub trait AnyOrchestration: Send + Sync {
    fn task_name(&self) -> &TaskName;

    fn run(
        &self,
        ctx: OrchestrationContext,
        input: Payload,
        codec: DynCodec,
    ) -> LocalBoxFuture<'static, Result<Payload, OrchestrationFailure>>;
}

struct OrchestrationWrapper<W> {
    task_name: TaskName,
    inner: Arc<W>,
}

impl<W> AnyOrchestration for OrchestrationWrapper<W>
where
    W: Orchestration,
{
    fn task_name(&self) -> &TaskName {
        &self.task_name
    }

    fn run(
        &self,
        ctx: OrchestrationContext,
        input: Payload,
        codec: DynCodec,
    ) -> LocalBoxFuture<'static, Result<Payload, OrchestrationFailure>> {
        let inner = self.inner.clone();
        let decoded: Result<W::Input, _> = codec.decode(&input);
        Box::pin(async move {
            let typed_input = decoded.map_err(|e| {
                OrchestrationFailure::new("InputDeserializationError", e.to_string())
            })?;
            let output = inner.run(ctx, typed_input).await?;
            codec
                .encode(&output)
                .map_err(|e| OrchestrationFailure::new("OutputSerializationError", e.to_string()))
        })
    }
}

/// Write-once registry of orchestration and activity implementations
///
/// A name may be registered exactly once; registering it again is a
/// programmer error surfaced as [`RegistryError::AlreadyRegistered`] rather
/// than silently overwriting the prior definition, since a silent overwrite
/// would itself be a nondeterminism hazard across redeploys.
pub struct Registry {
    orchestrations: HashMap<TaskName, Arc<dyn AnyOrchestration>>,
    activities: HashMap<TaskName, Arc<dyn AnyActivity>>,
    // Entities are out of scope; the map stays empty so a caller that looks
    // one up gets a clean `None` rather than a missing API.
    entities: HashMap<TaskName, ()>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            orchestrations: HashMap::new(),
            activities: HashMap::new(),
            entities: HashMap::new(),
        }
    }

    /// Register an activity by an explicit name and a bare closure, for
    /// callers with no concrete `Activity`-implementing type
    pub fn register_activity_fn<I, O, F, Fut>(
        &mut self,
        name: impl Into<TaskName>,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        let task_name: TaskName = name.into();
        if self.activities.contains_key(&task_name) {
            return Err(RegistryError::AlreadyRegistered(task_name));
        }
        self.activities.insert(
            task_name.clone(),
            Arc::new(DelegateActivity {
                task_name,
                handler: Arc::new(move |ctx, input| Box::pin(handler(ctx, input))),
            }),
        );
        Ok(())
    }

    /// Is an entity of this name registered?
    ///
    /// Entities are out of scope for this core; the map is always empty, so
    /// this always reports `false`. It exists so callers checking for one
    /// get a defined answer rather than a missing method.
    pub fn contains_entity(&self, task_name: &TaskName) -> bool {
        self.entities.contains_key(task_name)
    }

    pub fn register_orchestration<W: Orchestration>(&mut self, orchestration: W) -> Result<(), RegistryError> {
        self.register_orchestration_arc(Arc::new(orchestration))
    }

    /// Register a pre-built, shared orchestration instance
    ///
    /// Equivalent to [`Registry::register_orchestration`] but for callers
    /// that already hold an `Arc<W>` (e.g. one shared across registries, or
    /// built with non-trivial construction) rather than a bare value.
    pub fn register_orchestration_arc<W: Orchestration>(&mut self, orchestration: Arc<W>) -> Result<(), RegistryError> {
        let task_name = TaskName::new(W::TYPE);
        if self.orchestrations.contains_key(&task_name) {
            return Err(RegistryError::AlreadyRegistered(task_name));
        }
        self.orchestrations.insert(
            task_name.clone(),
            Arc::new(OrchestrationWrapper {
                task_name,
                inner: orchestration,
            }),
        );
        Ok(())
    }

    pub fn register_activity<A: Activity>(&mut self, activity: A) -> Result<(), RegistryError> {
        let task_name = TaskName::new(A::TYPE);
        if self.activities.contains_key(&task_name) {
            return Err(RegistryError::AlreadyRegistered(task_name));
        }
        self.activities.insert(
            task_name.clone(),
            Arc::new(crate::activity::ActivityWrapper {
                task_name,
                activity: Arc::new(activity),
            }),
        );
        Ok(())
    }

    pub fn lookup_orchestration(&self, task_name: &TaskName) -> Option<Arc<dyn AnyOrchestration>> {
        self.orchestrations.get(task_name).cloned()
    }

    pub fn lookup_activity(&self, task_name: &TaskName) -> Option<Arc<dyn AnyActivity>> {
        self.activities.get(task_name).cloned()
    }

    pub fn contains_orchestration(&self, task_name: &TaskName) -> bool {
        self.orchestrations.contains_key(task_name)
    }

    pub fn contains_activity(&self, task_name: &TaskName) -> bool {
        self.activities.contains_key(task_name)
    }

    pub fn orchestration_names(&self) -> impl Iterator<Item = &TaskName> {
        self.orchestrations.keys()
    }

    pub fn activity_names(&self) -> impl Iterator<Item = &TaskName> {
        self.activities.keys()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("orchestrations", &self.orchestrations.keys().collect::<Vec<_>>())
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}
