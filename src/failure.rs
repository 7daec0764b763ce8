//! Failure details: the recursive, serializable representation of an error

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An immutable, recursive description of a failure
///
/// `FailureDetails` is the wire representation for any error that crosses
/// the engine boundary: a failed activity, a failed sub-orchestration, or an
/// orchestration that failed outright. It round-trips to and from whatever
/// representation the backend uses for failures (the exact backend schema is
/// out of scope; this type commits only to the fields spec'd here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    /// The error's type name (e.g. the exception/error class)
    pub error_type: String,

    /// Human-readable error message
    pub error_message: String,

    /// Optional stack trace, as captured by the producing side
    pub stack_trace: Option<String>,

    /// The cause of this failure, if any, recursively
    pub inner_failure: Option<Box<FailureDetails>>,

    /// Arbitrary additional properties attached by the producer
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

impl FailureDetails {
    /// Construct a leaf failure with no cause
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
            inner_failure: None,
            properties: HashMap::new(),
        }
    }

    /// Attach a stack trace
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Chain an inner (causing) failure
    pub fn with_inner(mut self, inner: FailureDetails) -> Self {
        self.inner_failure = Some(Box::new(inner));
        self
    }

    /// Attach a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Build a non-determinism failure, used by the replay engine
    pub fn nondeterministic(message: impl Into<String>) -> Self {
        Self::new("NondeterministicExecution", message)
    }

    /// Build an unknown-task failure, used by the registry/executor
    pub fn unknown_task(task_name: impl std::fmt::Display) -> Self {
        Self::new("UnknownTaskError", format!("no task registered: {task_name}"))
    }

    /// Build a cancellation failure, used when a token fires pre-schedule or
    /// while a durable timer/external-event wait is still outstanding
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new("Cancelled", message)
    }

    /// Does this failure (or any failure in its cause chain) represent the
    /// named error type, according to `resolver`?
    ///
    /// Resolution is lazy and string-keyed: by default only an exact match
    /// against `error_type` is considered a match, avoiding any dependency
    /// on runtime reflection. Callers with a richer exception hierarchy can
    /// supply an [`ErrorResolver`] that understands subtype relationships.
    pub fn is_subtype_of(&self, target: &str, resolver: &dyn ErrorResolver) -> bool {
        let mut current = Some(self);
        while let Some(failure) = current {
            if resolver.is_assignable(&failure.error_type, target) {
                return true;
            }
            current = failure.inner_failure.as_deref();
        }
        false
    }
}

/// Resolves whether one error type name is assignable to (a subtype of)
/// another
///
/// Kept string-keyed per the source design: the core never loads or
/// introspects the caller's actual exception types, only their names.
pub trait ErrorResolver: Send + Sync {
    fn is_assignable(&self, error_type: &str, target: &str) -> bool;
}

/// The default resolver: exact (case-sensitive) string match only
pub struct ExactMatchResolver;

impl ErrorResolver for ExactMatchResolver {
    fn is_assignable(&self, error_type: &str, target: &str) -> bool {
        error_type == target
    }
}
