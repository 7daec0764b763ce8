//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::failure::FailureDetails;

use super::ActivityContext;

/// Error type for activity failures
///
/// An `ActivityError` is the in-process error an activity implementation
/// raises; the executor converts it to a [`FailureDetails`] before it ever
/// crosses into history.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityError {
    pub message: String,
    pub error_type: Option<String>,
    pub retryable: bool,
    pub details: Option<String>,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Convert into the wire representation the engine journals
    pub fn into_failure_details(self) -> FailureDetails {
        let mut failure = FailureDetails::new(
            self.error_type.unwrap_or_else(|| "ActivityError".to_string()),
            self.message,
        );
        if let Some(details) = self.details {
            failure = failure.with_property("details", details);
        }
        failure = failure.with_property("retryable", self.retryable.to_string());
        failure
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An activity is a unit of work invoked by name from an orchestration
///
/// # Example
///
/// ```ignore
/// struct SendEmail;
///
/// #[async_trait]
/// impl Activity for SendEmail {
///     const TYPE: &'static str = "SendEmail";
///     type Input = SendEmailInput;
///     type Output = SendEmailOutput;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         Ok(SendEmailOutput { message_id: "...".into() })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier, looked up in the registry
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// Return `ActivityError::retryable` for transient failures, or
    /// `ActivityError::non_retryable` for permanent ones.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
