//! Reliability patterns for durable execution
//!
//! - [`RetryPolicy`] - configurable retry with exponential backoff

pub(crate) mod retry;

pub use retry::{RetryHandler, RetryHandlerArgs, RetryPolicy};
