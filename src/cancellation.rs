//! Cooperative cancellation
//!
//! The engine never forcibly aborts a durable future. Cancellation is a
//! token the caller can observe: checked before a schedule call (producing
//! an immediate `Cancelled` resolution with no action emitted) and between
//! retry attempts, per spec.md §5.

pub use tokio_util::sync::CancellationToken;
