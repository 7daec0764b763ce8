//! The replay engine: drives one orchestration turn to its fixed point
//!
//! Grounded on the teacher's `WorkflowExecutor` (see
//! `examples/everruns-everruns/crates/durable/src/engine/executor.rs`): this
//! keeps its responsibility (take history + new events, produce actions)
//! and its configuration/error shape, but replaces callback dispatch with
//! the async/await driver in [`crate::context`].

mod replay;

pub use replay::{EngineConfig, ReplayEngine, TerminalOutcome, TurnOutput};
