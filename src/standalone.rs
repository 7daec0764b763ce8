//! Side-effect-free call boundary for stateless hosts: decode a turn
//! request, run one [`ReplayEngine`] turn, re-encode the response
//!
//! Shaped like the teacher's `WorkflowExecutor::process_workflow` (load
//! state, run one pass, return a result) with "load from store" swapped for
//! "decode request bytes," since this crate has no store of its own.

use std::sync::Arc;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::Action;
use crate::codec::DynCodec;
use crate::engine::{EngineConfig, ReplayEngine, TerminalOutcome};
use crate::failure::FailureDetails;
use crate::history::HistoryEvent;
use crate::payload::Payload;
use crate::registry::Registry;
use crate::task_name::TaskName;

#[derive(Debug, Error)]
pub enum StandaloneError {
    #[error("request is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("request is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TurnRequest {
    instance_id: String,
    task_name: TaskName,
    #[serde(default)]
    history_before: Vec<HistoryEvent>,
    #[serde(default)]
    new_events: Vec<HistoryEvent>,
    #[serde(default)]
    input: Payload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TurnResponse {
    actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_status: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    terminal_outcome: Option<TerminalOutcomeWire>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TerminalOutcomeWire {
    Completed { output: Payload },
    Failed { failure: FailureDetails },
}

impl From<TerminalOutcome> for TerminalOutcomeWire {
    fn from(outcome: TerminalOutcome) -> Self {
        match outcome {
            TerminalOutcome::Completed(output) => TerminalOutcomeWire::Completed { output },
            TerminalOutcome::Failed(failure) => TerminalOutcomeWire::Failed { failure },
        }
    }
}

/// Decode a base64-encoded `{instanceId, taskName, historyBefore, newEvents,
/// input}` request, run exactly one orchestration turn against `registry`,
/// and return a base64-encoded `{actions, customStatus, terminalOutcome}`
/// response
pub async fn run_orchestration(
    request_b64: &str,
    registry: Arc<Registry>,
) -> Result<String, StandaloneError> {
    run_orchestration_with(request_b64, registry, DynCodec::default(), EngineConfig::default()).await
}

/// Like [`run_orchestration`], with an explicit codec and engine configuration
pub async fn run_orchestration_with(
    request_b64: &str,
    registry: Arc<Registry>,
    codec: DynCodec,
    config: EngineConfig,
) -> Result<String, StandaloneError> {
    let request_bytes = base64::engine::general_purpose::STANDARD.decode(request_b64)?;
    let request: TurnRequest = serde_json::from_slice(&request_bytes)?;

    let engine = ReplayEngine::new(registry).with_codec(codec).with_config(config);
    let output = engine
        .run_turn(
            &request.instance_id,
            &request.task_name,
            &request.history_before,
            &request.new_events,
            request.input,
        )
        .await;

    let response = TurnResponse {
        actions: output.actions,
        custom_status: output.custom_status,
        terminal_outcome: output.terminal_outcome.map(Into::into),
    };

    let response_bytes = serde_json::to_vec(&response)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(response_bytes))
}
