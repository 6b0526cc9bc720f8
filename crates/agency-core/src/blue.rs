//! The "Blue" batch descriptor: the concrete, per-batch job handed to the
//! in-container agent, and the translator contract that turns a RED-style
//! experiment plus a secret-filled batch into exactly one Blue batch.
//!
//! RED's schema is an external collaborator; this module only carries the
//! parts of the contract the controller itself depends on: well-known
//! in-container paths and the translator's single-output invariant.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{Batch, Experiment};

/// Path of the embedded agent binary inside the container, mirroring the
/// original's `CC_DIR`-relative convention.
pub const BLUE_AGENT_PATH: &str = "/cc/blue_agent.py";
/// Path of the serialized descriptor the agent reads on startup.
pub const BLUE_DESCRIPTOR_PATH: &str = "/cc/blue_file.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueBatch {
    pub batch_id: String,
    pub cli: Value,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("translator produced {0} batches, expected exactly 1")]
    NotExactlyOne(usize),
    #[error("translation failed: {0}")]
    Failed(String),
}

pub trait BlueTranslator: Send + Sync {
    fn translate(&self, experiment: &Experiment, batch: &Batch) -> Result<Vec<BlueBatch>, TranslationError>;
}

/// Translates a batch whose secrets have already been filled into its
/// connector descriptors into a single Blue batch carrying the experiment's
/// command line alongside the batch's own inputs/outputs.
pub struct DefaultBlueTranslator;

impl BlueTranslator for DefaultBlueTranslator {
    fn translate(&self, experiment: &Experiment, batch: &Batch) -> Result<Vec<BlueBatch>, TranslationError> {
        Ok(vec![BlueBatch {
            batch_id: batch._id.to_hex(),
            cli: experiment.cli.clone(),
            inputs: batch.inputs.clone(),
            outputs: batch.outputs.clone(),
        }])
    }
}

/// Runs `translator` and enforces the single-batch-out invariant; a
/// translator yielding anything but one batch is a programmer error and
/// must fail the batch non-retryably.
pub fn translate_single(
    translator: &dyn BlueTranslator,
    experiment: &Experiment,
    batch: &Batch,
) -> Result<BlueBatch, TranslationError> {
    let mut batches = translator.translate(experiment, batch)?;
    if batches.len() != 1 {
        return Err(TranslationError::NotExactlyOne(batches.len()));
    }
    Ok(batches.remove(0))
}

/// The JSON object the in-container agent prints to stdout on exit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentCallback {
    pub state: AgentCallbackState,
    #[serde(default, rename = "debugInfo", skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCallbackState {
    Succeeded,
    Failed,
}

/// Parses and validates the agent's stdout payload against the
/// agent-callback schema (`state ∈ {succeeded, failed}`).
pub fn parse_agent_callback(stdout: &[u8]) -> Result<AgentCallback, String> {
    let text = std::str::from_utf8(stdout).map_err(|e| format!("stdout is not valid UTF-8: {e}"))?;
    serde_json::from_str(text).map_err(|e| format!("stdout does not match the agent-callback schema: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_callback_parses() {
        let cb = parse_agent_callback(br#"{"state":"succeeded"}"#).unwrap();
        assert_eq!(cb.state, AgentCallbackState::Succeeded);
    }

    #[test]
    fn invalid_state_is_rejected() {
        assert!(parse_agent_callback(br#"{"state":"unknown"}"#).is_err());
    }

    #[test]
    fn non_utf8_is_rejected() {
        assert!(parse_agent_callback(&[0xff, 0xfe]).is_err());
    }
}
