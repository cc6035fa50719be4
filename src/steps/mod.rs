//! Step executors.
//!
//! Each step kind has one executor behind the [`StepExecutor`] trait. The kind
//! enum is closed, so dispatch goes through a static table instead of a runtime
//! string registry.

pub mod compare_runs;
pub mod extract_evidence;
pub mod hypothesis;
pub mod targeted;
pub mod validate;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Instant;

use crate::context::{ExecutionContext, SpawnAction, StepMetrics};
use crate::error::ChainError;
use crate::lenient;
use crate::llm::{round_to, LlmBackend, LlmCall};

pub use compare_runs::{CompareRuns, CompareRunsOutput, RunDeltas, RunMetric};
pub use extract_evidence::{Evidence, EvidenceOutput, ExtractEvidence};
pub use hypothesis::{HypothesisGeneration, HypothesisOutput};
pub use targeted::{AnalysisOutput, TargetedAnalysis};
pub use validate::{SupportExample, ValidateHypothesis, ValidationOutput};

/// The five kinds of chain step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    CompareRuns,
    ExtractEvidence,
    HypothesisGeneration,
    ValidateHypothesis,
    TargetedAnalysis,
}

static COMPARE_RUNS: CompareRuns = CompareRuns;
static EXTRACT_EVIDENCE: ExtractEvidence = ExtractEvidence;
static HYPOTHESIS_GENERATION: HypothesisGeneration = HypothesisGeneration;
static VALIDATE_HYPOTHESIS: ValidateHypothesis = ValidateHypothesis;
static TARGETED_ANALYSIS: TargetedAnalysis = TargetedAnalysis;

impl StepKind {
    pub const ALL: [StepKind; 5] = [
        StepKind::CompareRuns,
        StepKind::ExtractEvidence,
        StepKind::HypothesisGeneration,
        StepKind::ValidateHypothesis,
        StepKind::TargetedAnalysis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::CompareRuns => "compare_runs",
            StepKind::ExtractEvidence => "extract_evidence",
            StepKind::HypothesisGeneration => "hypothesis_generation",
            StepKind::ValidateHypothesis => "validate_hypothesis",
            StepKind::TargetedAnalysis => "targeted_analysis",
        }
    }

    /// Executor registered for this kind
    pub fn executor(self) -> &'static dyn StepExecutor {
        match self {
            StepKind::CompareRuns => &COMPARE_RUNS,
            StepKind::ExtractEvidence => &EXTRACT_EVIDENCE,
            StepKind::HypothesisGeneration => &HYPOTHESIS_GENERATION,
            StepKind::ValidateHypothesis => &VALIDATE_HYPOTHESIS,
            StepKind::TargetedAnalysis => &TARGETED_ANALYSIS,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific output of a step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepOutput {
    CompareRuns(CompareRunsOutput),
    Evidence(EvidenceOutput),
    Hypotheses(HypothesisOutput),
    Validation(ValidationOutput),
    Analysis(AnalysisOutput),
}

impl StepOutput {
    /// Evidence items later steps can build on
    pub fn evidence_values(&self) -> Vec<Value> {
        match self {
            StepOutput::Evidence(out) => out
                .evidence
                .iter()
                .filter_map(|e| serde_json::to_value(e).ok())
                .collect(),
            StepOutput::Validation(out) => {
                out.evidence.iter().cloned().map(Value::String).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn conclusion(&self) -> Option<&str> {
        match self {
            StepOutput::Analysis(out) => Some(out.conclusion.as_str()),
            _ => None,
        }
    }

    pub fn rationale(&self) -> Option<&str> {
        match self {
            StepOutput::Hypotheses(out) => Some(out.rationale.as_str()),
            _ => None,
        }
    }
}

/// What an executor hands back; the runner stamps identity onto it
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub output: StepOutput,
    pub confidence: f64,
    pub continue_flag: bool,
    pub spawn_actions: Vec<SpawnAction>,
    pub prompt: String,
    pub model_response: String,
    pub metrics: StepMetrics,
}

impl StepOutcome {
    /// Outcome of a step that made no model call
    pub fn deterministic(
        output: StepOutput,
        confidence: f64,
        continue_flag: bool,
        started: Instant,
    ) -> Self {
        Self {
            output,
            confidence: clamp_confidence(confidence),
            continue_flag,
            spawn_actions: Vec::new(),
            prompt: String::new(),
            model_response: String::new(),
            metrics: StepMetrics {
                elapsed_sec: elapsed_since(started),
                tokens: 0,
                cost_est: 0.0,
                model: None,
            },
        }
    }

    /// Outcome of a step backed by one model call
    pub fn from_call(
        output: StepOutput,
        confidence: f64,
        continue_flag: bool,
        prompt: String,
        call: LlmCall,
        started: Instant,
    ) -> Self {
        Self {
            output,
            confidence: clamp_confidence(confidence),
            continue_flag,
            spawn_actions: Vec::new(),
            prompt,
            model_response: call.raw,
            metrics: StepMetrics {
                elapsed_sec: elapsed_since(started),
                tokens: call.tokens,
                cost_est: call.cost_est.max(0.0),
                model: Some(call.model),
            },
        }
    }

    pub fn with_spawn_actions(mut self, actions: Vec<SpawnAction>) -> Self {
        self.spawn_actions = actions;
        self
    }
}

/// Uniform contract every step kind implements
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn kind(&self) -> StepKind;

    /// Run the step against the context. Deterministic steps ignore `llm`.
    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ExecutionContext,
        llm: &dyn LlmBackend,
    ) -> Result<StepOutcome, ChainError>;
}

pub(crate) fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

pub(crate) fn elapsed_since(started: Instant) -> f64 {
    round_to(started.elapsed().as_secs_f64(), 4)
}

/// Parse a step's free-form params into its typed parameter struct
pub(crate) fn parse_params<T: DeserializeOwned>(
    kind: StepKind,
    params: &Map<String, Value>,
) -> Result<T, ChainError> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| ChainError::InvalidParams {
        step: kind.to_string(),
        message: e.to_string(),
    })
}

/// Read a numeric model field, accepting numbers and numeric strings
pub(crate) fn payload_number(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(lenient::as_f64)
}

/// Read a list of non-empty strings from a model field
pub(crate) fn payload_strings(payload: &Map<String, Value>, key: &str) -> Vec<String> {
    match payload.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string().trim().to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn payload_text(payload: &Map<String, Value>, key: &str) -> String {
    match payload.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_wire_names() {
        for kind in StepKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
            let back: StepKind = serde_json::from_value(json).unwrap();
            assert_eq!(back, kind);
        }
        assert!(serde_json::from_value::<StepKind>(serde_json::json!("summarize")).is_err());
    }

    #[test]
    fn test_executor_table_matches_kind() {
        for kind in StepKind::ALL {
            assert_eq!(kind.executor().kind(), kind);
        }
    }

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }

    #[test]
    fn test_payload_helpers() {
        let payload = crate::llm::extract_json_payload(
            r#"{"confidence": "0.7", "items": [" a ", "", 3], "note": null}"#,
        );
        assert_eq!(payload_number(&payload, "confidence"), Some(0.7));
        assert_eq!(payload_number(&payload, "missing"), None);
        assert_eq!(payload_strings(&payload, "items"), vec!["a", "3"]);
        assert_eq!(payload_text(&payload, "note"), "");
    }
}
