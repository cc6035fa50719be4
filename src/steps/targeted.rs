use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

use super::{
    parse_params, payload_number, payload_strings, payload_text, StepExecutor, StepKind,
    StepOutcome, StepOutput,
};
use crate::context::ExecutionContext;
use crate::error::ChainError;
use crate::lenient;
use crate::llm::LlmBackend;

const DEFAULT_OBJECTIVE: &str = "Provide focused analysis and next steps.";
const MAX_PROMPT_EVIDENCE: usize = 10;
const MAX_NEXT_STEPS: usize = 5;

#[derive(Debug, Default, Deserialize)]
struct Params {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    objective: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisOutput {
    pub conclusion: String,
    pub recommended_next_steps: Vec<String>,
}

/// Synthesizes prior evidence into a conclusion and next steps
pub struct TargetedAnalysis;

#[async_trait]
impl StepExecutor for TargetedAnalysis {
    fn kind(&self) -> StepKind {
        StepKind::TargetedAnalysis
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ExecutionContext,
        llm: &dyn LlmBackend,
    ) -> Result<StepOutcome, ChainError> {
        let started = Instant::now();
        let params: Params = parse_params(self.kind(), params)?;
        let objective = params
            .objective
            .filter(|o| !o.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OBJECTIVE.to_string());

        let evidence: Vec<Value> = ctx
            .prior_evidence()
            .into_iter()
            .take(MAX_PROMPT_EVIDENCE)
            .collect();

        let prompt = format!(
            "You are performing a focused, deterministic analysis. Return JSON keys: conclusion (string), \
             recommended_next_steps (array of strings), confidence (0..1).\n\
             Objective: {}\n\
             Evidence: {}",
            objective,
            Value::Array(evidence)
        );
        let call = llm.call_json(&prompt).await?;

        let mut next_steps = payload_strings(&call.payload, "recommended_next_steps");
        next_steps.truncate(MAX_NEXT_STEPS);
        let mut conclusion = payload_text(&call.payload, "conclusion");
        if conclusion.is_empty() {
            conclusion = payload_text(&call.payload, "analysis");
        }
        let confidence = payload_number(&call.payload, "confidence").unwrap_or(if conclusion.is_empty() {
            0.2
        } else {
            0.55
        });

        let continue_flag = !conclusion.is_empty();
        let output = StepOutput::Analysis(AnalysisOutput {
            conclusion,
            recommended_next_steps: next_steps,
        });
        Ok(StepOutcome::from_call(
            output,
            confidence,
            continue_flag,
            prompt,
            call,
            started,
        ))
    }
}
