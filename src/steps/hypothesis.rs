use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::debug;

use super::{
    parse_params, payload_number, payload_strings, payload_text, StepExecutor, StepKind,
    StepOutcome, StepOutput,
};
use crate::context::{ExecutionContext, SpawnAction};
use crate::error::ChainError;
use crate::lenient;
use crate::llm::LlmBackend;

const DEFAULT_TOP_K: usize = 3;
const DEFAULT_SPAWN_TOP_N: usize = 2;
const MAX_PROMPT_EVIDENCE: usize = 8;

#[derive(Debug, Default, Deserialize)]
struct Params {
    #[serde(default, deserialize_with = "lenient::opt_usize")]
    top_k: Option<usize>,
    #[serde(default, deserialize_with = "lenient::opt_usize")]
    spawn_top_n: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HypothesisOutput {
    pub hypotheses: Vec<String>,
    pub rationale: String,
    pub evidence_count: usize,
}

/// Asks the model for root-cause hypotheses grounded in earlier evidence
pub struct HypothesisGeneration;

fn build_prompt(evidence: &[Value], top_k: usize) -> String {
    format!(
        "You are an investigative analyst. Return JSON with keys: hypotheses (array of strings), \
         confidence (0..1), rationale (string).\n\
         Generate concise root-cause hypotheses grounded in this evidence:\n\
         {}\n\
         Limit hypotheses to top {}.",
        Value::Array(evidence.to_vec()),
        top_k
    )
}

#[async_trait]
impl StepExecutor for HypothesisGeneration {
    fn kind(&self) -> StepKind {
        StepKind::HypothesisGeneration
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ExecutionContext,
        llm: &dyn LlmBackend,
    ) -> Result<StepOutcome, ChainError> {
        let started = Instant::now();
        let params: Params = parse_params(self.kind(), params)?;
        let top_k = params.top_k.filter(|k| *k > 0).unwrap_or(DEFAULT_TOP_K);
        let spawn_top_n = params.spawn_top_n.unwrap_or(DEFAULT_SPAWN_TOP_N);

        let evidence: Vec<Value> = ctx
            .prior_evidence()
            .into_iter()
            .filter(Value::is_object)
            .take(MAX_PROMPT_EVIDENCE)
            .collect();

        let prompt = build_prompt(&evidence, top_k);
        let call = llm.call_json(&prompt).await?;

        let mut hypotheses = payload_strings(&call.payload, "hypotheses");
        hypotheses.truncate(top_k);
        let model_confidence = payload_number(&call.payload, "confidence").unwrap_or(0.0);
        let confidence = if model_confidence > 0.0 {
            model_confidence
        } else if hypotheses.is_empty() {
            0.2
        } else {
            0.55
        };
        let rationale = payload_text(&call.payload, "rationale");

        let spawn_actions: Vec<SpawnAction> = hypotheses
            .iter()
            .take(spawn_top_n)
            .map(|h| {
                let mut params = Map::new();
                params.insert("hypothesis".to_string(), Value::String(h.clone()));
                SpawnAction {
                    id: None,
                    kind: StepKind::ValidateHypothesis,
                    params,
                }
            })
            .collect();

        debug!(
            hypotheses = hypotheses.len(),
            spawned = spawn_actions.len(),
            "hypotheses generated"
        );

        let continue_flag = !hypotheses.is_empty();
        let output = StepOutput::Hypotheses(HypothesisOutput {
            hypotheses,
            rationale,
            evidence_count: evidence.len(),
        });
        Ok(
            StepOutcome::from_call(output, confidence, continue_flag, prompt, call, started)
                .with_spawn_actions(spawn_actions),
        )
    }
}
