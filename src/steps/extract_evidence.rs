use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

use super::{parse_params, StepExecutor, StepKind, StepOutcome, StepOutput};
use crate::context::{ExecutionContext, Opportunity};
use crate::error::ChainError;
use crate::lenient;
use crate::llm::{round_to, LlmBackend};

const DEFAULT_TOP_N: usize = 5;

#[derive(Debug, Default, Deserialize)]
struct Params {
    #[serde(default, deserialize_with = "lenient::opt_usize")]
    top_n: Option<usize>,
}

/// One piece of evidence drawn from the current run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub title: String,
    pub score: f64,
    pub theme: String,
    pub partner: String,
    pub summary: String,
}

impl From<&Opportunity> for Evidence {
    fn from(item: &Opportunity) -> Self {
        Self {
            title: item.display_title().to_string(),
            score: round_to(item.score(), 4),
            theme: item.display_theme().to_string(),
            partner: item.display_partner().to_string(),
            summary: item.trimmed_summary().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceOutput {
    pub top_n: usize,
    pub evidence: Vec<Evidence>,
    pub evidence_count: usize,
}

/// Ranks current-run opportunities by score and keeps the top N
pub struct ExtractEvidence;

#[async_trait]
impl StepExecutor for ExtractEvidence {
    fn kind(&self) -> StepKind {
        StepKind::ExtractEvidence
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ExecutionContext,
        _llm: &dyn LlmBackend,
    ) -> Result<StepOutcome, ChainError> {
        let started = Instant::now();
        let params: Params = parse_params(self.kind(), params)?;
        let top_n = params
            .top_n
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_TOP_N);

        let mut ranked: Vec<&Opportunity> = ctx.opportunities().iter().collect();
        // stable, so equal scores keep their upstream order
        ranked.sort_by(|a, b| b.score().total_cmp(&a.score()));

        let evidence: Vec<Evidence> = ranked.into_iter().take(top_n).map(Evidence::from).collect();
        let evidence_count = evidence.len();
        let confidence = (0.45 + 0.07 * evidence_count as f64).min(0.95);

        Ok(StepOutcome::deterministic(
            StepOutput::Evidence(EvidenceOutput {
                top_n,
                evidence,
                evidence_count,
            }),
            confidence,
            evidence_count > 0,
            started,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AnalysisRun, SeedContext};
    use crate::llm::MockLlm;

    fn context(scores: &[f64]) -> ExecutionContext {
        let ranked_opportunities = scores
            .iter()
            .enumerate()
            .map(|(i, s)| Opportunity {
                title: Some(format!("opp-{}", i)),
                score: Some(*s),
                ..Opportunity::default()
            })
            .collect();
        ExecutionContext::new(SeedContext {
            current_analysis: AnalysisRun {
                ranked_opportunities,
                ..AnalysisRun::default()
            },
            ..SeedContext::default()
        })
    }

    async fn extract(params: Value, ctx: &ExecutionContext) -> StepOutcome {
        ExtractEvidence
            .execute(params.as_object().unwrap(), ctx, &MockLlm::new("m"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_top_n_descending() {
        let ctx = context(&[0.6, 0.9, 0.5, 0.8, 0.7]);
        let outcome = extract(serde_json::json!({"top_n": 3}), &ctx).await;
        let StepOutput::Evidence(out) = &outcome.output else {
            panic!("unexpected output");
        };
        let scores: Vec<f64> = out.evidence.iter().map(|e| e.score).collect();
        assert_eq!(scores, vec![0.9, 0.8, 0.7]);
        assert_eq!(out.evidence_count, 3);
        assert!((outcome.confidence - 0.66).abs() < 1e-9);
        assert!(outcome.continue_flag);
        assert_eq!(outcome.metrics.cost_est, 0.0);
    }

    #[tokio::test]
    async fn test_confidence_caps_at_095() {
        let scores: Vec<f64> = (0..12).map(|i| i as f64 / 12.0).collect();
        let ctx = context(&scores);
        let outcome = extract(serde_json::json!({"top_n": 10}), &ctx).await;
        assert_eq!(outcome.confidence, 0.95);
    }

    #[tokio::test]
    async fn test_default_top_n() {
        let ctx = context(&[0.1; 8]);
        let outcome = extract(serde_json::json!({"top_n": 0}), &ctx).await;
        let StepOutput::Evidence(out) = &outcome.output else {
            panic!("unexpected output");
        };
        assert_eq!(out.top_n, 5);
        assert_eq!(out.evidence.len(), 5);
    }

    #[tokio::test]
    async fn test_empty_run_stops() {
        let ctx = context(&[]);
        let outcome = extract(serde_json::json!({}), &ctx).await;
        assert!(!outcome.continue_flag);
        assert!((outcome.confidence - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_loose_top_n_values() {
        let ctx = context(&[0.6, 0.9, 0.5, 0.8, 0.7]);
        for (top_n, expected) in [
            (serde_json::json!(3.0), 3),
            (serde_json::json!("2"), 2),
            (serde_json::json!("lots"), 5),
            (serde_json::json!(-1), 5),
        ] {
            let outcome = extract(serde_json::json!({ "top_n": top_n }), &ctx).await;
            let StepOutput::Evidence(out) = &outcome.output else {
                panic!("unexpected output");
            };
            assert_eq!(out.evidence.len(), expected);
        }
    }
}
