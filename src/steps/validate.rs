use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

use super::{parse_params, StepExecutor, StepKind, StepOutcome, StepOutput};
use crate::context::ExecutionContext;
use crate::error::ChainError;
use crate::lenient;
use crate::llm::{round_to, LlmBackend};

const MAX_SUPPORT_EXAMPLES: usize = 5;

#[derive(Debug, Default, Deserialize)]
struct Params {
    #[serde(default, deserialize_with = "lenient::string")]
    hypothesis: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupportExample {
    pub title: String,
    pub score: f64,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutput {
    pub hypothesis: String,
    /// "supported" with two or more examples, otherwise "weak"
    pub verdict: String,
    pub support_count: usize,
    pub sample_examples: Vec<SupportExample>,
    pub evidence: Vec<String>,
}

/// Checks a hypothesis against the current run's opportunity text
pub struct ValidateHypothesis;

/// Lowercased words longer than three characters
fn significant_terms(hypothesis: &str) -> Vec<String> {
    hypothesis
        .split_whitespace()
        .filter(|term| term.chars().count() > 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl StepExecutor for ValidateHypothesis {
    fn kind(&self) -> StepKind {
        StepKind::ValidateHypothesis
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ExecutionContext,
        _llm: &dyn LlmBackend,
    ) -> Result<StepOutcome, ChainError> {
        let started = Instant::now();
        let params: Params = parse_params(self.kind(), params)?;
        let hypothesis = params.hypothesis.trim().to_string();
        let terms = significant_terms(&hypothesis);
        let opportunities = ctx.opportunities();

        let sample_examples: Vec<SupportExample> = opportunities
            .iter()
            .filter(|item| {
                let text = item.search_text();
                terms.iter().any(|term| text.contains(term.as_str()))
            })
            .take(MAX_SUPPORT_EXAMPLES)
            .map(|item| SupportExample {
                title: item.display_title().to_string(),
                score: round_to(item.score(), 4),
                summary: item.trimmed_summary().to_string(),
            })
            .collect();

        let support_count = sample_examples.len();
        let total = opportunities.len().max(1);
        let support_ratio = support_count as f64 / total as f64;
        let confidence = (0.35 + support_ratio * 1.3).min(0.95);
        let verdict = if support_count >= 2 { "supported" } else { "weak" };

        Ok(StepOutcome::deterministic(
            StepOutput::Validation(ValidationOutput {
                hypothesis,
                verdict: verdict.to_string(),
                support_count,
                sample_examples,
                evidence: vec![format!(
                    "Support examples found: {} out of {} opportunities",
                    support_count, total
                )],
            }),
            confidence,
            support_count > 0,
            started,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AnalysisRun, Opportunity, SeedContext};
    use crate::llm::MockLlm;

    fn opp(title: &str, summary: &str, theme: &str) -> Opportunity {
        Opportunity {
            title: Some(title.to_string()),
            summary: Some(summary.to_string()),
            theme: Some(theme.to_string()),
            score: Some(0.5),
            ..Opportunity::default()
        }
    }

    fn context(opps: Vec<Opportunity>) -> ExecutionContext {
        ExecutionContext::new(SeedContext {
            current_analysis: AnalysisRun {
                ranked_opportunities: opps,
                ..AnalysisRun::default()
            },
            ..SeedContext::default()
        })
    }

    async fn validate(hypothesis: &str, ctx: &ExecutionContext) -> (StepOutcome, ValidationOutput) {
        let params = serde_json::json!({"hypothesis": hypothesis});
        let outcome = ValidateHypothesis
            .execute(params.as_object().unwrap(), ctx, &MockLlm::new("m"))
            .await
            .unwrap();
        let StepOutput::Validation(out) = outcome.output.clone() else {
            panic!("unexpected output");
        };
        (outcome, out)
    }

    #[test]
    fn test_significant_terms() {
        assert_eq!(
            significant_terms("A big Seasonal dip in Renewals"),
            vec!["seasonal", "renewals"]
        );
    }

    #[tokio::test]
    async fn test_supported_hypothesis() {
        let ctx = context(vec![
            opp("Renewal slowdown", "seasonal churn", "Retention"),
            opp("Upsell", "pricing change", "Seasonal"),
            opp("New logo", "inbound", "Acquisition"),
            opp("Expansion", "steady", "Growth"),
        ]);
        let (outcome, out) = validate("Seasonal effects", &ctx).await;
        assert_eq!(out.support_count, 2);
        assert_eq!(out.verdict, "supported");
        assert!((outcome.confidence - 0.95).abs() < 1e-9);
        assert!(outcome.continue_flag);
        assert_eq!(
            out.evidence,
            vec!["Support examples found: 2 out of 4 opportunities"]
        );
    }

    #[tokio::test]
    async fn test_weak_hypothesis_confidence() {
        let ctx = context(vec![
            opp("Renewal slowdown", "churn", "Retention"),
            opp("Upsell", "pricing", "Growth"),
            opp("New logo", "inbound", "Acquisition"),
            opp("Expansion", "steady", "Growth"),
            opp("Other", "misc", "Misc"),
        ]);
        let (outcome, out) = validate("pricing pressure", &ctx).await;
        assert_eq!(out.support_count, 1);
        assert_eq!(out.verdict, "weak");
        assert!((outcome.confidence - (0.35 + 0.2 * 1.3)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_caps_examples_at_five() {
        let opps = (0..8).map(|i| opp(&format!("churn {}", i), "", "")).collect();
        let ctx = context(opps);
        let (_, out) = validate("churn everywhere", &ctx).await;
        assert_eq!(out.support_count, 5);
        assert_eq!(out.sample_examples.len(), 5);
    }

    #[tokio::test]
    async fn test_no_terms_no_support() {
        let ctx = context(vec![opp("abc", "def", "ghi")]);
        let (outcome, out) = validate("a an the", &ctx).await;
        assert_eq!(out.support_count, 0);
        assert!(!outcome.continue_flag);
        assert!((outcome.confidence - 0.35).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_run_reports_one_total() {
        let ctx = context(vec![]);
        let (_, out) = validate("Seasonal effects", &ctx).await;
        assert_eq!(
            out.evidence,
            vec!["Support examples found: 0 out of 1 opportunities"]
        );
    }
}
