//! Seed data handed to a chain run and the records a run produces.
//!
//! The seed (`alert`, `analysis_history`, `current_analysis`) is owned by the
//! run and never handed back out mutably. `step_results` is append-only.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::lenient;
use crate::steps::{StepKind, StepOutput};

/// One ranked opportunity from an analysis run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Opportunity {
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub title: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub score: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub theme: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub cluster_label: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub category: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub partner: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub partner_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl Opportunity {
    pub fn display_title(&self) -> &str {
        non_empty(&self.title)
            .or_else(|| non_empty(&self.name))
            .unwrap_or("Untitled")
    }

    pub fn score(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }

    pub fn display_theme(&self) -> &str {
        non_empty(&self.theme)
            .or_else(|| non_empty(&self.cluster_label))
            .or_else(|| non_empty(&self.category))
            .unwrap_or("Uncategorized")
    }

    pub fn display_partner(&self) -> &str {
        non_empty(&self.partner)
            .or_else(|| non_empty(&self.partner_name))
            .unwrap_or("Unspecified")
    }

    pub fn trimmed_summary(&self) -> &str {
        self.summary.as_deref().unwrap_or("").trim()
    }

    /// Lowercased text searched when validating hypotheses
    pub fn search_text(&self) -> String {
        [
            non_empty(&self.title).unwrap_or(""),
            non_empty(&self.summary).unwrap_or(""),
            non_empty(&self.theme)
                .or_else(|| non_empty(&self.cluster_label))
                .unwrap_or(""),
            non_empty(&self.partner)
                .or_else(|| non_empty(&self.partner_name))
                .unwrap_or(""),
        ]
        .join(" ")
        .to_lowercase()
    }
}

/// Summary of one analysis run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisRun {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub ranked_opportunities: Vec<Opportunity>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// High-severity alert that triggers a chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, rename = "type", deserialize_with = "lenient::string")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub severity: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub summary: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub run_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Read-only inputs supplied by the alerting pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedContext {
    #[serde(default)]
    pub alert: Alert,
    #[serde(default)]
    pub analysis_history: Vec<AnalysisRun>,
    #[serde(default)]
    pub current_analysis: AnalysisRun,
}

/// Run-scoped context, exclusively owned by one chain run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    seed: SeedContext,
    step_results: Vec<StepResult>,
}

impl ExecutionContext {
    pub fn new(seed: SeedContext) -> Self {
        Self {
            seed,
            step_results: Vec::new(),
        }
    }

    pub fn alert(&self) -> &Alert {
        &self.seed.alert
    }

    pub fn analysis_history(&self) -> &[AnalysisRun] {
        &self.seed.analysis_history
    }

    pub fn current_analysis(&self) -> &AnalysisRun {
        &self.seed.current_analysis
    }

    pub fn opportunities(&self) -> &[Opportunity] {
        &self.seed.current_analysis.ranked_opportunities
    }

    pub fn step_results(&self) -> &[StepResult] {
        &self.step_results
    }

    pub fn last_result(&self) -> Option<&StepResult> {
        self.step_results.last()
    }

    /// Evidence items recorded by earlier steps, in execution order
    pub fn prior_evidence(&self) -> Vec<Value> {
        self.step_results
            .iter()
            .flat_map(|r| r.output.evidence_values())
            .collect()
    }

    pub(crate) fn push_result(&mut self, result: StepResult) {
        self.step_results.push(result);
    }
}

/// Timing and cost of one step execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub elapsed_sec: f64,
    pub tokens: u64,
    pub cost_est: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Child investigation requested by a completed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Output of one step execution; immutable once appended to the context
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub depth: u32,
    pub inputs: Map<String, Value>,
    pub output: StepOutput,
    pub confidence: f64,
    pub continue_flag: bool,
    pub spawn_actions: Vec<SpawnAction>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model_response: String,
    pub metrics: StepMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Continue,
    Stop,
}

impl Decision {
    pub fn from_continue(keep_going: bool) -> Self {
        if keep_going {
            Decision::Continue
        } else {
            Decision::Stop
        }
    }
}

/// Audit record for one executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub step_id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub depth: u32,
    pub inputs: Map<String, Value>,
    pub prompt: String,
    pub model_response: String,
    pub metrics: StepMetrics,
    pub decision: Decision,
    pub confidence: f64,
}

impl AuditEntry {
    pub fn record(result: &StepResult, decision: Decision) -> Self {
        Self {
            step_id: result.id.clone(),
            kind: result.kind,
            depth: result.depth,
            inputs: result.inputs.clone(),
            prompt: result.prompt.clone(),
            model_response: result.model_response.clone(),
            metrics: result.metrics.clone(),
            decision,
            confidence: result.confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opportunity_fallbacks() {
        let opp: Opportunity = serde_json::from_value(serde_json::json!({
            "name": "Acme renewal",
            "cluster_label": "Renewals",
            "partner_name": "Acme",
            "summary": "  needs follow-up  ",
            "owner": "sam"
        }))
        .unwrap();
        assert_eq!(opp.display_title(), "Acme renewal");
        assert_eq!(opp.display_theme(), "Renewals");
        assert_eq!(opp.display_partner(), "Acme");
        assert_eq!(opp.trimmed_summary(), "needs follow-up");
        assert_eq!(opp.score(), 0.0);
        assert_eq!(opp.extra["owner"], "sam");
    }

    #[test]
    fn test_opportunity_defaults() {
        let opp = Opportunity::default();
        assert_eq!(opp.display_title(), "Untitled");
        assert_eq!(opp.display_theme(), "Uncategorized");
        assert_eq!(opp.display_partner(), "Unspecified");
    }

    #[test]
    fn test_seed_with_loose_scalars_parses() {
        let seed: SeedContext = serde_json::from_value(serde_json::json!({
            "alert": {"id": 7, "severity": "high", "run_id": 20260105},
            "analysis_history": [{"run_id": 41, "ranked_opportunities": []}],
            "current_analysis": {"ranked_opportunities": [
                {"title": "A", "score": "0.8"},
                {"title": 2024, "score": "n/a", "partner": null},
                {"title": "C", "score": 3}
            ]}
        }))
        .unwrap();

        assert_eq!(seed.alert.id, "7");
        assert_eq!(seed.alert.run_id, "20260105");
        assert_eq!(seed.analysis_history[0].run_id.as_deref(), Some("41"));
        let opps = &seed.current_analysis.ranked_opportunities;
        assert_eq!(opps[0].score(), 0.8);
        assert_eq!(opps[1].display_title(), "2024");
        assert_eq!(opps[1].score(), 0.0);
        assert_eq!(opps[1].display_partner(), "Unspecified");
        assert_eq!(opps[2].score(), 3.0);
    }

    #[test]
    fn test_search_text_ignores_name_and_category() {
        let opp = Opportunity {
            name: Some("Hidden".to_string()),
            category: Some("Secret".to_string()),
            summary: Some("Seasonal Dip".to_string()),
            ..Opportunity::default()
        };
        let text = opp.search_text();
        assert!(text.contains("seasonal dip"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_seed_context_deserializes_partial() {
        let seed: SeedContext = serde_json::from_value(serde_json::json!({
            "alert": {"id": "alert-1", "severity": "high"},
            "current_analysis": {"ranked_opportunities": [{"title": "A", "score": 0.5}]}
        }))
        .unwrap();
        assert_eq!(seed.alert.id, "alert-1");
        assert!(seed.analysis_history.is_empty());
        let ctx = ExecutionContext::new(seed);
        assert_eq!(ctx.opportunities().len(), 1);
        assert!(ctx.step_results().is_empty());
    }

    #[test]
    fn test_decision_serialization() {
        assert_eq!(serde_json::to_value(Decision::Continue).unwrap(), "continue");
        assert_eq!(Decision::from_continue(false), Decision::Stop);
    }
}
