use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Instant;

use super::{parse_params, StepExecutor, StepKind, StepOutcome, StepOutput};
use crate::context::{AnalysisRun, ExecutionContext};
use crate::error::ChainError;
use crate::lenient;
use crate::llm::{round_to, LlmBackend};

const DEFAULT_LOOKBACK: u64 = 3;

#[derive(Debug, Default, Deserialize)]
struct Params {
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    lookback: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetric {
    pub run_id: Option<String>,
    pub opportunity_count: usize,
    pub avg_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDeltas {
    pub opportunity_count: i64,
    pub avg_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompareRunsOutput {
    pub lookback: u64,
    pub runs: Vec<RunMetric>,
    /// Latest run minus the one before it; absent with fewer than two runs
    pub deltas: Option<RunDeltas>,
}

impl RunMetric {
    fn of(run: &AnalysisRun) -> Self {
        let scores: Vec<f64> = run.ranked_opportunities.iter().map(|o| o.score()).collect();
        let avg_score = if scores.is_empty() {
            0.0
        } else {
            round_to(scores.iter().sum::<f64>() / scores.len() as f64, 4)
        };
        Self {
            run_id: run.run_id.clone(),
            opportunity_count: scores.len(),
            avg_score,
        }
    }
}

/// Compares opportunity counts and average scores across recent runs
pub struct CompareRuns;

impl CompareRuns {
    /// The last `lookback - 1` history runs followed by the current run
    fn recent_runs(ctx: &ExecutionContext, lookback: u64) -> Vec<&AnalysisRun> {
        let history = ctx.analysis_history();
        let keep = (lookback.saturating_sub(1) as usize).min(history.len());
        history[history.len() - keep..]
            .iter()
            .chain(std::iter::once(ctx.current_analysis()))
            .collect()
    }
}

#[async_trait]
impl StepExecutor for CompareRuns {
    fn kind(&self) -> StepKind {
        StepKind::CompareRuns
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: &ExecutionContext,
        _llm: &dyn LlmBackend,
    ) -> Result<StepOutcome, ChainError> {
        let started = Instant::now();
        let params: Params = parse_params(self.kind(), params)?;
        let lookback = params
            .lookback
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_LOOKBACK)
            .max(2);

        let runs: Vec<RunMetric> = Self::recent_runs(ctx, lookback)
            .into_iter()
            .map(RunMetric::of)
            .collect();

        let deltas = match runs.as_slice() {
            [.., prev, now] => Some(RunDeltas {
                opportunity_count: now.opportunity_count as i64 - prev.opportunity_count as i64,
                avg_score: round_to(now.avg_score - prev.avg_score, 4),
            }),
            _ => None,
        };

        let has_data = !runs.is_empty();
        let confidence = if has_data { 0.65 } else { 0.2 };
        Ok(StepOutcome::deterministic(
            StepOutput::CompareRuns(CompareRunsOutput {
                lookback,
                runs,
                deltas,
            }),
            confidence,
            has_data,
            started,
        ))
    }
}
