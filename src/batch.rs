//! Drives one chain per high-severity alert.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::context::{Alert, AnalysisRun, SeedContext};
use crate::definition::ChainDefinition;
use crate::error::ChainError;
use crate::output::write_chain_result;
use crate::runner::{ChainResult, ChainRunner};

pub const FAILED_STATUS: &str = "failed";

/// Where per-alert results are persisted
#[derive(Debug, Clone)]
pub struct ResultSink {
    pub dir: PathBuf,
    pub run_id: String,
}

impl ResultSink {
    pub fn new(dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            run_id: run_id.into(),
        }
    }
}

/// Identifier for a batch started now, e.g. `run-20260105-093000`
pub fn default_run_id() -> String {
    Local::now().format("run-%Y%m%d-%H%M%S").to_string()
}

/// Per-alert record of what the chain did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutcome {
    pub alert_id: String,
    pub chain_status: String,
    pub chain_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChainOutcome {
    fn succeeded(alert_id: String, result: &ChainResult, path: PathBuf) -> Self {
        Self {
            alert_id,
            chain_status: result.status.to_string(),
            chain_path: result.chain_path(),
            conclusion: Some(result.conclusion.clone()),
            result_path: Some(path),
            error: None,
        }
    }

    fn failed(alert_id: String, error: &ChainError) -> Self {
        Self {
            alert_id,
            chain_status: FAILED_STATUS.to_string(),
            chain_path: Vec::new(),
            conclusion: None,
            result_path: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.chain_status == FAILED_STATUS
    }
}

pub fn is_high_severity(alert: &Alert) -> bool {
    alert.severity == "high"
}

fn alert_identifier(alert: &Alert) -> String {
    if alert.id.trim().is_empty() {
        "alert".to_string()
    } else {
        alert.id.clone()
    }
}

async fn investigate_one(
    runner: &ChainRunner,
    definition: &ChainDefinition,
    seed: SeedContext,
    dir: &Path,
    run_id: &str,
    alert_id: &str,
) -> Result<(ChainResult, PathBuf), ChainError> {
    let result = runner.run(definition, seed).await?;
    let path = write_chain_result(dir, run_id, alert_id, &result)?;
    Ok((result, path))
}

/// Run `definition` for every high-severity alert, one at a time. A failing
/// alert is recorded and skipped; it never stops the rest of the batch.
pub async fn investigate_alerts(
    runner: &ChainRunner,
    definition: &ChainDefinition,
    alerts: &[Alert],
    history: &[AnalysisRun],
    current: &AnalysisRun,
    sink: &ResultSink,
) -> Vec<ChainOutcome> {
    let high: Vec<&Alert> = alerts.iter().filter(|a| is_high_severity(a)).collect();
    info!(
        alerts = alerts.len(),
        high_severity = high.len(),
        run_id = %sink.run_id,
        "investigating alerts"
    );

    let mut outcomes = Vec::with_capacity(high.len());
    for alert in high {
        let alert_id = alert_identifier(alert);
        let run_id = if alert.run_id.trim().is_empty() {
            sink.run_id.as_str()
        } else {
            alert.run_id.as_str()
        };
        let seed = SeedContext {
            alert: alert.clone(),
            analysis_history: history.to_vec(),
            current_analysis: current.clone(),
        };

        match investigate_one(runner, definition, seed, &sink.dir, run_id, &alert_id).await {
            Ok((result, path)) => {
                info!(alert_id = %alert_id, status = %result.status, "alert investigated");
                outcomes.push(ChainOutcome::succeeded(alert_id, &result, path));
            }
            Err(e) => {
                warn!(alert_id = %alert_id, error = %e, "chain failed for alert");
                outcomes.push(ChainOutcome::failed(alert_id, &e));
            }
        }
    }
    outcomes
}
