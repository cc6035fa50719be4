//! Persisting chain results for downstream renderers.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::ChainError;
use crate::runner::ChainResult;

/// Write `value` as pretty JSON, creating parent directories as needed
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ChainError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(value)?;
    fs::write(path, data)?;
    Ok(())
}

/// Collapse every run of characters outside `[A-Za-z0-9_-]` into one dash
pub fn sanitize_for_filename(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_run = false;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "alert".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Path a chain result for `alert_id` lands at under `dir`
pub fn chain_result_path(dir: &Path, run_id: &str, alert_id: &str) -> PathBuf {
    dir.join(format!(
        "chain-{}-{}.json",
        run_id,
        sanitize_for_filename(alert_id)
    ))
}

pub fn write_chain_result(
    dir: &Path,
    run_id: &str,
    alert_id: &str,
    result: &ChainResult,
) -> Result<PathBuf, ChainError> {
    let path = chain_result_path(dir, run_id, alert_id);
    write_json(&path, result)?;
    info!(path = %path.display(), status = %result.status, "chain result written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{ChainStatus, ChainSummary};

    fn result() -> ChainResult {
        ChainResult {
            status: ChainStatus::Stopped,
            conclusion: "Partner mix shifted".to_string(),
            audit_trail: Vec::new(),
            cost_estimate: 0.0012,
            summary: ChainSummary {
                steps_count: 2,
                final_confidence: 0.6,
                elapsed_sec: 0.01,
                branches_used: 0,
            },
        }
    }

    #[test]
    fn test_sanitize_for_filename() {
        assert_eq!(sanitize_for_filename("alert-1"), "alert-1");
        assert_eq!(sanitize_for_filename("score drop / EMEA"), "score-drop-EMEA");
        assert_eq!(sanitize_for_filename("  ##  "), "alert");
        assert_eq!(sanitize_for_filename(""), "alert");
        assert_eq!(sanitize_for_filename("a..b__c"), "a-b__c");
    }

    #[test]
    fn test_write_chain_result_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("analyses").join("chains");
        let path = write_chain_result(&nested, "run-20260101-000000", "alert 7", &result()).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "chain-run-20260101-000000-alert-7.json"
        );
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["status"], "stopped");
        assert_eq!(written["summary"]["steps_count"], 2);
        assert_eq!(written["conclusion"], "Partner mix shifted");
    }

    #[test]
    fn test_write_json_plain_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_json(&path, &serde_json::json!({"a": 1})).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"a\": 1"));
    }
}
