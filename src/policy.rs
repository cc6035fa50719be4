//! Run-scoped limits and the continue/stop decision.

use serde::{Deserialize, Serialize};

use crate::config::ChainConfig;
use crate::context::StepResult;
use crate::steps::StepOutput;

/// Thresholds plus running counters for one chain run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Policy {
    pub max_depth: u32,
    pub max_branches: u32,
    pub timeout_sec: f64,
    pub budget_usd: f64,
    pub min_confidence_delta: f64,
    pub min_evidence_count: usize,
    pub min_confidence_floor: f64,
    /// Running cost total, never negative
    pub cost_spent: f64,
    /// Confidence of the most recently settled step
    pub previous_confidence: f64,
}

/// Per-chain replacements for configured thresholds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub max_depth: Option<u32>,
    pub max_branches: Option<u32>,
    pub timeout_sec: Option<f64>,
    pub budget_usd: Option<f64>,
    pub min_confidence_delta: Option<f64>,
    pub min_evidence_count: Option<usize>,
    pub min_confidence_floor: Option<f64>,
}

impl Policy {
    pub fn from_config(config: &ChainConfig, overrides: Option<&PolicyOverrides>) -> Self {
        let mut policy = Self {
            max_depth: config.max_depth,
            max_branches: config.max_branches,
            timeout_sec: config.timeout_sec,
            budget_usd: config.budget_usd,
            min_confidence_delta: config.min_confidence_delta,
            min_evidence_count: 1,
            min_confidence_floor: 0.35,
            cost_spent: 0.0,
            previous_confidence: 0.0,
        };
        if let Some(o) = overrides {
            policy.max_depth = o.max_depth.unwrap_or(policy.max_depth);
            policy.max_branches = o.max_branches.unwrap_or(policy.max_branches);
            policy.timeout_sec = o.timeout_sec.unwrap_or(policy.timeout_sec);
            policy.budget_usd = o.budget_usd.unwrap_or(policy.budget_usd);
            policy.min_confidence_delta = o.min_confidence_delta.unwrap_or(policy.min_confidence_delta);
            policy.min_evidence_count = o.min_evidence_count.unwrap_or(policy.min_evidence_count);
            policy.min_confidence_floor = o.min_confidence_floor.unwrap_or(policy.min_confidence_floor);
        }
        policy
    }

    pub fn budget_remaining(&self) -> f64 {
        self.budget_usd - self.cost_spent
    }

    pub fn budget_exhausted(&self) -> bool {
        self.cost_spent >= self.budget_usd
    }

    pub fn accrue(&mut self, cost: f64) {
        self.cost_spent += cost.max(0.0);
    }
}

/// Evidence a step reports: an explicit count field first, then the length of
/// its evidence list, then the length of its sample examples, else zero.
pub fn evidence_count(output: &StepOutput) -> usize {
    match output {
        StepOutput::Evidence(out) => out.evidence_count,
        StepOutput::Hypotheses(out) => out.evidence_count,
        StepOutput::Validation(out) => out.evidence.len(),
        StepOutput::CompareRuns(_) | StepOutput::Analysis(_) => 0,
    }
}

/// Decide whether the chain keeps going after `result`.
///
/// Stops on a cleared continue flag or an exhausted budget. Otherwise keeps
/// going while confidence is rising by at least `min_confidence_delta`, or
/// while the step is already backed by enough evidence at a high enough
/// confidence.
pub fn should_continue(result: &StepResult, policy: &Policy) -> bool {
    if !result.continue_flag {
        return false;
    }
    if policy.budget_remaining() <= 0.0 {
        return false;
    }

    let confidence_delta = result.confidence - policy.previous_confidence;
    if confidence_delta >= policy.min_confidence_delta {
        return true;
    }

    evidence_count(&result.output) >= policy.min_evidence_count
        && result.confidence >= policy.min_confidence_floor
}
