//! Spawn expansion: executes follow-up actions proposed by a settled step.
//!
//! Expansion is depth first over an explicit work list. A child's own spawn
//! actions are handled before its remaining siblings, as long as the child
//! sits above the depth limit.

use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::context::{SpawnAction, StepResult};
use crate::error::ChainError;
use crate::llm::LlmBackend;
use crate::runner::{execute_step, RunState};

/// What a settled step left behind for expansion
#[derive(Debug, Clone)]
pub(crate) struct SpawnOrigin {
    pub parent_id: String,
    pub depth: u32,
    pub actions: Vec<SpawnAction>,
}

impl SpawnOrigin {
    pub fn of(result: &StepResult) -> Self {
        Self {
            parent_id: result.id.clone(),
            depth: result.depth,
            actions: result.spawn_actions.clone(),
        }
    }
}

struct Frame {
    parent_id: String,
    child_depth: u32,
    pending: VecDeque<SpawnAction>,
}

impl Frame {
    fn new(origin: SpawnOrigin, max_children: usize) -> Self {
        Self {
            parent_id: origin.parent_id,
            child_depth: origin.depth + 1,
            pending: origin.actions.into_iter().take(max_children).collect(),
        }
    }
}

/// First limit that forbids another child, if any
fn spawn_blocked(state: &RunState) -> Option<&'static str> {
    if state.branches_used >= state.policy.max_branches {
        return Some("max_branches");
    }
    if state.timed_out() {
        return Some("timeout");
    }
    if state.policy.budget_exhausted() {
        return Some("budget");
    }
    None
}

/// Run the spawn actions of `origin`. Returns once every eligible action ran
/// or a limit was hit; a hit limit drops everything still pending.
pub(crate) async fn expand(
    state: &mut RunState,
    llm: &dyn LlmBackend,
    origin: SpawnOrigin,
    max_children: usize,
) -> Result<(), ChainError> {
    if origin.depth >= state.policy.max_depth || origin.actions.is_empty() {
        return Ok(());
    }

    let mut stack = vec![Frame::new(origin, max_children)];
    while let Some(frame) = stack.last_mut() {
        let Some(action) = frame.pending.pop_front() else {
            stack.pop();
            continue;
        };

        if let Some(limit) = spawn_blocked(state) {
            let dropped = 1 + stack.iter().map(|f| f.pending.len()).sum::<usize>();
            warn!(limit, dropped, branches_used = state.branches_used, "spawn actions dropped");
            break;
        }

        let child_id = action
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}-branch-{}", frame.parent_id, state.branches_used + 1));
        let child_depth = frame.child_depth;

        debug!(parent = %frame.parent_id, child = %child_id, depth = child_depth, "spawning child step");
        let result = execute_step(
            Some(&child_id),
            action.kind,
            &action.params,
            &state.ctx,
            llm,
            child_depth,
        )
        .await?;

        let nested = SpawnOrigin::of(&result);
        let confidence = result.confidence;
        state.settle(result);
        state.branches_used += 1;
        state.policy.previous_confidence = confidence;

        if nested.depth < state.policy.max_depth && !nested.actions.is_empty() {
            stack.push(Frame::new(nested, max_children));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::context::{AnalysisRun, Decision, Opportunity, SeedContext};
    use crate::llm::MockLlm;
    use crate::policy::Policy;
    use crate::steps::StepKind;
    use serde_json::{Map, Value};

    fn state(max_depth: u32, max_branches: u32) -> RunState {
        let config = ChainConfig {
            max_depth,
            max_branches,
            ..ChainConfig::default()
        };
        let seed = SeedContext {
            current_analysis: AnalysisRun {
                ranked_opportunities: vec![Opportunity {
                    title: Some("Seasonal renewals".to_string()),
                    score: Some(0.7),
                    ..Opportunity::default()
                }],
                ..AnalysisRun::default()
            },
            ..SeedContext::default()
        };
        RunState::new(seed, Policy::from_config(&config, None))
    }

    fn validate_action(hypothesis: &str) -> SpawnAction {
        let mut params = Map::new();
        params.insert("hypothesis".to_string(), Value::from(hypothesis));
        SpawnAction {
            id: None,
            kind: StepKind::ValidateHypothesis,
            params,
        }
    }

    fn origin(depth: u32, actions: Vec<SpawnAction>) -> SpawnOrigin {
        SpawnOrigin {
            parent_id: "hyp".to_string(),
            depth,
            actions,
        }
    }

    #[tokio::test]
    async fn test_expand_respects_max_branches() {
        let mut s = state(2, 2);
        let actions = vec![
            validate_action("Seasonal dip"),
            validate_action("Renewal lag"),
            validate_action("Third idea"),
        ];
        expand(&mut s, &MockLlm::new("m"), origin(0, actions), 10)
            .await
            .unwrap();

        assert_eq!(s.branches_used, 2);
        let ids: Vec<&str> = s.audit_trail.iter().map(|e| e.step_id.as_str()).collect();
        assert_eq!(ids, vec!["hyp-branch-1", "hyp-branch-2"]);
        assert!(s.audit_trail.iter().all(|e| e.depth == 1));
        assert_eq!(
            s.policy.previous_confidence,
            s.ctx.last_result().unwrap().confidence
        );
    }

    #[tokio::test]
    async fn test_expand_caps_children_per_step() {
        let mut s = state(2, 5);
        let actions = vec![validate_action("a one"), validate_action("b two")];
        expand(&mut s, &MockLlm::new("m"), origin(0, actions), 1)
            .await
            .unwrap();
        assert_eq!(s.branches_used, 1);
    }

    #[tokio::test]
    async fn test_expand_skips_at_depth_limit() {
        let mut s = state(1, 5);
        expand(
            &mut s,
            &MockLlm::new("m"),
            origin(1, vec![validate_action("Seasonal dip")]),
            5,
        )
        .await
        .unwrap();
        assert_eq!(s.branches_used, 0);
        assert!(s.audit_trail.is_empty());
    }

    #[tokio::test]
    async fn test_expand_explicit_child_id() {
        let mut s = state(2, 2);
        let mut action = validate_action("Seasonal dip");
        action.id = Some("check-seasonality".to_string());
        expand(&mut s, &MockLlm::new("m"), origin(0, vec![action]), 2)
            .await
            .unwrap();
        assert_eq!(s.audit_trail[0].step_id, "check-seasonality");
    }

    #[tokio::test]
    async fn test_expand_is_depth_first() {
        let mut s = state(2, 3);
        let nested = SpawnAction {
            id: None,
            kind: StepKind::HypothesisGeneration,
            params: Map::new(),
        };
        let actions = vec![nested, validate_action("Seasonal dip")];
        expand(&mut s, &MockLlm::new("m"), origin(0, actions), 2)
            .await
            .unwrap();

        let path: Vec<(&str, u32)> = s
            .audit_trail
            .iter()
            .map(|e| (e.step_id.as_str(), e.depth))
            .collect();
        assert_eq!(
            path,
            vec![
                ("hyp-branch-1", 1),
                ("hyp-branch-1-branch-2", 2),
                ("hyp-branch-1-branch-3", 2),
            ]
        );
        assert_eq!(s.branches_used, 3);
    }

    #[tokio::test]
    async fn test_expand_stops_on_exhausted_budget() {
        let mut s = state(2, 5);
        s.policy.budget_usd = 0.0;
        expand(
            &mut s,
            &MockLlm::new("m"),
            origin(0, vec![validate_action("Seasonal dip")]),
            5,
        )
        .await
        .unwrap();
        assert_eq!(s.branches_used, 0);
    }

    #[tokio::test]
    async fn test_sibling_decision_uses_previous_sibling_confidence() {
        let mut s = state(2, 3);
        // confidence must rise to continue
        s.policy.min_evidence_count = 2;
        s.policy.previous_confidence = 0.0;
        let actions = vec![
            validate_action("Seasonal dip"),
            validate_action("Seasonal renewals"),
        ];
        expand(&mut s, &MockLlm::new("m"), origin(0, actions), 3)
            .await
            .unwrap();

        let confidences: Vec<f64> = s.audit_trail.iter().map(|e| e.confidence).collect();
        assert_eq!(confidences, vec![0.95, 0.95]);
        let decisions: Vec<Decision> = s.audit_trail.iter().map(|e| e.decision).collect();
        assert_eq!(decisions, vec![Decision::Continue, Decision::Stop]);
        assert_eq!(s.policy.previous_confidence, 0.95);
    }

    #[tokio::test]
    async fn test_expand_stops_on_timeout() {
        let mut s = state(2, 5);
        s.policy.timeout_sec = -1.0;
        expand(
            &mut s,
            &MockLlm::new("m"),
            origin(0, vec![validate_action("Seasonal dip")]),
            5,
        )
        .await
        .unwrap();
        assert_eq!(s.branches_used, 0);
        assert!(s.audit_trail.is_empty());
        assert!(!s.policy.budget_exhausted());
    }
}
