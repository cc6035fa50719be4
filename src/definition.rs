//! Declarative chain definitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::info;

use crate::error::ChainError;
use crate::policy::PolicyOverrides;
use crate::steps::StepKind;

/// Controls spawn expansion for a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branching {
    #[serde(default = "default_use_spawn_actions")]
    pub use_spawn_actions: bool,
    /// Cap on how many of a step's spawn actions are considered
    #[serde(default)]
    pub max_children: Option<usize>,
}

fn default_use_spawn_actions() -> bool {
    true
}

impl Default for Branching {
    fn default() -> Self {
        Self {
            use_spawn_actions: true,
            max_children: None,
        }
    }
}

/// A single declared step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branching: Option<Branching>,
}

impl StepSpec {
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: None,
            kind,
            params: Map::new(),
            branching: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_branching(mut self, branching: Branching) -> Self {
        self.branching = Some(branching);
        self
    }
}

/// One slot in the step list: a single step or a group run concurrently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChainEntry {
    Parallel {
        parallel: Vec<StepSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branching: Option<Branching>,
    },
    Step(StepSpec),
}

impl From<StepSpec> for ChainEntry {
    fn from(spec: StepSpec) -> Self {
        ChainEntry::Step(spec)
    }
}

impl ChainEntry {
    pub fn parallel(members: Vec<StepSpec>) -> Self {
        ChainEntry::Parallel {
            parallel: members,
            branching: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    #[serde(default)]
    pub steps: Vec<ChainEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_overrides: Option<PolicyOverrides>,
}

impl ChainDefinition {
    pub fn new(steps: Vec<ChainEntry>) -> Self {
        Self {
            steps,
            policy_overrides: None,
        }
    }

    pub fn with_overrides(mut self, overrides: PolicyOverrides) -> Self {
        self.policy_overrides = Some(overrides);
        self
    }

    /// Standard root-cause investigation for a high-severity alert
    pub fn default_investigation() -> Self {
        Self::new(vec![
            StepSpec::new(StepKind::CompareRuns)
                .with_id("compare-runs")
                .with_param("lookback", 3)
                .into(),
            StepSpec::new(StepKind::ExtractEvidence)
                .with_id("extract-evidence")
                .with_param("top_n", 5)
                .into(),
            StepSpec::new(StepKind::HypothesisGeneration)
                .with_id("hypothesis-generation")
                .with_param("top_k", 3)
                .with_param("spawn_top_n", 2)
                .into(),
            StepSpec::new(StepKind::TargetedAnalysis)
                .with_id("targeted-analysis")
                .with_param(
                    "objective",
                    "Explain the most likely root cause of the alert and recommend next steps.",
                )
                .into(),
        ])
    }

    /// Load a definition from a `.json` or `.toml` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let definition: ChainDefinition = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| ChainError::Definition(e.to_string()))?
            }
            _ => serde_json::from_str(&content)
                .map_err(|e| ChainError::Definition(e.to_string()))?,
        };
        definition.validate()?;
        info!(path = %path.display(), steps = definition.steps.len(), "chain definition loaded");
        Ok(definition)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        for (index, entry) in self.steps.iter().enumerate() {
            if let ChainEntry::Parallel { parallel, .. } = entry {
                if parallel.is_empty() {
                    return Err(ChainError::Definition(format!(
                        "parallel group at position {} has no members",
                        index
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_definition() {
        let def: ChainDefinition = serde_json::from_value(serde_json::json!({
            "steps": [
                {"type": "compare_runs"},
                {"parallel": [
                    {"id": "ev", "type": "extract_evidence", "params": {"top_n": 3}},
                    {"type": "hypothesis_generation", "branching": {"max_children": 1}}
                ]},
                {"type": "targeted_analysis", "branching": {"use_spawn_actions": false}}
            ],
            "policy_overrides": {"budget_usd": 0.1}
        }))
        .unwrap();

        assert_eq!(def.steps.len(), 3);
        assert!(matches!(&def.steps[0], ChainEntry::Step(s) if s.kind == StepKind::CompareRuns));
        match &def.steps[1] {
            ChainEntry::Parallel { parallel, branching } => {
                assert_eq!(parallel.len(), 2);
                assert_eq!(parallel[0].id.as_deref(), Some("ev"));
                assert_eq!(parallel[1].branching.as_ref().unwrap().max_children, Some(1));
                assert!(parallel[1].branching.as_ref().unwrap().use_spawn_actions);
                assert!(branching.is_none());
            }
            other => panic!("expected parallel group, got {:?}", other),
        }
        match &def.steps[2] {
            ChainEntry::Step(s) => assert!(!s.branching.as_ref().unwrap().use_spawn_actions),
            other => panic!("expected step, got {:?}", other),
        }
        assert_eq!(def.policy_overrides.unwrap().budget_usd, Some(0.1));
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let result: Result<ChainDefinition, _> = serde_json::from_value(serde_json::json!({
            "steps": [{"type": "summarize"}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.toml");
        std::fs::write(
            &path,
            r#"
            [[steps]]
            type = "extract_evidence"
            params = { top_n = 2 }

            [[steps]]
            parallel = [{ type = "compare_runs" }, { type = "targeted_analysis" }]

            [policy_overrides]
            max_depth = 1
            "#,
        )
        .unwrap();
        let def = ChainDefinition::from_file(&path).unwrap();
        assert_eq!(def.steps.len(), 2);
        assert!(matches!(&def.steps[1], ChainEntry::Parallel { parallel, .. } if parallel.len() == 2));
        assert_eq!(def.policy_overrides.unwrap().max_depth, Some(1));
    }

    #[test]
    fn test_empty_parallel_group_rejected() {
        let def = ChainDefinition::new(vec![ChainEntry::parallel(vec![])]);
        assert!(matches!(def.validate(), Err(ChainError::Definition(_))));
    }

    #[test]
    fn test_default_investigation_shape() {
        let def = ChainDefinition::default_investigation();
        let kinds: Vec<StepKind> = def
            .steps
            .iter()
            .filter_map(|e| match e {
                ChainEntry::Step(s) => Some(s.kind),
                ChainEntry::Parallel { .. } => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::CompareRuns,
                StepKind::ExtractEvidence,
                StepKind::HypothesisGeneration,
                StepKind::TargetedAnalysis
            ]
        );
    }
}
