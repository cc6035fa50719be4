//! Chain runner: walks a chain definition under a shared budget.
//!
//! All mutation of the policy, the context and the audit trail happens on the
//! calling task. Parallel groups only read the context while in flight, then
//! their results are settled here in declared order.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::branch::{self, SpawnOrigin};
use crate::config::ChainConfig;
use crate::context::{AuditEntry, Decision, ExecutionContext, SeedContext, StepResult};
use crate::definition::{Branching, ChainDefinition, ChainEntry, StepSpec};
use crate::error::ChainError;
use crate::llm::{round_to, LlmBackend};
use crate::policy::{should_continue, Policy};
use crate::steps::StepKind;

/// Conclusion reported when no step produced one
pub const NO_CONCLUSION: &str = "Chain executed without a single dominant conclusion.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Completed,
    Stopped,
    Timeout,
    BudgetExceeded,
}

impl ChainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainStatus::Completed => "completed",
            ChainStatus::Stopped => "stopped",
            ChainStatus::Timeout => "timeout",
            ChainStatus::BudgetExceeded => "budget_exceeded",
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub steps_count: usize,
    pub final_confidence: f64,
    pub elapsed_sec: f64,
    pub branches_used: u32,
}

/// Outcome of one chain run, handed to renderers and publishers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainResult {
    pub status: ChainStatus,
    pub conclusion: String,
    pub audit_trail: Vec<AuditEntry>,
    pub cost_estimate: f64,
    pub summary: ChainSummary,
}

impl ChainResult {
    /// Step ids in execution order
    pub fn chain_path(&self) -> Vec<String> {
        self.audit_trail.iter().map(|e| e.step_id.clone()).collect()
    }
}

/// Mutable state of one run, passed by reference to whoever settles work
pub(crate) struct RunState {
    pub ctx: ExecutionContext,
    pub policy: Policy,
    pub audit_trail: Vec<AuditEntry>,
    pub branches_used: u32,
    pub conclusion: String,
    started: Instant,
}

impl RunState {
    pub fn new(seed: SeedContext, policy: Policy) -> Self {
        Self {
            ctx: ExecutionContext::new(seed),
            policy,
            audit_trail: Vec::new(),
            branches_used: 0,
            conclusion: String::new(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_sec(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn timed_out(&self) -> bool {
        self.elapsed_sec() > self.policy.timeout_sec
    }

    /// Checked before each step or group. The budget only gates work that
    /// follows earlier work, so a run always attempts its first step.
    pub fn gate(&self) -> Option<ChainStatus> {
        if self.timed_out() {
            return Some(ChainStatus::Timeout);
        }
        if !self.ctx.step_results().is_empty() && self.policy.budget_exhausted() {
            return Some(ChainStatus::BudgetExceeded);
        }
        None
    }

    /// Append a result, charge its cost, decide and audit it
    pub fn settle(&mut self, result: StepResult) -> Decision {
        self.policy.accrue(result.metrics.cost_est);
        let decision = Decision::from_continue(should_continue(&result, &self.policy));
        debug!(
            step_id = %result.id,
            step_type = %result.kind,
            depth = result.depth,
            confidence = result.confidence,
            cost_spent = self.policy.cost_spent,
            decision = ?decision,
            "step settled"
        );
        self.audit_trail.push(AuditEntry::record(&result, decision));
        self.ctx.push_result(result);
        decision
    }

    /// Keep the latest non-empty conclusion
    pub fn capture_conclusion(&mut self) {
        if let Some(conclusion) = self
            .ctx
            .last_result()
            .and_then(|r| r.output.conclusion())
            .filter(|c| !c.trim().is_empty())
        {
            self.conclusion = conclusion.to_string();
        }
    }

    fn fallback_conclusion(&self) -> String {
        self.ctx
            .last_result()
            .and_then(|last| {
                last.output
                    .conclusion()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .or_else(|| last.output.rationale().map(str::trim).filter(|r| !r.is_empty()))
            })
            .unwrap_or(NO_CONCLUSION)
            .to_string()
    }

    pub fn finish(self, status: ChainStatus) -> ChainResult {
        let conclusion = if self.conclusion.is_empty() {
            self.fallback_conclusion()
        } else {
            self.conclusion.clone()
        };
        let final_confidence = self.ctx.last_result().map(|r| r.confidence).unwrap_or(0.0);
        let result = ChainResult {
            status,
            conclusion,
            cost_estimate: round_to(self.policy.cost_spent, 6),
            summary: ChainSummary {
                steps_count: self.ctx.step_results().len(),
                final_confidence,
                elapsed_sec: round_to(self.elapsed_sec(), 4),
                branches_used: self.branches_used,
            },
            audit_trail: self.audit_trail,
        };
        info!(
            status = %result.status,
            steps = result.summary.steps_count,
            cost_est = result.cost_estimate,
            confidence = result.summary.final_confidence,
            "chain completed"
        );
        result
    }
}

/// Execute one step against the context and stamp its identity
pub(crate) async fn execute_step(
    id: Option<&str>,
    kind: StepKind,
    params: &Map<String, Value>,
    ctx: &ExecutionContext,
    llm: &dyn LlmBackend,
    depth: u32,
) -> Result<StepResult, ChainError> {
    let step_id = id
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{}", kind, ctx.step_results().len() + 1));
    let mut inputs = params.clone();
    inputs
        .entry("step_id")
        .or_insert_with(|| Value::String(step_id.clone()));

    debug!(step_id = %step_id, step_type = %kind, depth, "executing step");
    let outcome = kind.executor().execute(&inputs, ctx, llm).await?;

    Ok(StepResult {
        id: step_id,
        kind,
        depth,
        inputs,
        output: outcome.output,
        confidence: outcome.confidence,
        continue_flag: outcome.continue_flag,
        spawn_actions: outcome.spawn_actions,
        prompt: outcome.prompt,
        model_response: outcome.model_response,
        metrics: outcome.metrics,
    })
}

/// Drives chain definitions against one LLM backend
pub struct ChainRunner {
    llm: Arc<dyn LlmBackend>,
    config: ChainConfig,
}

impl ChainRunner {
    pub fn new(llm: Arc<dyn LlmBackend>, config: ChainConfig) -> Self {
        Self { llm, config }
    }

    /// Run a chain to a terminal status. Any step error aborts the whole run.
    pub async fn run(
        &self,
        definition: &ChainDefinition,
        seed: SeedContext,
    ) -> Result<ChainResult, ChainError> {
        definition.validate()?;
        let policy = Policy::from_config(&self.config, definition.policy_overrides.as_ref());
        let mut state = RunState::new(seed, policy);
        info!(
            alert_id = %state.ctx.alert().id,
            steps = definition.steps.len(),
            budget_usd = state.policy.budget_usd,
            "chain started"
        );

        let mut status = ChainStatus::Completed;
        for entry in &definition.steps {
            if let Some(halt) = state.gate() {
                status = halt;
                break;
            }
            let decision = match entry {
                ChainEntry::Step(spec) => self.run_step(&mut state, spec).await?,
                ChainEntry::Parallel {
                    parallel,
                    branching,
                } => {
                    self.run_group(&mut state, parallel, branching.as_ref())
                        .await?
                }
            };
            if decision == Decision::Stop {
                status = ChainStatus::Stopped;
                break;
            }
        }

        Ok(state.finish(status))
    }

    async fn run_step(&self, state: &mut RunState, spec: &StepSpec) -> Result<Decision, ChainError> {
        let result = execute_step(
            spec.id.as_deref(),
            spec.kind,
            &spec.params,
            &state.ctx,
            self.llm.as_ref(),
            0,
        )
        .await?;

        let origin = SpawnOrigin::of(&result);
        let confidence = result.confidence;
        let decision = state.settle(result);
        state.capture_conclusion();
        self.expand(state, origin, spec.branching.as_ref()).await?;
        state.policy.previous_confidence = confidence;
        Ok(decision)
    }

    /// Run every member concurrently, then settle all of them in declared
    /// order before reporting a stop.
    async fn run_group(
        &self,
        state: &mut RunState,
        members: &[StepSpec],
        group_branching: Option<&Branching>,
    ) -> Result<Decision, ChainError> {
        debug!(members = members.len(), "dispatching parallel group");
        let results = join_all(members.iter().map(|spec| {
            execute_step(
                spec.id.as_deref(),
                spec.kind,
                &spec.params,
                &state.ctx,
                self.llm.as_ref(),
                0,
            )
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        let mut group_decision = Decision::Continue;
        for (spec, result) in members.iter().zip(results) {
            let origin = SpawnOrigin::of(&result);
            let confidence = result.confidence;
            let decision = state.settle(result);
            state.policy.previous_confidence = confidence;
            state.capture_conclusion();
            if decision == Decision::Stop {
                group_decision = Decision::Stop;
            }
            let branching = spec.branching.as_ref().or(group_branching);
            self.expand(state, origin, branching).await?;
        }
        Ok(group_decision)
    }

    async fn expand(
        &self,
        state: &mut RunState,
        origin: SpawnOrigin,
        branching: Option<&Branching>,
    ) -> Result<(), ChainError> {
        let branching = branching.cloned().unwrap_or_default();
        if !branching.use_spawn_actions {
            return Ok(());
        }
        let max_children = branching
            .max_children
            .unwrap_or(state.policy.max_branches as usize);
        branch::expand(state, self.llm.as_ref(), origin, max_children).await
    }
}
