//! Shared plumbing every pattern executor goes through to run one stage:
//! template rendering, agent-cache lookup, the retry wrapper, budget
//! accounting, HITL pause/response, and lifecycle hooks. Keeping this in
//! one place is what lets Routing/Parallel/OrchestratorWorkers each run a
//! "nested chain" of stages without re-deriving agent-invocation plumbing.

use crate::cache::AgentCache;
use crate::checkpoint::CheckpointHandle;
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::hitl::{HitlDecision, HitlGate};
use crate::hooks::{Event, HookDispatcher};
use crate::retry::{with_retry, BudgetTracker, RetryPolicy};
use crate::runtime::TokenUsage;
use crate::spec::{AgentId, Spec, Stage};
use crate::template;
use crate::token_budget::TokenCounter;
use std::sync::Arc;

/// Outcome of running one stage: either the run can continue, or it must
/// pause here and be resumed later with a human response. A plain enum
/// rather than an exception, so pause/resume never has to unwind a call
/// stack — callers match on it like any other result.
pub enum Flow<T> {
    Continue(T),
    Paused { stage: String },
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub response: String,
    pub tokens: TokenUsage,
}

/// A pattern's result, carrying back whatever `Context` it had built so
/// far even on failure (`spec.md` §4.9.4, E2E Scenario 3: a failed run
/// still retains the partial state of the branches/stages/nodes that
/// completed before the failure). `engine::drive` reads this `Context`
/// instead of reconstructing one from the session's pre-execution record.
pub type PatternResult<T> = std::result::Result<T, (EngineError, Context)>;

/// Up to two retries on a malformed structured response before giving up
/// on a stage whose data model has no configurable retry count of its own
/// (the evaluator's score/issues, the orchestrator's plan — `spec.md`
/// §4.9.5, §4.9.6). The router carries its own `RouterSpec::max_retries`.
pub const DEFAULT_PARSE_RETRIES: u32 = 2;

/// Everything a pattern executor needs to run one `Stage`. Every field is
/// `Arc`-backed so a `StageRunner` can be cloned into the `'static`
/// closures `scheduler::run_bounded` spawns onto the runtime for
/// fan-out patterns (Workflow-DAG, Parallel, Orchestrator-Workers), while
/// still being a plain borrow-free value for the sequential ones (Chain,
/// Routing, Evaluator-Optimizer, Graph).
#[derive(Clone)]
pub struct StageRunner {
    pub spec: Arc<Spec>,
    pub cache: Arc<AgentCache>,
    pub hooks: Arc<HookDispatcher>,
    pub budget: Arc<BudgetTracker>,
    pub retry_policy: RetryPolicy,
    pub hitl: Arc<HitlGate>,
    /// `None` when the caller doesn't checkpoint at all (most unit tests).
    pub checkpoint: Option<CheckpointHandle>,
}

impl StageRunner {
    /// Runs a single `Stage` (agent step or HITL gate) identified by
    /// `stage_id` (`steps[2]`, `tasks.analysis`, `nodes.review`, ...).
    /// `ctx` is read-only here; the caller merges the result back in.
    pub async fn run_stage(&self, stage_id: &str, stage: &Stage, ctx: &Context) -> Result<Flow<StageResult>> {
        match stage {
            Stage::AgentStep { agent_id, input_template, per_step_vars, tool_overrides } => {
                self.hooks.dispatch(Event::StepStart { stage: stage_id });
                let result = self.run_agent_step(stage_id, agent_id, input_template, per_step_vars.as_ref(), tool_overrides.as_deref(), ctx).await;
                match &result {
                    Ok(_) => self.hooks.dispatch(Event::StepComplete { stage: stage_id }),
                    Err(e) => self.hooks.dispatch(Event::Error { stage: stage_id, message: &e.to_string() }),
                }
                Ok(Flow::Continue(result?))
            }
            Stage::HitlGate { prompt_template, context_display_template, default_response, .. } => {
                let prompt = template::render(prompt_template, ctx, stage_id)?;
                if let Some(display_template) = context_display_template {
                    // Rendered for the handler/caller's benefit; not retained.
                    let _ = template::render(display_template, ctx, stage_id)?;
                }
                match self.hitl.request(stage_id, &prompt).await {
                    HitlDecision::Responded(response) => {
                        Ok(Flow::Continue(StageResult { response, tokens: TokenUsage::default() }))
                    }
                    HitlDecision::Paused => {
                        if let Some(default) = default_response {
                            Ok(Flow::Continue(StageResult { response: default.clone(), tokens: TokenUsage::default() }))
                        } else {
                            self.hooks.dispatch(Event::HitlPause { stage: stage_id });
                            Ok(Flow::Paused { stage: stage_id.to_string() })
                        }
                    }
                }
            }
        }
    }

    async fn run_agent_step(
        &self,
        stage_id: &str,
        agent_id: &AgentId,
        input_template: &str,
        per_step_vars: Option<&serde_json::Value>,
        tool_overrides: Option<&[String]>,
        ctx: &Context,
    ) -> Result<StageResult> {
        let agent_config = self
            .spec
            .agents
            .get(agent_id)
            .ok_or_else(|| EngineError::permanent(stage_id, format!("unknown agent '{agent_id}'")))?;
        let render_ctx = ctx.with_variables_overlay(per_step_vars);
        let prompt = template::render(input_template, &render_ctx, stage_id)?;
        let agent = self.cache.get_or_build(&self.spec.runtime, agent_id, agent_config, tool_overrides).await?;

        let counter = TokenCounter::new(&agent.model_client.model_id);
        let (estimate, _) = counter.count_text(&prompt);
        self.budget.reserve(stage_id, estimate.tokens as u64, self.spec.runtime.budgets.as_ref()).await?;

        let policy = self.retry_policy;
        let response = with_retry(&policy, |_attempt| {
            let agent = agent.clone();
            let prompt = prompt.clone();
            async move { agent.model_client.invoke(&agent, &prompt).await }
        })
        .await?;

        self.budget.record_actual(estimate.tokens as u64, response.token_usage.total()).await;
        Ok(StageResult { response: response.text, tokens: response.token_usage })
    }

    /// Persists `ctx` as having completed through `stage_id`, if this
    /// runner was built with a checkpoint handle. A no-op for runners that
    /// don't checkpoint (most unit tests, and `resume()`-only scenarios
    /// where a pattern has nowhere to write back to).
    pub async fn checkpoint_after(&self, stage_id: &str, ctx: &Context) -> Result<()> {
        match &self.checkpoint {
            Some(handle) => handle.save_after_stage(stage_id, ctx).await,
            None => Ok(()),
        }
    }

    /// Runs `stage`, parsing its response with `parse`. On a parse
    /// failure the stage is re-run up to `max_retries` additional times,
    /// each time with a clarifying instruction appended to the prior
    /// attempt's `input_template` asking the agent to return strict JSON
    /// (`spec.md` §4.9.3: parse failures retry, they don't abort the
    /// pattern on the first bad response). Gives up and returns the last
    /// parse error once `max_retries` is exhausted.
    pub async fn run_stage_with_parse_retry<T>(
        &self,
        stage_id: &str,
        stage: &Stage,
        ctx: &Context,
        max_retries: u32,
        parse: impl Fn(&StageResult) -> Result<T>,
    ) -> Result<Flow<(StageResult, T)>> {
        let mut attempt = 0;
        let mut current_stage = stage.clone();
        loop {
            let result = match self.run_stage(stage_id, &current_stage, ctx).await? {
                Flow::Continue(r) => r,
                Flow::Paused { stage } => return Ok(Flow::Paused { stage }),
            };
            match parse(&result) {
                Ok(value) => return Ok(Flow::Continue((result, value))),
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    current_stage = amend_with_clarification(&current_stage, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Appends a clarifying instruction to an `AgentStep`'s `input_template`
/// asking for strict JSON, for the next parse-retry attempt. Leaves other
/// stage kinds (and their `agent_id`/`per_step_vars`/`tool_overrides`)
/// untouched.
fn amend_with_clarification(stage: &Stage, attempt: u32) -> Stage {
    match stage {
        Stage::AgentStep { agent_id, input_template, per_step_vars, tool_overrides } => Stage::AgentStep {
            agent_id: agent_id.clone(),
            input_template: format!(
                "{input_template}\n\n(Attempt {attempt}: your previous response could not be parsed as JSON. \
                 Respond with ONLY valid JSON matching the requested shape, no surrounding prose.)"
            ),
            per_step_vars: per_step_vars.clone(),
            tool_overrides: tool_overrides.clone(),
        },
        other => other.clone(),
    }
}
