//! Executor (`spec.md` §6.2, the engine's single public entry point).
//!
//! Dispatches a validated `Spec` to one of the seven pattern executors,
//! threading session/checkpoint lifecycle, artifact writing, and the
//! workflow-level hook events around whichever one runs. `run`/`run_async`
//! start a fresh session; `resume` reloads a paused one and hands the
//! human's response to exactly the gate that paused, via
//! `HitlGate::resume_once` — every pattern executor already infers its own
//! resume point from what's present in `ctx` (`spec.md` §4.6), so the
//! executor itself only has to know *that* a pause happened, not *where*.

use crate::artifact::ArtifactWriter;
use crate::cache::AgentCache;
use crate::checkpoint::{now_iso, CheckpointHandle, CheckpointManager, CompatibilityMode, CompatibilityOutcome};
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::hitl::{HitlGate, HitlHandler};
use crate::hooks::{Event, Hook, HookDispatcher};
use crate::pattern::shared::{PatternResult, StageRunner};
use crate::pattern::{chain, evaluator_optimizer, graph, orchestrator_workers, parallel, routing, workflow_dag};
use crate::retry::{BudgetTracker, RetryPolicy};
use crate::runtime::AgentRuntime;
use crate::session::{SessionRecord, SessionStatus, SessionStore};
use crate::spec::{Pattern, Spec};
use std::path::PathBuf;
use std::sync::Arc;

/// `spec.md` §6.2 exit-code table — bit-exact, tests depend on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    Runtime = 10,
    Io = 12,
    Session = 17,
    Unsupported = 18,
    HitlPause = 19,
    Budget = 20,
    Unknown = 70,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Maps an `EngineError` onto its exit code per `spec.md` §7's error
    /// taxonomy table. Errors the table doesn't name an explicit code for
    /// (`RenderError`, `ConditionError`, `GraphError`, routing's
    /// `NoMatch`) fall through to `UNKNOWN`.
    pub fn from_error(err: &EngineError) -> Self {
        match err {
            EngineError::Transient { .. } | EngineError::Permanent { .. } | EngineError::Parse { .. } => ExitCode::Runtime,
            EngineError::Artifact { .. } => ExitCode::Io,
            EngineError::Session { .. } | EngineError::Hitl { .. } => ExitCode::Session,
            EngineError::Capability { .. } | EngineError::Unsupported { .. } => ExitCode::Unsupported,
            EngineError::Budget { .. } => ExitCode::Budget,
            EngineError::Render { .. }
            | EngineError::Condition { .. }
            | EngineError::Graph { .. }
            | EngineError::RoutingNoMatch { .. } => ExitCode::Unknown,
        }
    }
}

/// `spec.md` §3 "RunResult".
#[derive(Debug, Clone)]
pub struct RunResult {
    pub success: bool,
    pub exit_code: ExitCode,
    pub last_response: Option<String>,
    pub session_id: Option<String>,
    pub token_usage: u64,
    pub artifacts_written: Vec<PathBuf>,
    pub execution_context: serde_json::Value,
    pub error: Option<String>,
}

fn last_response_of(ctx: &Context) -> Option<String> {
    ctx.get("last_response").and_then(|v| v.as_str()).map(str::to_string)
}

/// Owns the `Spec`, the agent cache, the checkpoint manager, and the hook
/// registry for a single run (and any later `resume()` of it) — never a
/// global singleton (`spec.md` §9). `close()`-equivalent teardown of the
/// cache happens internally at the end of every `drive()` call, on every
/// exit path (completed, paused, or failed).
pub struct Executor {
    spec: Arc<Spec>,
    checkpoint: Arc<CheckpointManager>,
    cache: Arc<AgentCache>,
    hooks: Arc<HookDispatcher>,
    retry_policy: RetryPolicy,
}

impl Executor {
    pub fn new(
        spec: Spec,
        runtime: Arc<dyn AgentRuntime>,
        session_root: impl Into<PathBuf>,
        compatibility_mode: CompatibilityMode,
    ) -> Self {
        Self {
            spec: Arc::new(spec),
            checkpoint: Arc::new(CheckpointManager::new(SessionStore::new(session_root), compatibility_mode)),
            cache: Arc::new(AgentCache::new(runtime)),
            hooks: Arc::new(HookDispatcher::new()),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Registers an event hook. Must be called before the first `run`/
    /// `run_async`/`resume` call — afterward the hook registry is shared
    /// into pattern executors and can no longer be mutated.
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        Arc::get_mut(&mut self.hooks)
            .expect("with_hook called after the executor started running")
            .register(hook);
        self
    }

    /// Blocking convenience wrapper around [`Executor::run_async`] for
    /// non-async callers (`spec.md` §6.2: "run ... sync or awaitable").
    /// Spins up its own single-threaded runtime — do not call this from
    /// inside a task already driven by a tokio runtime.
    pub fn run(&self, variables: serde_json::Value) -> Result<RunResult> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(EngineError::from)?;
        rt.block_on(self.run_async(variables))
    }

    /// Starts a fresh session in non-interactive HITL mode: a HITL gate
    /// pauses the run and returns `exit_code = HITL_PAUSE` rather than
    /// blocking on a handler.
    pub async fn run_async(&self, variables: serde_json::Value) -> Result<RunResult> {
        self.start(variables, Arc::new(HitlGate::non_interactive())).await
    }

    /// Starts a fresh session where HITL gates are answered in-process by
    /// `handler` (`spec.md` §4.7 "Interactive (in-process)").
    pub async fn run_async_interactive(
        &self,
        variables: serde_json::Value,
        handler: Arc<dyn HitlHandler>,
    ) -> Result<RunResult> {
        self.start(variables, Arc::new(HitlGate::interactive(handler))).await
    }

    async fn start(&self, variables: serde_json::Value, hitl: Arc<HitlGate>) -> Result<RunResult> {
        self.spec.validate_agent_references()?;
        let now = now_iso();
        let mut ctx = Context::new();
        ctx.set_variables(variables);
        ctx.set_spec_meta(&self.spec.name);
        let record = self.checkpoint.create(&self.spec, &ctx, &now).await?;
        self.hooks.dispatch(Event::WorkflowStart { name: &self.spec.name });
        self.drive(record, ctx, hitl).await
    }

    /// Reloads a paused session and continues it. `hitl_response`, when
    /// given, answers the gate the session paused at; omit it to resume a
    /// run whose pause wasn't a HITL gate (there currently is no other
    /// kind, but the signature mirrors `spec.md` §6.2 `resume(session_id,
    /// hitl_response?)`).
    pub async fn resume(&self, session_id: &str, hitl_response: Option<String>) -> Result<RunResult> {
        let record = match self.checkpoint.load(session_id).await {
            Ok(record) => record,
            Err(e) => return Ok(Self::failure_result(None, e)),
        };
        match self.checkpoint.compatibility_check(&record, &self.spec) {
            Ok(CompatibilityOutcome::Match) => {}
            Ok(CompatibilityOutcome::MismatchWarned { expected, found }) => {
                tracing::warn!(expected = %expected, found = %found, "resuming session whose spec hash has changed");
            }
            Err(e) => return Ok(Self::failure_result(Some(record.session_id.clone()), e)),
        }

        let mut ctx = Context::from_value(record.context.clone());
        let hitl = match hitl_response {
            Some(response) => {
                ctx.set_hitl_response(&response);
                Arc::new(HitlGate::resume_once(response))
            }
            None => Arc::new(HitlGate::non_interactive()),
        };
        self.drive(record, ctx, hitl).await
    }

    async fn drive(&self, record: SessionRecord, ctx: Context, hitl: Arc<HitlGate>) -> Result<RunResult> {
        let budget = Arc::new(BudgetTracker::new());
        let resume_node = record.pending_stage.as_deref().and_then(|s| s.strip_prefix("nodes."));
        let checkpoint_handle = CheckpointHandle::new(self.checkpoint.clone(), record.clone());
        let runner = StageRunner {
            spec: self.spec.clone(),
            cache: self.cache.clone(),
            hooks: self.hooks.clone(),
            budget: budget.clone(),
            retry_policy: self.retry_policy,
            hitl,
            checkpoint: Some(checkpoint_handle),
        };

        let outcome = run_pattern(&runner, &self.spec.pattern, ctx, resume_node).await;
        self.cache.close().await;
        let now = now_iso();

        match outcome {
            Ok((ctx, false, paused_at)) => {
                let stage = paused_at.unwrap_or_default();
                let record = self.checkpoint.save_paused(record, &stage, &ctx, &now).await?;
                Ok(RunResult {
                    success: false,
                    exit_code: ExitCode::HitlPause,
                    last_response: last_response_of(&ctx),
                    session_id: Some(record.session_id),
                    token_usage: budget.used().await,
                    artifacts_written: vec![],
                    execution_context: ctx.to_value(),
                    error: None,
                })
            }
            Ok((ctx, true, _)) => {
                let artifacts = match self.write_artifacts(&ctx).await {
                    Ok(paths) => paths,
                    Err(e) => return Ok(self.finish_failed(record, ctx, budget, e).await),
                };
                self.checkpoint.delete(&record.session_id).await?;
                self.hooks.dispatch(Event::WorkflowComplete { name: &self.spec.name });
                Ok(RunResult {
                    success: true,
                    exit_code: ExitCode::Ok,
                    last_response: last_response_of(&ctx),
                    session_id: Some(record.session_id),
                    token_usage: budget.used().await,
                    artifacts_written: artifacts,
                    execution_context: ctx.to_value(),
                    error: None,
                })
            }
            Err((e, ctx)) => Ok(self.finish_failed(record, ctx, budget, e).await),
        }
    }

    async fn finish_failed(&self, record: SessionRecord, ctx: Context, budget: Arc<BudgetTracker>, e: EngineError) -> RunResult {
        self.hooks.dispatch(Event::Error { stage: "workflow", message: &e.to_string() });
        let now = now_iso();
        let record = self
            .checkpoint
            .mark_status(record, SessionStatus::Failed, &now)
            .await
            .unwrap_or_else(|_| SessionRecord {
                session_id: String::new(),
                workflow_name: self.spec.name.clone(),
                spec_hash: self.spec.spec_hash(),
                created_at: now.clone(),
                updated_at: now,
                status: SessionStatus::Failed,
                context: ctx.to_value(),
                last_completed_stage: None,
                pending_stage: None,
            });
        RunResult {
            success: false,
            exit_code: ExitCode::from_error(&e),
            last_response: last_response_of(&ctx),
            session_id: if record.session_id.is_empty() { None } else { Some(record.session_id) },
            token_usage: budget.used().await,
            artifacts_written: vec![],
            execution_context: ctx.to_value(),
            error: Some(e.to_string()),
        }
    }

    fn failure_result(session_id: Option<String>, e: EngineError) -> RunResult {
        RunResult {
            success: false,
            exit_code: ExitCode::from_error(&e),
            last_response: None,
            session_id,
            token_usage: 0,
            artifacts_written: vec![],
            execution_context: serde_json::Value::Null,
            error: Some(e.to_string()),
        }
    }

    async fn write_artifacts(&self, ctx: &Context) -> Result<Vec<PathBuf>> {
        if self.spec.outputs.artifacts.is_empty() {
            return Ok(vec![]);
        }
        let writer = ArtifactWriter::new(&self.spec.output_dir, self.spec.outputs.force_overwrite);
        let mut written = Vec::with_capacity(self.spec.outputs.artifacts.len());
        for (i, artifact) in self.spec.outputs.artifacts.iter().enumerate() {
            let stage = format!("outputs[{i}]");
            written.push(writer.write(artifact, ctx, &stage).await?);
        }
        Ok(written)
    }
}

/// Dispatches to the pattern executor named by `pattern`, normalizing
/// each one's distinct outcome struct into `(context, completed, paused_at)`.
async fn run_pattern(
    runner: &StageRunner,
    pattern: &Pattern,
    ctx: Context,
    resume_node: Option<&str>,
) -> PatternResult<(Context, bool, Option<String>)> {
    match pattern {
        Pattern::Chain { steps } => {
            let resume_from = ctx.len_indexed("steps");
            let outcome = chain::run(runner, steps, ctx, resume_from).await?;
            Ok((outcome.context, outcome.completed, outcome.paused_at))
        }
        Pattern::Workflow { tasks } => {
            let outcome = workflow_dag::run(runner, tasks, ctx).await?;
            Ok((outcome.context, outcome.completed, outcome.paused_at))
        }
        Pattern::Routing(spec) => {
            let outcome = routing::run(runner, spec, ctx).await?;
            Ok((outcome.context, outcome.completed, outcome.paused_at))
        }
        Pattern::Parallel { branches, reduce } => {
            let outcome = parallel::run(runner, branches, reduce.as_ref(), ctx).await?;
            Ok((outcome.context, outcome.completed, outcome.paused_at))
        }
        Pattern::EvaluatorOptimizer { producer, evaluator, accept, revise_prompt } => {
            let outcome = evaluator_optimizer::run(runner, producer, evaluator, accept, revise_prompt, ctx).await?;
            Ok((outcome.context, outcome.completed, outcome.paused_at))
        }
        Pattern::OrchestratorWorkers { orchestrator, limits, worker_template, reduce, writeup, worker_failure_mode } => {
            let outcome = orchestrator_workers::run(
                runner,
                orchestrator,
                limits,
                worker_template,
                reduce.as_ref(),
                writeup.as_ref(),
                *worker_failure_mode,
                ctx,
            )
            .await?;
            Ok((outcome.context, outcome.completed, outcome.paused_at))
        }
        Pattern::Graph { start_node, nodes, max_iterations } => {
            let outcome = graph::run(runner, start_node, nodes, *max_iterations, ctx, resume_node).await?;
            Ok((outcome.context, outcome.completed, outcome.paused_at))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Event;
    use crate::runtime::{AgentResponse, AgentRuntime, StubRuntime, TokenUsage};
    use crate::spec::{AgentConfig, RuntimeConfig, SamplingParams, Stage};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn agent_step(input: &str) -> Stage {
        Stage::AgentStep { agent_id: "writer".into(), input_template: input.into(), per_step_vars: None, tool_overrides: None }
    }

    fn hitl_gate(prompt: &str) -> Stage {
        Stage::HitlGate {
            prompt_template: prompt.into(),
            context_display_template: None,
            default_response: None,
            timeout_seconds: None,
        }
    }

    fn chain_spec(pattern: Pattern) -> Spec {
        Spec {
            name: "demo".into(),
            runtime: RuntimeConfig {
                provider: "stub".into(),
                model_id: "stub-1".into(),
                region: None,
                host: None,
                sampling: SamplingParams::default(),
                max_parallel: 5,
                budgets: None,
            },
            agents: HashMap::from([(
                "writer".to_string(),
                AgentConfig { system_prompt: "write".into(), tools: vec![], model_override: None },
            )]),
            pattern,
            outputs: Default::default(),
            output_dir: "/tmp/out".into(),
        }
    }

    #[tokio::test]
    async fn three_step_chain_completes_and_deletes_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = Pattern::Chain {
            steps: vec![
                agent_step("a {{variables.topic}}"),
                agent_step("b {{steps[0].response}}"),
                agent_step("c {{steps[1].response}}"),
            ],
        };
        let executor = Executor::new(
            chain_spec(pattern),
            Arc::new(StubRuntime::uppercase_echo()),
            dir.path(),
            CompatibilityMode::Strict,
        );
        let result = executor.run_async(serde_json::json!({ "topic": "x" })).await.unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, ExitCode::Ok);
        assert_eq!(result.last_response.as_deref(), Some("C B A X"));

        let session_id = result.session_id.unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load(&session_id).await.is_err());
    }

    #[tokio::test]
    async fn hitl_gate_pauses_then_resume_completes() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = Pattern::Chain {
            steps: vec![agent_step("start"), hitl_gate("approve?"), agent_step("after: {{steps[1].response}}")],
        };
        let executor = Executor::new(
            chain_spec(pattern),
            Arc::new(StubRuntime::uppercase_echo()),
            dir.path(),
            CompatibilityMode::Strict,
        );
        let paused = executor.run_async(serde_json::json!({})).await.unwrap();
        assert_eq!(paused.exit_code, ExitCode::HitlPause);
        let session_id = paused.session_id.unwrap();

        let resumed = executor.resume(&session_id, Some("yes".to_string())).await.unwrap();
        assert!(resumed.success);
        assert_eq!(resumed.exit_code, ExitCode::Ok);
        assert!(resumed.last_response.unwrap().contains("YES"));
    }

    #[tokio::test]
    async fn unknown_agent_reference_is_a_capability_error_before_any_session_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = Pattern::Chain {
            steps: vec![Stage::AgentStep {
                agent_id: "ghost".into(),
                input_template: "x".into(),
                per_step_vars: None,
                tool_overrides: None,
            }],
        };
        let executor = Executor::new(
            chain_spec(pattern),
            Arc::new(StubRuntime::uppercase_echo()),
            dir.path(),
            CompatibilityMode::Strict,
        );
        let err = executor.run_async(serde_json::json!({})).await.unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::Unsupported);
    }

    #[tokio::test]
    async fn budget_exceeded_fails_the_run_with_budget_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = chain_spec(Pattern::Chain { steps: vec![agent_step("a long prompt that costs tokens")] });
        spec.runtime.budgets = Some(crate::spec::TokenBudget { max_tokens: 1 });
        let executor = Executor::new(spec, Arc::new(StubRuntime::uppercase_echo()), dir.path(), CompatibilityMode::Strict);
        let result = executor.run_async(serde_json::json!({})).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, ExitCode::Budget);
    }

    #[tokio::test]
    async fn workflow_complete_hook_fires_on_success() {
        struct RecordingHook(StdMutex<Vec<String>>);
        impl Hook for RecordingHook {
            fn on_event(&self, event: &Event<'_>) -> std::result::Result<(), String> {
                self.0.lock().unwrap().push(format!("{event:?}"));
                Ok(())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(RecordingHook(StdMutex::new(Vec::new())));
        let executor = Executor::new(
            chain_spec(Pattern::Chain { steps: vec![agent_step("hi")] }),
            Arc::new(StubRuntime::uppercase_echo()),
            dir.path(),
            CompatibilityMode::Strict,
        )
        .with_hook(recorder.clone());
        executor.run_async(serde_json::json!({})).await.unwrap();
        let log = recorder.0.lock().unwrap();
        assert!(log.iter().any(|e| e.contains("WorkflowStart")));
        assert!(log.iter().any(|e| e.contains("WorkflowComplete")));
    }

    #[tokio::test]
    async fn graph_resume_continues_from_the_paused_node_without_rerunning_it() {
        struct CountingRuntime {
            calls: std::sync::atomic::AtomicUsize,
        }
        #[async_trait]
        impl AgentRuntime for CountingRuntime {
            async fn invoke(&self, _agent: &crate::runtime::Agent, prompt: &str, _stream: bool) -> Result<AgentResponse> {
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(AgentResponse { text: prompt.to_uppercase(), token_usage: TokenUsage::default() })
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let mut nodes = HashMap::new();
        nodes.insert(
            "gate".to_string(),
            crate::spec::GraphNode { stage: hitl_gate("continue?"), edges: vec![crate::spec::Edge { to: "after".into(), when: None }] },
        );
        nodes.insert("after".to_string(), crate::spec::GraphNode { stage: agent_step("done"), edges: vec![] });
        let pattern = Pattern::Graph { start_node: "gate".into(), nodes, max_iterations: 10 };
        let runtime = Arc::new(CountingRuntime { calls: std::sync::atomic::AtomicUsize::new(0) });
        let executor = Executor::new(chain_spec(pattern), runtime.clone(), dir.path(), CompatibilityMode::Strict);

        let paused = executor.run_async(serde_json::json!({})).await.unwrap();
        assert_eq!(paused.exit_code, ExitCode::HitlPause);
        let session_id = paused.session_id.unwrap();

        let resumed = executor.resume(&session_id, Some("go".to_string())).await.unwrap();
        assert!(resumed.success);
        assert_eq!(runtime.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
