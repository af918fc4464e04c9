//! Orchestrator-Workers: an orchestrator stage plans a list of worker
//! tasks, identical `worker_template` agents run each task concurrently
//! (bounded fan-out, same as Parallel), then optional `reduce`/`writeup`
//! stages run over the collected worker outputs. `worker_failure_mode`
//! controls whether one worker's failure aborts the round (`Fail`) or is
//! recorded and skipped (`Skip`, the default) so the round still produces
//! a result from whichever workers succeeded.

use crate::context::Context;
use crate::error::Result;
use crate::pattern::shared::{Flow, PatternResult, StageResult, StageRunner, DEFAULT_PARSE_RETRIES};
use crate::scheduler::{run_bounded, CancellationToken};
use crate::spec::{OrchestratorLimits, Stage, WorkerFailureMode, WorkerTemplate};
use std::sync::Arc;

pub struct OrchestratorOutcome {
    pub context: Context,
    pub completed: bool,
    pub paused_at: Option<String>,
}

/// One entry of the orchestrator's planned work. `task` is the text handed
/// to the worker as its input; any other fields the orchestrator included
/// are passed through as `variables` in scope for that worker's template
/// (`spec.md` §4.9.6: "additional fields are passed through to workers as
/// variables").
#[derive(serde::Deserialize, Clone)]
struct PlanTask {
    task: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

type Plan = Vec<PlanTask>;

pub async fn run(
    runner: &StageRunner,
    orchestrator: &Stage,
    limits: &OrchestratorLimits,
    worker_template: &WorkerTemplate,
    reduce: Option<&Stage>,
    writeup: Option<&Stage>,
    worker_failure_mode: WorkerFailureMode,
    mut ctx: Context,
) -> PatternResult<OrchestratorOutcome> {
    let start_round = ctx.len_indexed("rounds");

    for round in start_round..limits.max_rounds {
        let orchestrator_id = format!("orchestrator[{round}]");
        let (_plan_result, plan) = match runner
            .run_stage_with_parse_retry(&orchestrator_id, orchestrator, &ctx, DEFAULT_PARSE_RETRIES, parse_plan)
            .await
        {
            Ok(Flow::Continue(pair)) => pair,
            Ok(Flow::Paused { stage }) => return Ok(OrchestratorOutcome { context: ctx, completed: false, paused_at: Some(stage) }),
            Err(e) => return Err((e, ctx)),
        };
        let worker_tasks: Vec<PlanTask> = plan.into_iter().take(limits.max_workers).collect();

        let token = CancellationToken::new();
        let max_parallel = runner.spec.runtime.max_parallel.min(limits.max_workers.max(1));
        let snapshot = Arc::new(ctx.clone());
        let runner_clone = runner.clone();
        let worker_template = worker_template.clone();
        let items: Vec<(usize, PlanTask)> = worker_tasks.into_iter().enumerate().collect();

        let results = match run_bounded(max_parallel, items, token, move |(index, task), _token| {
            let runner = runner_clone.clone();
            let snapshot = snapshot.clone();
            let worker_template = worker_template.clone();
            async move {
                let per_step_vars =
                    if task.extra.is_empty() { None } else { Some(serde_json::Value::Object(task.extra.clone())) };
                let stage = Stage::AgentStep {
                    agent_id: worker_template.agent.clone(),
                    input_template: task.task.clone(),
                    per_step_vars,
                    tool_overrides: worker_template.tools.clone(),
                };
                let stage_id = format!("workers[{index}]");
                let flow = runner.run_stage(&stage_id, &stage, &snapshot).await;
                Ok::<(usize, std::result::Result<Flow<crate::pattern::shared::StageResult>, crate::error::EngineError>), crate::error::EngineError>((index, flow))
            }
        })
        .await
        {
            Ok(results) => results,
            Err(e) => return Err((e, ctx)),
        };

        let mut any_paused = None;
        for (index, outcome) in results {
            match outcome {
                Ok(Flow::Continue(result)) => {
                    ctx.set_keyed(
                        "workers",
                        &index.to_string(),
                        serde_json::json!({ "response": result.response, "tokens": result.tokens.total(), "failed": false }),
                    );
                }
                Ok(Flow::Paused { stage }) => any_paused = Some(stage),
                Err(e) if worker_failure_mode == WorkerFailureMode::Skip => {
                    ctx.set_keyed("workers", &index.to_string(), serde_json::json!({ "failed": true, "error": e.to_string() }));
                }
                Err(e) => return Err((e, ctx)),
            }
        }
        if let Some(stage) = any_paused {
            return Ok(OrchestratorOutcome { context: ctx, completed: false, paused_at: Some(stage) });
        }

        ctx.push_indexed("rounds", serde_json::json!({ "round": round }));
        if let Err(e) = runner.checkpoint_after(&format!("rounds[{round}]"), &ctx).await {
            return Err((e, ctx));
        }
    }

    if let Some(reduce_stage) = reduce {
        match runner.run_stage("reduce", reduce_stage, &ctx).await {
            Ok(Flow::Continue(result)) => {
                ctx.set_last_response(&result.response);
                ctx.set_keyed("reduce", "result", serde_json::json!({ "response": result.response }));
            }
            Ok(Flow::Paused { stage }) => return Ok(OrchestratorOutcome { context: ctx, completed: false, paused_at: Some(stage) }),
            Err(e) => return Err((e, ctx)),
        }
    }

    if let Some(writeup_stage) = writeup {
        match runner.run_stage("writeup", writeup_stage, &ctx).await {
            Ok(Flow::Continue(result)) => {
                ctx.set_last_response(&result.response);
                ctx.set_keyed("writeup", "result", serde_json::json!({ "response": result.response }));
            }
            Ok(Flow::Paused { stage }) => return Ok(OrchestratorOutcome { context: ctx, completed: false, paused_at: Some(stage) }),
            Err(e) => return Err((e, ctx)),
        }
    }

    Ok(OrchestratorOutcome { context: ctx, completed: true, paused_at: None })
}

fn parse_plan(result: &StageResult) -> Result<Plan> {
    crate::parser::parse_json("orchestrator", &result.response, 1)
}
