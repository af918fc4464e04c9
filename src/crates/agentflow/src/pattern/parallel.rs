//! Parallel: independent branches, each its own nested Chain, run
//! concurrently bounded by `runtime.max_parallel`. The join is fail-fast —
//! the first branch to fail aborts every branch still running — and an
//! optional `reduce` stage runs afterward with every branch's final
//! response visible under `branches[id]`.

use crate::context::Context;
use crate::pattern::shared::{Flow, PatternResult, StageRunner};
use crate::scheduler::{run_bounded, CancellationToken};
use crate::spec::{ParallelBranch, Stage};
use std::sync::Arc;

pub struct ParallelOutcome {
    pub context: Context,
    pub completed: bool,
    pub paused_at: Option<String>,
}

pub async fn run(
    runner: &StageRunner,
    branches: &[ParallelBranch],
    reduce: Option<&Stage>,
    mut ctx: Context,
) -> PatternResult<ParallelOutcome> {
    let already_done: std::collections::HashSet<String> =
        branches.iter().map(|b| b.id.clone()).filter(|id| ctx.get_keyed("branches", id).is_some()).collect();
    let pending: Vec<ParallelBranch> = branches.iter().filter(|b| !already_done.contains(&b.id)).cloned().collect();

    if !pending.is_empty() {
        let token = CancellationToken::new();
        let max_parallel = runner.spec.runtime.max_parallel;
        let snapshot = Arc::new(ctx.clone());
        let runner_clone = runner.clone();
        let results = match run_bounded(max_parallel, pending, token, move |branch, _token| {
            let runner = runner_clone.clone();
            let snapshot = snapshot.clone();
            async move {
                let mut branch_ctx = (*snapshot).clone();
                let stage_id_prefix = format!("branches.{}", branch.id);
                let mut last_response = String::new();
                let mut last_tokens = 0u64;
                for (i, stage) in branch.steps.iter().enumerate() {
                    let stage_id = format!("{stage_id_prefix}[{i}]");
                    match runner.run_stage(&stage_id, stage, &branch_ctx).await? {
                        Flow::Continue(result) => {
                            last_response = result.response.clone();
                            last_tokens = result.tokens.total();
                            branch_ctx.set_last_response(&result.response);
                            branch_ctx.push_indexed(&stage_id_prefix, serde_json::json!({ "response": result.response, "tokens": result.tokens.total() }));
                        }
                        Flow::Paused { stage } => {
                            return Ok::<(String, Option<(String, u64)>, Option<String>), crate::error::EngineError>((
                                branch.id.clone(),
                                None,
                                Some(stage),
                            ));
                        }
                    }
                }
                Ok((branch.id.clone(), Some((last_response, last_tokens)), None))
            }
        })
        .await
        {
            // `run_bounded` is fail-fast and gives up every branch's partial
            // result on the first error (`scheduler::run_bounded` doc
            // comment); `ctx` here is still exactly what it was before this
            // round's branches started, which already reflects every branch
            // a *prior* resumed invocation completed (`already_done` above).
            Ok(results) => results,
            Err(e) => return Err((e, ctx)),
        };

        for (branch_id, outcome, paused_at) in results {
            if let Some(stage) = paused_at {
                return Ok(ParallelOutcome { context: ctx, completed: false, paused_at: Some(stage) });
            }
            if let Some((response, tokens)) = outcome {
                ctx.set_keyed("branches", &branch_id, serde_json::json!({ "response": response, "tokens": tokens }));
                if let Err(e) = runner.checkpoint_after(&format!("branches.{branch_id}"), &ctx).await {
                    return Err((e, ctx));
                }
            }
        }
    }

    if let Some(reduce_stage) = reduce {
        match runner.run_stage("reduce", reduce_stage, &ctx).await {
            Ok(Flow::Continue(result)) => {
                ctx.set_last_response(&result.response);
                ctx.set_keyed("reduce", "result", serde_json::json!({ "response": result.response, "tokens": result.tokens.total() }));
            }
            Ok(Flow::Paused { stage }) => {
                return Ok(ParallelOutcome { context: ctx, completed: false, paused_at: Some(stage) });
            }
            Err(e) => return Err((e, ctx)),
        }
    }

    Ok(ParallelOutcome { context: ctx, completed: true, paused_at: None })
}
