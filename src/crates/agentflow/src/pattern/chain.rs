//! Chain: a fixed sequence of stages, each one's output available to every
//! later stage through `steps[i]`. The simplest pattern and the one every
//! other executor's stage-running logic (`StageRunner`) was pulled out of.

use crate::context::Context;
use crate::pattern::shared::{Flow, PatternResult, StageRunner};
use crate::spec::Stage;

pub struct ChainOutcome {
    pub context: Context,
    pub completed: bool,
    pub paused_at: Option<String>,
}

/// Runs `steps` in order starting from `ctx`, resuming mid-sequence when
/// `resume_from` names the index of the next step to run (the step after
/// the last one a prior run completed). On failure, returns the partial
/// `Context` built so far alongside the error rather than discarding it.
pub async fn run(runner: &StageRunner, steps: &[Stage], mut ctx: Context, resume_from: usize) -> PatternResult<ChainOutcome> {
    for (i, stage) in steps.iter().enumerate().skip(resume_from) {
        let stage_id = format!("steps[{i}]");
        match runner.run_stage(&stage_id, stage, &ctx).await {
            Ok(Flow::Continue(result)) => {
                ctx.set_last_response(&result.response);
                ctx.push_indexed(
                    "steps",
                    serde_json::json!({ "response": result.response, "tokens": result.tokens.total() }),
                );
                if let Err(e) = runner.checkpoint_after(&stage_id, &ctx).await {
                    return Err((e, ctx));
                }
            }
            Ok(Flow::Paused { stage }) => {
                return Ok(ChainOutcome { context: ctx, completed: false, paused_at: Some(stage) });
            }
            Err(e) => return Err((e, ctx)),
        }
    }
    Ok(ChainOutcome { context: ctx, completed: true, paused_at: None })
}
