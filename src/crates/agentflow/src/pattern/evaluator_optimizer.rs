//! Evaluator-Optimizer: a producer stage generates a draft, an evaluator
//! stage scores it; while the score is below `accept.min_score` and the
//! iteration cap hasn't been hit, the producer revises using
//! `revise_prompt` and the evaluator's feedback. Every iteration is
//! recorded under `iterations[i]` so a resumed run picks up mid-loop.

use crate::context::Context;
use crate::error::Result;
use crate::pattern::shared::{Flow, PatternResult, StageResult, StageRunner, DEFAULT_PARSE_RETRIES};
use crate::spec::{AcceptCriteria, Stage};

pub struct EvaluatorOutcome {
    pub context: Context,
    pub completed: bool,
    pub paused_at: Option<String>,
}

#[derive(serde::Deserialize)]
struct Evaluation {
    score: f64,
    #[serde(default)]
    issues: Vec<String>,
}

pub async fn run(
    runner: &StageRunner,
    producer: &Stage,
    evaluator: &Stage,
    accept: &AcceptCriteria,
    revise_prompt: &str,
    mut ctx: Context,
) -> PatternResult<EvaluatorOutcome> {
    let mut iteration = ctx.len_indexed("iterations");
    let mut revision_notes: Option<String> = None;

    loop {
        let producer_stage = match &revision_notes {
            Some(notes) => revised_producer_stage(producer, revise_prompt, notes),
            None => producer.clone(),
        };
        let producer_id = format!("producer[{iteration}]");
        let producer_result = match runner.run_stage(&producer_id, &producer_stage, &ctx).await {
            Ok(Flow::Continue(r)) => r,
            Ok(Flow::Paused { stage }) => return Ok(EvaluatorOutcome { context: ctx, completed: false, paused_at: Some(stage) }),
            Err(e) => return Err((e, ctx)),
        };
        ctx.set_last_response(&producer_result.response);

        let evaluator_id = format!("evaluator[{iteration}]");
        let (_evaluator_result, evaluation) = match runner
            .run_stage_with_parse_retry(&evaluator_id, evaluator, &ctx, DEFAULT_PARSE_RETRIES, parse_evaluation)
            .await
        {
            Ok(Flow::Continue(pair)) => pair,
            Ok(Flow::Paused { stage }) => return Ok(EvaluatorOutcome { context: ctx, completed: false, paused_at: Some(stage) }),
            Err(e) => return Err((e, ctx)),
        };

        ctx.push_indexed(
            "iterations",
            serde_json::json!({
                "response": producer_result.response,
                "score": evaluation.score,
                "issues": evaluation.issues,
            }),
        );
        let stage_id = format!("iterations[{iteration}]");
        if let Err(e) = runner.checkpoint_after(&stage_id, &ctx).await {
            return Err((e, ctx));
        }

        if evaluation.score >= accept.min_score || iteration + 1 >= accept.max_iterations {
            return Ok(EvaluatorOutcome { context: ctx, completed: true, paused_at: None });
        }

        revision_notes = Some(evaluation.issues.join("; "));
        iteration += 1;
    }
}

fn parse_evaluation(result: &StageResult) -> Result<Evaluation> {
    crate::parser::parse_json("evaluator", &result.response, 1)
}

fn revised_producer_stage(producer: &Stage, revise_prompt: &str, notes: &str) -> Stage {
    match producer {
        Stage::AgentStep { agent_id, per_step_vars, tool_overrides, .. } => Stage::AgentStep {
            agent_id: agent_id.clone(),
            input_template: revise_prompt.replace("{{feedback}}", notes),
            per_step_vars: per_step_vars.clone(),
            tool_overrides: tool_overrides.clone(),
        },
        other => other.clone(),
    }
}
