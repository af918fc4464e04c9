//! Graph: nodes connected by conditional edges, starting at `start_node`.
//! At each node, the first edge whose `when` expression evaluates true is
//! taken (an `else` edge always matches); a node with no matching edge
//! ends the walk. `max_iterations` bounds the total number of node
//! executions so a cyclic graph can never loop forever — exceeding it is
//! `GraphErrorKind::CycleLimit`.

use crate::context::Context;
use crate::error::{EngineError, GraphErrorKind};
use crate::pattern::shared::{Flow, PatternResult, StageRunner};
use crate::spec::{GraphNode, NodeId};
use std::collections::HashMap;

pub struct GraphOutcome {
    pub context: Context,
    pub completed: bool,
    pub paused_at: Option<String>,
}

pub async fn run(
    runner: &StageRunner,
    start_node: &NodeId,
    nodes: &HashMap<NodeId, GraphNode>,
    max_iterations: usize,
    mut ctx: Context,
    resume_node: Option<&str>,
) -> PatternResult<GraphOutcome> {
    let mut current = resume_node.unwrap_or(start_node.as_str()).to_string();
    let mut executed = ctx.len_indexed("node_history");

    loop {
        if executed >= max_iterations {
            return Err((
                EngineError::Graph {
                    stage: format!("nodes.{current}"),
                    kind: GraphErrorKind::CycleLimit { max_iterations, node: current.clone() },
                },
                ctx,
            ));
        }

        let node = match nodes.get(&current) {
            Some(node) => node,
            None => {
                return Err((
                    EngineError::Graph { stage: format!("nodes.{current}"), kind: GraphErrorKind::NoMatch { node: current.clone() } },
                    ctx,
                ))
            }
        };

        let stage_id = format!("nodes.{current}");
        let result = match runner.run_stage(&stage_id, &node.stage, &ctx).await {
            Ok(Flow::Continue(r)) => r,
            Ok(Flow::Paused { stage }) => return Ok(GraphOutcome { context: ctx, completed: false, paused_at: Some(stage) }),
            Err(e) => return Err((e, ctx)),
        };
        ctx.set_last_response(&result.response);
        ctx.set_keyed("nodes", &current, serde_json::json!({ "response": result.response, "tokens": result.tokens.total() }));
        ctx.push_indexed("node_history", serde_json::json!({ "node": current }));
        executed += 1;
        if let Err(e) = runner.checkpoint_after(&stage_id, &ctx).await {
            return Err((e, ctx));
        }

        let mut next = None;
        for edge in &node.edges {
            let matched = match &edge.when {
                Some(cond) => match crate::condition::evaluate(cond, &ctx, &stage_id) {
                    Ok(matched) => matched,
                    Err(e) => return Err((e, ctx)),
                },
                None => true,
            };
            if matched {
                next = Some(edge.to.clone());
                break;
            }
        }

        match next {
            Some(to) => current = to,
            None => return Ok(GraphOutcome { context: ctx, completed: true, paused_at: None }),
        }
    }
}
