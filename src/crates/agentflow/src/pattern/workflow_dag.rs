//! Workflow-DAG: tasks with `depends_on` edges, executed in topological
//! batches. Every task whose dependencies have all completed is eligible to
//! run in the same batch; batches run bounded-concurrent via `run_bounded`,
//! so independent branches of the graph genuinely run in parallel while
//! dependent ones wait. Tasks within the same batch never observe each
//! other's output — only tasks from earlier, already-merged batches are
//! visible through `tasks[id]`.

use crate::context::Context;
use crate::error::EngineError;
use crate::pattern::shared::{Flow, PatternResult, StageRunner};
use crate::scheduler::{run_bounded, CancellationToken};
use crate::spec::WorkflowTask;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct WorkflowOutcome {
    pub context: Context,
    pub completed: bool,
    pub paused_at: Option<String>,
}

/// Validates the whole task graph before any stage runs (`spec.md` §4.9.2
/// step 1): every `depends_on` id must name a real task, and the graph must
/// be acyclic. Uses Kahn's algorithm — repeatedly remove indegree-0 nodes —
/// so a cycle is reported as "every task still left standing" rather than
/// being discovered only once the per-batch `ready` set happens to go empty.
fn validate_dag(tasks: &[WorkflowTask]) -> std::result::Result<(), EngineError> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(EngineError::permanent(
                    "workflow",
                    format!("task '{}' depends on unknown task '{}'", task.id, dep),
                ));
            }
        }
    }

    let mut indegree: HashMap<&str, usize> = tasks.iter().map(|t| (t.id.as_str(), t.depends_on.len())).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.depends_on {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    let mut queue: Vec<&str> = tasks.iter().filter(|t| t.depends_on.is_empty()).map(|t| t.id.as_str()).collect();
    queue.sort_unstable();
    let mut visited = 0usize;
    let mut i = 0;
    while i < queue.len() {
        let current = queue[i];
        i += 1;
        visited += 1;
        if let Some(deps) = dependents.get(current) {
            let mut newly_ready: Vec<&str> = Vec::new();
            for &dep in deps {
                let entry = indegree.get_mut(dep).expect("dependents only reference known tasks");
                *entry -= 1;
                if *entry == 0 {
                    newly_ready.push(dep);
                }
            }
            newly_ready.sort_unstable();
            queue.extend(newly_ready);
        }
    }

    if visited < tasks.len() {
        let stuck: Vec<&str> =
            tasks.iter().map(|t| t.id.as_str()).filter(|id| indegree.get(id).copied().unwrap_or(0) > 0).collect();
        return Err(EngineError::permanent("workflow", format!("dependency cycle detected among tasks: {stuck:?}")));
    }
    Ok(())
}

/// Runs `tasks` to completion, skipping any task id already present under
/// the `tasks` namespace in `ctx` (resume support — a task is either fully
/// done or was never started, matching this pattern's at-least-once resume
/// semantics).
pub async fn run(runner: &StageRunner, tasks: &[WorkflowTask], mut ctx: Context) -> PatternResult<WorkflowOutcome> {
    if let Err(e) = validate_dag(tasks) {
        return Err((e, ctx));
    }

    let mut done: HashSet<String> = tasks
        .iter()
        .map(|t| t.id.clone())
        .filter(|id| ctx.get_keyed("tasks", id).is_some())
        .collect();

    while done.len() < tasks.len() {
        let mut ready: Vec<WorkflowTask> =
            tasks.iter().filter(|t| !done.contains(&t.id) && t.depends_on.iter().all(|d| done.contains(d))).cloned().collect();
        // `validate_dag` already guarantees the graph is acyclic and every
        // dependency exists, so a ready batch is never empty here; the
        // deterministic tie-break (`spec.md` §4.9.2) still requires a stable
        // submission order within the batch.
        ready.sort_by(|a, b| a.id.cmp(&b.id));

        let token = CancellationToken::new();
        let max_parallel = runner.spec.runtime.max_parallel;
        let snapshot = Arc::new(ctx.clone());
        let runner_clone = runner.clone();
        let results = match run_bounded(max_parallel, ready, token, move |task, _token| {
            let runner = runner_clone.clone();
            let snapshot = snapshot.clone();
            async move {
                let stage_id = format!("tasks.{}", task.id);
                let flow = runner.run_stage(&stage_id, &task.stage, &snapshot).await?;
                Ok::<(String, Flow<crate::pattern::shared::StageResult>), EngineError>((task.id, flow))
            }
        })
        .await
        {
            Ok(results) => results,
            Err(e) => return Err((e, ctx)),
        };

        for (task_id, flow) in results {
            match flow {
                Flow::Continue(result) => {
                    ctx.set_keyed("tasks", &task_id, serde_json::json!({ "response": result.response, "tokens": result.tokens.total() }));
                    done.insert(task_id.clone());
                    if let Err(e) = runner.checkpoint_after(&format!("tasks.{task_id}"), &ctx).await {
                        return Err((e, ctx));
                    }
                }
                Flow::Paused { stage } => {
                    return Ok(WorkflowOutcome { context: ctx, completed: false, paused_at: Some(stage) });
                }
            }
        }
    }
    Ok(WorkflowOutcome { context: ctx, completed: true, paused_at: None })
}
