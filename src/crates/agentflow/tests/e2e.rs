//! The seven end-to-end scenarios named literally as the integration test
//! suite's seed cases.

use agentflow::checkpoint::CompatibilityMode;
use agentflow::engine::{Executor, ExitCode};
use agentflow::error::{EngineError, Result};
use agentflow::runtime::{Agent, AgentResponse, AgentRuntime, StubRuntime, TokenUsage};
use agentflow::spec::{
    AcceptCriteria, AgentConfig, Edge, GraphNode, OrchestratorLimits, ParallelBranch, Pattern, RouterSpec, RuntimeConfig,
    SamplingParams, Spec, Stage, WorkerTemplate, WorkflowTask,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

fn agent_step(agent_id: &str, input: &str) -> Stage {
    Stage::AgentStep { agent_id: agent_id.into(), input_template: input.into(), per_step_vars: None, tool_overrides: None }
}

fn hitl_gate(prompt: &str) -> Stage {
    Stage::HitlGate { prompt_template: prompt.into(), context_display_template: None, default_response: None, timeout_seconds: None }
}

fn base_spec(agents: HashMap<String, AgentConfig>, pattern: Pattern) -> Spec {
    Spec {
        name: "e2e".into(),
        runtime: RuntimeConfig {
            provider: "stub".into(),
            model_id: "stub-1".into(),
            region: None,
            host: None,
            sampling: SamplingParams::default(),
            max_parallel: 4,
            budgets: None,
        },
        agents,
        pattern,
        outputs: Default::default(),
        output_dir: "/tmp/out".into(),
    }
}

fn one_agent(name: &str) -> HashMap<String, AgentConfig> {
    HashMap::from([(name.to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None })])
}

/// Scenario 1: three-step chain, single agent.
#[tokio::test]
async fn three_step_chain_yields_c_b_a_x_and_deletes_session() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = Pattern::Chain {
        steps: vec![
            agent_step("writer", "a {{variables.topic}}"),
            agent_step("writer", "b {{steps[0].response}}"),
            agent_step("writer", "c {{steps[1].response}}"),
        ],
    };
    let executor = Executor::new(
        base_spec(one_agent("writer"), pattern),
        Arc::new(StubRuntime::uppercase_echo()),
        dir.path(),
        CompatibilityMode::Strict,
    );
    let result = executor.run_async(serde_json::json!({"topic": "x"})).await.unwrap();
    assert!(result.success);
    assert_eq!(result.exit_code, ExitCode::Ok);
    assert_eq!(result.last_response.as_deref(), Some("C B A X"));
    assert!(!std::path::Path::new(dir.path()).join(format!("{}.json", result.session_id.unwrap())).exists());
}

/// Scenario 2: DAG fan-out, fan-in. Agent stub echoes `<id>:<input>`.
struct IdEchoRuntime;
#[async_trait]
impl AgentRuntime for IdEchoRuntime {
    async fn invoke(&self, agent: &Agent, prompt: &str, _stream: bool) -> Result<AgentResponse> {
        Ok(AgentResponse { text: format!("{}:{}", agent.agent_id, prompt), token_usage: TokenUsage::default() })
    }
}

#[tokio::test]
async fn dag_fan_out_fan_in_interpolates_both_upstream_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let mut agents = HashMap::new();
    for id in ["A", "B", "C"] {
        agents.insert(id.to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    }
    let tasks = vec![
        WorkflowTask { id: "A".into(), stage: agent_step("A", "in_a"), depends_on: vec![] },
        WorkflowTask { id: "B".into(), stage: agent_step("B", "in_b"), depends_on: vec![] },
        WorkflowTask {
            id: "C".into(),
            stage: agent_step("C", "{{tasks.A.response}}+{{tasks.B.response}}"),
            depends_on: vec!["A".into(), "B".into()],
        },
    ];
    let executor = Executor::new(base_spec(agents, Pattern::Workflow { tasks }), Arc::new(IdEchoRuntime), dir.path(), CompatibilityMode::Strict);
    let result = executor.run_async(serde_json::json!({})).await.unwrap();
    assert!(result.success);
    let c_response = result.execution_context["tasks"]["C"]["response"].as_str().unwrap().to_string();
    assert!(c_response.contains("A:in_a"));
    assert!(c_response.contains("B:in_b"));
}

/// Scenario 3: parallel fail-fast. Branch 2 fails quickly; branches 1 and 3
/// sleep longer and are cancelled before they'd otherwise complete.
struct FailFastRuntime;
#[async_trait]
impl AgentRuntime for FailFastRuntime {
    async fn invoke(&self, agent: &Agent, _prompt: &str, _stream: bool) -> Result<AgentResponse> {
        if agent.agent_id == "flaky" {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            return Err(EngineError::permanent("branches.b2[0]", "boom"));
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        Ok(AgentResponse { text: "done".into(), token_usage: TokenUsage::default() })
    }
}

#[tokio::test]
async fn parallel_fail_fast_fails_the_whole_join_on_first_permanent_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut agents = HashMap::new();
    agents.insert("slow".to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    agents.insert("flaky".to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    let branches = vec![
        ParallelBranch { id: "b1".into(), steps: vec![agent_step("slow", "one")] },
        ParallelBranch { id: "b2".into(), steps: vec![agent_step("flaky", "two")] },
        ParallelBranch { id: "b3".into(), steps: vec![agent_step("slow", "three")] },
    ];
    let executor = Executor::new(
        base_spec(agents, Pattern::Parallel { branches, reduce: None }),
        Arc::new(FailFastRuntime),
        dir.path(),
        CompatibilityMode::Strict,
    );
    let result = executor.run_async(serde_json::json!({})).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.exit_code, ExitCode::Runtime);
    assert!(result.error.unwrap().contains("boom"));
    // The already-running "slow" branches are aborted by run_bounded's
    // fail-fast join; see DESIGN.md for the scope of what a failed run
    // persists about in-flight branch state.
}

/// Scenario 4: evaluator-optimizer convergence. Evaluator stub returns
/// `score = iteration_number * 4` (1-indexed); `accept.min_score = 8` is hit
/// on the second iteration.
struct ConvergingRuntime {
    calls: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl AgentRuntime for ConvergingRuntime {
    async fn invoke(&self, agent: &Agent, _prompt: &str, _stream: bool) -> Result<AgentResponse> {
        if agent.agent_id == "evaluator" {
            let iteration_number = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            let score = iteration_number * 4;
            return Ok(AgentResponse {
                text: serde_json::json!({"score": score, "issues": if score < 8 { vec!["needs more detail"] } else { vec![] }}).to_string(),
                token_usage: TokenUsage::default(),
            });
        }
        Ok(AgentResponse { text: "draft".into(), token_usage: TokenUsage::default() })
    }
}

#[tokio::test]
async fn evaluator_optimizer_converges_after_two_iterations_and_surfaces_final_producer_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut agents = HashMap::new();
    agents.insert("producer".to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    agents.insert("evaluator".to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    let pattern = Pattern::EvaluatorOptimizer {
        producer: agent_step("producer", "draft {{variables.topic}}"),
        evaluator: agent_step("evaluator", "score {{last_response}}"),
        accept: AcceptCriteria { min_score: 8.0, max_iterations: 3 },
        revise_prompt: "revise given: {{feedback}}".into(),
    };
    let runtime = Arc::new(ConvergingRuntime { calls: std::sync::atomic::AtomicU64::new(0) });
    let executor = Executor::new(base_spec(agents, pattern), runtime, dir.path(), CompatibilityMode::Strict);
    let result = executor.run_async(serde_json::json!({"topic": "x"})).await.unwrap();
    assert!(result.success);
    assert_eq!(result.execution_context["iterations"].as_array().unwrap().len(), 2);
    assert_eq!(result.last_response.as_deref(), Some("draft"));
}

/// Scenario 5: graph cycle bound. `A -> B -> A` forever, capped at 5 node
/// executions.
#[tokio::test]
async fn graph_cycle_is_bounded_by_max_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = HashMap::new();
    nodes.insert("A".to_string(), GraphNode { stage: agent_step("looper", "x"), edges: vec![Edge { to: "B".into(), when: None }] });
    nodes.insert("B".to_string(), GraphNode { stage: agent_step("looper", "x"), edges: vec![Edge { to: "A".into(), when: None }] });
    let pattern = Pattern::Graph { start_node: "A".into(), nodes, max_iterations: 5 };
    let executor = Executor::new(
        base_spec(one_agent("looper"), pattern),
        Arc::new(StubRuntime::new(|_| Ok("x".to_string()))),
        dir.path(),
        CompatibilityMode::Strict,
    );
    let result = executor.run_async(serde_json::json!({})).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.exit_code, ExitCode::Unknown);
    assert!(result.error.unwrap().contains("CycleLimit"));
}

/// Scenario 6: HITL pause-and-resume.
#[tokio::test]
async fn hitl_pause_then_resume_with_yes_completes() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = Pattern::Chain {
        steps: vec![agent_step("writer", "start"), hitl_gate("approve?"), agent_step("writer", "after: {{steps[1].response}}")],
    };
    let executor = Executor::new(
        base_spec(one_agent("writer"), pattern),
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

/// Scenario 7: routing with router-review override.
struct RouterReviewRuntime;
#[async_trait]
impl AgentRuntime for RouterReviewRuntime {
    async fn invoke(&self, agent: &Agent, _prompt: &str, _stream: bool) -> Result<AgentResponse> {
        let text = match agent.agent_id.as_str() {
            "router_agent" => r#"{"route": "technical"}"#.to_string(),
            "reviewer" => "route:billing".to_string(),
            _ => "handled".to_string(),
        };
        Ok(AgentResponse { text, token_usage: TokenUsage::default() })
    }
}

#[tokio::test]
async fn router_review_override_wins_and_router_response_is_preserved_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let mut agents = HashMap::new();
    agents.insert("router_agent".to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    agents.insert("reviewer".to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    agents.insert("writer".to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    let router = RouterSpec {
        router: agent_step("router_agent", "classify"),
        routes: HashMap::from([
            ("technical".to_string(), vec![agent_step("writer", "technical reply")]),
            ("billing".to_string(), vec![agent_step("writer", "billing reply")]),
        ]),
        review_router: Some(agent_step("reviewer", "review the pick")),
        max_retries: 2,
    };
    let executor = Executor::new(base_spec(agents, Pattern::Routing(router)), Arc::new(RouterReviewRuntime), dir.path(), CompatibilityMode::Strict);
    let result = executor.run_async(serde_json::json!({})).await.unwrap();
    assert!(result.success);
    assert_eq!(result.execution_context["router"]["chosen_route"], "billing");
    assert_eq!(result.execution_context["router"]["response"], r#"{"route": "technical"}"#);
}

/// Orchestrator-workers, included alongside the seven named scenarios to
/// exercise the one pattern they don't otherwise cover end-to-end.
struct PlannerRuntime;
#[async_trait]
impl AgentRuntime for PlannerRuntime {
    async fn invoke(&self, agent: &Agent, _prompt: &str, _stream: bool) -> Result<AgentResponse> {
        let text = if agent.agent_id == "orchestrator" {
            r#"[{"task": "t1"}, {"task": "t2"}]"#.to_string()
        } else {
            "worker output".to_string()
        };
        Ok(AgentResponse { text, token_usage: TokenUsage::default() })
    }
}

#[tokio::test]
async fn orchestrator_workers_plans_and_runs_then_reduces() {
    let dir = tempfile::tempdir().unwrap();
    let mut agents = HashMap::new();
    agents.insert("orchestrator".to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    agents.insert("worker".to_string(), AgentConfig { system_prompt: "sp".into(), tools: vec![], model_override: None });
    let pattern = Pattern::OrchestratorWorkers {
        orchestrator: agent_step("orchestrator", "plan"),
        limits: OrchestratorLimits { max_workers: 4, max_rounds: 1 },
        worker_template: WorkerTemplate { agent: "worker".into(), tools: None },
        reduce: None,
        writeup: None,
        worker_failure_mode: Default::default(),
    };
    let executor = Executor::new(base_spec(agents, pattern), Arc::new(PlannerRuntime), dir.path(), CompatibilityMode::Strict);
    let result = executor.run_async(serde_json::json!({})).await.unwrap();
    assert!(result.success);
    assert_eq!(result.execution_context["workers"]["0"]["response"], "worker output");
    assert_eq!(result.execution_context["workers"]["1"]["response"], "worker output");
}
