//! The validated workflow specification (`spec.md` §3 "Data Model").
//!
//! `Spec` is treated as already-validated input: loading raw YAML/JSON and
//! JSON-Schema validation are out of scope for this engine (`spec.md` §1).
//! These types exist so the engine can pattern-match on a typed `Pattern`
//! and so tests/fixtures can construct a `Spec` inline. The discriminated
//! union shape follows the teacher's `PatternConfig` convention
//! (`#[serde(tag = "type", rename_all = "snake_case")]`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub type AgentId = String;
pub type TaskId = String;
pub type BranchId = String;
pub type NodeId = String;
pub type RouteId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudget {
    pub max_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub budgets: Option<TokenBudget>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { temperature: None, top_p: None, max_tokens: None }
    }
}

fn default_max_parallel() -> usize {
    5
}

impl RuntimeConfig {
    /// Canonical hash over (provider, model id, region, host, sampling
    /// params) — the cache key model clients are pooled by (`spec.md` §3
    /// "RuntimeConfig fingerprint").
    pub fn fingerprint(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.provider.hash(&mut hasher);
        self.model_id.hash(&mut hasher);
        self.region.hash(&mut hasher);
        self.host.hash(&mut hasher);
        format!("{:?}", self.sampling.temperature.map(|f| f.to_bits())).hash(&mut hasher);
        format!("{:?}", self.sampling.top_p.map(|f| f.to_bits())).hash(&mut hasher);
        self.sampling.max_tokens.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Per-agent model override; falls back to `Spec::runtime` when absent.
    #[serde(default)]
    pub model_override: Option<String>,
}

impl AgentConfig {
    /// Canonical hash over (agent_id, resolved system prompt, tool list,
    /// resolved model identifier, sampling params) — `spec.md` §3
    /// "AgentConfig fingerprint". Two distinct agent ids never collide
    /// because the id itself is folded into the hash. `tools_override`,
    /// when given, is hashed in place of `self.tools` so a stage's
    /// `tool_overrides` yields a distinct cached `Agent` instead of
    /// silently sharing one built for the agent's default tool list.
    pub fn fingerprint(&self, agent_id: &str, resolved_model: &str, sampling: &SamplingParams, tools_override: Option<&[String]>) -> String {
        let mut hasher = DefaultHasher::new();
        agent_id.hash(&mut hasher);
        self.system_prompt.hash(&mut hasher);
        tools_override.unwrap_or(&self.tools).hash(&mut hasher);
        resolved_model.hash(&mut hasher);
        format!("{:?}", sampling.temperature.map(|f| f.to_bits())).hash(&mut hasher);
        format!("{:?}", sampling.top_p.map(|f| f.to_bits())).hash(&mut hasher);
        sampling.max_tokens.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Either an agent invocation or a human-in-the-loop pause point
/// (`spec.md` §3 "Stage").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stage {
    AgentStep {
        agent_id: AgentId,
        input_template: String,
        #[serde(default)]
        per_step_vars: Option<serde_json::Value>,
        #[serde(default)]
        tool_overrides: Option<Vec<String>>,
    },
    HitlGate {
        prompt_template: String,
        #[serde(default)]
        context_display_template: Option<String>,
        #[serde(default)]
        default_response: Option<String>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondExpr(pub String);

impl CondExpr {
    pub fn is_else(&self) -> bool {
        self.0.trim() == "else"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub to: NodeId,
    #[serde(default)]
    pub when: Option<CondExpr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub stage: Stage,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: TaskId,
    pub stage: Stage,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub id: BranchId,
    pub steps: Vec<Stage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptCriteria {
    pub min_score: f64,
    pub max_iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTemplate {
    pub agent: AgentId,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorLimits {
    pub max_workers: usize,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

fn default_max_rounds() -> usize {
    1
}

/// Unimplemented policy hook named in `spec.md` §9 Open Questions:
/// "orchestrator.worker_failure_mode ∈ {skip, fail} ... default is skip".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFailureMode {
    Skip,
    Fail,
}

impl Default for WorkerFailureMode {
    fn default() -> Self {
        WorkerFailureMode::Skip
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSpec {
    pub router: Stage,
    pub routes: HashMap<RouteId, Vec<Stage>>,
    #[serde(default)]
    pub review_router: Option<Stage>,
    #[serde(default = "default_router_retries")]
    pub max_retries: u32,
}

fn default_router_retries() -> u32 {
    2
}

/// One of the seven orchestration shapes (`spec.md` §3 "Pattern").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pattern {
    Chain {
        steps: Vec<Stage>,
    },
    Workflow {
        tasks: Vec<WorkflowTask>,
    },
    Routing(RouterSpec),
    Parallel {
        branches: Vec<ParallelBranch>,
        #[serde(default)]
        reduce: Option<Stage>,
    },
    EvaluatorOptimizer {
        producer: Stage,
        evaluator: Stage,
        accept: AcceptCriteria,
        revise_prompt: String,
    },
    OrchestratorWorkers {
        orchestrator: Stage,
        limits: OrchestratorLimits,
        worker_template: WorkerTemplate,
        #[serde(default)]
        reduce: Option<Stage>,
        #[serde(default)]
        writeup: Option<Stage>,
        #[serde(default)]
        worker_failure_mode: WorkerFailureMode,
    },
    Graph {
        start_node: NodeId,
        nodes: HashMap<NodeId, GraphNode>,
        max_iterations: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub path_template: String,
    pub content_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsSpec {
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default)]
    pub force_overwrite: bool,
}

impl Default for OutputsSpec {
    fn default() -> Self {
        Self { artifacts: vec![], force_overwrite: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub name: String,
    pub runtime: RuntimeConfig,
    pub agents: HashMap<AgentId, AgentConfig>,
    pub pattern: Pattern,
    #[serde(default)]
    pub outputs: OutputsSpec,
    pub output_dir: String,
}

impl Spec {
    /// Every agent referenced from the pattern must exist in `agents`
    /// (`spec.md` §3 invariant).
    pub fn validate_agent_references(&self) -> crate::error::Result<()> {
        let mut missing = Vec::new();
        self.walk_stages(|stage_path, stage| {
            if let Stage::AgentStep { agent_id, .. } = stage {
                if !self.agents.contains_key(agent_id) {
                    missing.push(format!("{stage_path} references unknown agent '{agent_id}'"));
                }
            }
        });
        if let Pattern::OrchestratorWorkers { worker_template, .. } = &self.pattern {
            if !self.agents.contains_key(&worker_template.agent) {
                missing.push(format!(
                    "worker_template references unknown agent '{}'",
                    worker_template.agent
                ));
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(crate::error::EngineError::Capability { message: missing.join("; ") })
        }
    }

    fn walk_stages(&self, mut visit: impl FnMut(String, &Stage)) {
        match &self.pattern {
            Pattern::Chain { steps } => {
                for (i, s) in steps.iter().enumerate() {
                    visit(format!("steps[{i}]"), s);
                }
            }
            Pattern::Workflow { tasks } => {
                for t in tasks {
                    visit(format!("tasks.{}", t.id), &t.stage);
                }
            }
            Pattern::Routing(r) => {
                visit("router".to_string(), &r.router);
                if let Some(review) = &r.review_router {
                    visit("review_router".to_string(), review);
                }
                for (route_id, steps) in &r.routes {
                    for (i, s) in steps.iter().enumerate() {
                        visit(format!("routes.{route_id}[{i}]"), s);
                    }
                }
            }
            Pattern::Parallel { branches, reduce } => {
                for b in branches {
                    for (i, s) in b.steps.iter().enumerate() {
                        visit(format!("branches.{}[{i}]", b.id), s);
                    }
                }
                if let Some(r) = reduce {
                    visit("reduce".to_string(), r);
                }
            }
            Pattern::EvaluatorOptimizer { producer, evaluator, .. } => {
                visit("producer".to_string(), producer);
                visit("evaluator".to_string(), evaluator);
            }
            Pattern::OrchestratorWorkers { orchestrator, reduce, writeup, .. } => {
                visit("orchestrator".to_string(), orchestrator);
                if let Some(r) = reduce {
                    visit("reduce".to_string(), r);
                }
                if let Some(w) = writeup {
                    visit("writeup".to_string(), w);
                }
            }
            Pattern::Graph { nodes, .. } => {
                for (id, node) in nodes {
                    visit(format!("nodes.{id}"), &node.stage);
                }
            }
        }
    }

    /// Stable content hash used for resume-compatibility checking
    /// (`spec.md` §3 "SpecHash"). Canonicalized via `serde_json`'s
    /// deterministic key ordering for maps backed by `BTreeMap`-free
    /// `serde_json::Value`, so we round-trip through a sorted-key value.
    pub fn spec_hash(&self) -> String {
        let value = serde_json::to_value(self).expect("Spec always serializes");
        let canonical = canonicalize(&value);
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("{");
            for k in keys {
                out.push_str(&format!("{k:?}:{},", canonicalize(&map[k])));
            }
            out.push('}');
            out
        }
        serde_json::Value::Array(arr) => {
            let mut out = String::from("[");
            for v in arr {
                out.push_str(&canonicalize(v));
                out.push(',');
            }
            out.push(']');
            out
        }
        other => other.to_string(),
    }
}
