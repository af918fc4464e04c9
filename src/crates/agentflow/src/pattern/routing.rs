//! Routing: a router stage picks a route id, then the matching `routes[id]`
//! chain of stages runs (as a nested Chain). An optional `review_router`
//! HITL gate can override the router's pick before the chosen route runs,
//! via the small `approved` / `route:<id>` grammar in `hitl::parse_router_review`.

use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::hitl::{parse_router_review, RouterReviewDecision};
use crate::pattern::shared::{Flow, PatternResult, StageRunner};
use crate::pattern::{chain, shared::StageResult};
use crate::spec::RouterSpec;

pub struct RoutingOutcome {
    pub context: Context,
    pub completed: bool,
    pub paused_at: Option<String>,
}

/// Parses the router's free-form response into a route id. The router's
/// raw text is expected to be (or contain) `{"route": "<id>"}`.
#[derive(serde::Deserialize)]
struct RouteDecision {
    route: String,
}

/// Runs the router (and optional review), resuming from whatever a prior,
/// paused invocation already recorded in `ctx` rather than re-invoking
/// agents that already ran (`spec.md` §4.6 resume policy). `router` in
/// `ctx` holds `{response, chosen_route}` exactly as `spec.md` §3 names it;
/// the nested route chain resumes from `ctx`'s existing `steps` count
/// instead of always restarting the chosen route from its first stage.
pub async fn run(runner: &StageRunner, spec: &RouterSpec, mut ctx: Context) -> PatternResult<RoutingOutcome> {
    let mut route_id = match ctx.get_keyed("router", "chosen_route").and_then(|v| v.as_str()) {
        Some(id) => id.to_string(),
        None => {
            let (router_result, route_id) =
                match runner.run_stage_with_parse_retry("router", &spec.router, &ctx, spec.max_retries, parse_route).await {
                    Ok(Flow::Continue(pair)) => pair,
                    Ok(Flow::Paused { stage }) => {
                        return Ok(RoutingOutcome { context: ctx, completed: false, paused_at: Some(stage) })
                    }
                    Err(e) => return Err((e, ctx)),
                };
            ctx.set_keyed("router", "response", serde_json::json!(router_result.response));
            ctx.set_keyed("router", "chosen_route", serde_json::json!(route_id));
            if let Err(e) = runner.checkpoint_after("router", &ctx).await {
                return Err((e, ctx));
            }
            route_id
        }
    };

    if spec.review_router.is_some() && ctx.get_keyed("router", "review_response").is_none() {
        let review_stage = spec.review_router.as_ref().expect("checked by is_some() above");
        let review_result = match runner.run_stage("review_router", review_stage, &ctx).await {
            Ok(Flow::Continue(r)) => r,
            Ok(Flow::Paused { stage }) => return Ok(RoutingOutcome { context: ctx, completed: false, paused_at: Some(stage) }),
            Err(e) => return Err((e, ctx)),
        };
        match parse_router_review(&review_result.response) {
            Ok(RouterReviewDecision::Approved) => {}
            Ok(RouterReviewDecision::Override(id)) => route_id = id,
            Err(e) => return Err((e, ctx)),
        }
        ctx.set_keyed("router", "review_response", serde_json::json!(review_result.response));
        // `router.response` stays the router's original verbatim output
        // (`spec.md` §8 scenario 7); only `chosen_route` reflects the override.
        ctx.set_keyed("router", "chosen_route", serde_json::json!(route_id));
        if let Err(e) = runner.checkpoint_after("review_router", &ctx).await {
            return Err((e, ctx));
        }
    }

    let steps = match spec.routes.get(&route_id) {
        Some(steps) => steps,
        None => return Err((EngineError::RoutingNoMatch { stage: "router".to_string() }, ctx)),
    };

    let resume_from = ctx.len_indexed("steps");
    let outcome = chain::run(runner, steps, ctx, resume_from).await?;
    Ok(RoutingOutcome { context: outcome.context, completed: outcome.completed, paused_at: outcome.paused_at })
}

fn parse_route(result: &StageResult) -> Result<String> {
    crate::parser::parse_json::<RouteDecision>("router", &result.response, 1).map(|d| d.route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AgentCache;
    use crate::hitl::HitlGate;
    use crate::hooks::HookDispatcher;
    use crate::retry::{BudgetTracker, RetryPolicy};
    use crate::runtime::{AgentResponse, AgentRuntime, TokenUsage};
    use crate::spec::{AgentConfig, Stage};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn agent_step(agent_id: &str, input: &str) -> Stage {
        Stage::AgentStep { agent_id: agent_id.into(), input_template: input.into(), per_step_vars: None, tool_overrides: None }
    }

    fn router_spec() -> RouterSpec {
        RouterSpec {
            router: agent_step("router_agent", "classify"),
            routes: HashMap::from([
                ("billing".to_string(), vec![agent_step("writer", "billing reply")]),
                ("support".to_string(), vec![agent_step("writer", "support reply")]),
            ]),
            review_router: None,
            max_retries: 2,
        }
    }

    struct ScriptedRuntime;

    #[async_trait]
    impl AgentRuntime for ScriptedRuntime {
        async fn invoke(&self, agent: &crate::runtime::Agent, _prompt: &str, _stream: bool) -> Result<AgentResponse> {
            let text = if agent.agent_id == "router_agent" {
                r#"{"route": "billing"}"#.to_string()
            } else {
                "handled".to_string()
            };
            Ok(AgentResponse { text, token_usage: TokenUsage::default() })
        }
    }

    fn make_runner() -> StageRunner {
        let mut agents = HashMap::new();
        agents.insert("router_agent".to_string(), AgentConfig { system_prompt: "route".into(), tools: vec![], model_override: None });
        agents.insert("writer".to_string(), AgentConfig { system_prompt: "write".into(), tools: vec![], model_override: None });
        let spec = crate::spec::Spec {
            name: "demo".into(),
            runtime: crate::spec::RuntimeConfig {
                provider: "stub".into(),
                model_id: "stub-1".into(),
                region: None,
                host: None,
                sampling: Default::default(),
                max_parallel: 4,
                budgets: None,
            },
            agents,
            pattern: crate::spec::Pattern::Routing(router_spec()),
            outputs: Default::default(),
            output_dir: "/tmp/out".into(),
        };
        StageRunner {
            spec: Arc::new(spec),
            cache: Arc::new(AgentCache::new(Arc::new(ScriptedRuntime))),
            hooks: Arc::new(HookDispatcher::new()),
            budget: Arc::new(BudgetTracker::new()),
            retry_policy: RetryPolicy::default(),
            hitl: Arc::new(HitlGate::non_interactive()),
            checkpoint: None,
        }
    }

    #[tokio::test]
    async fn routes_to_the_router_s_chosen_id() {
        let runner = make_runner();
        let outcome = run(&runner, &router_spec(), Context::new()).await.unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.context.get_indexed("steps", 0).unwrap()["response"], "handled");
    }

    #[tokio::test]
    async fn unknown_route_is_routing_no_match() {
        let runner = make_runner();
        let mut spec = router_spec();
        spec.routes.remove("billing");
        let (err, _ctx) = run(&runner, &spec, Context::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::RoutingNoMatch { .. }));
    }

    #[tokio::test]
    async fn retries_router_parse_failure_before_giving_up() {
        struct FlakyParseRuntime {
            calls: std::sync::atomic::AtomicUsize,
        }
        #[async_trait]
        impl AgentRuntime for FlakyParseRuntime {
            async fn invoke(&self, agent: &crate::runtime::Agent, _prompt: &str, _stream: bool) -> Result<AgentResponse> {
                let text = if agent.agent_id == "router_agent" {
                    let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n == 0 { "not json at all".to_string() } else { r#"{"route": "support"}"#.to_string() }
                } else {
                    "handled".to_string()
                };
                Ok(AgentResponse { text, token_usage: TokenUsage::default() })
            }
        }
        let mut runner = make_runner();
        runner.cache = Arc::new(AgentCache::new(Arc::new(FlakyParseRuntime { calls: std::sync::atomic::AtomicUsize::new(0) })));
        let outcome = run(&runner, &router_spec(), Context::new()).await.unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.context.get_keyed("router", "chosen_route").unwrap(), "support");
    }

    #[tokio::test]
    async fn gives_up_after_max_retries_of_malformed_router_responses() {
        struct AlwaysBadRuntime;
        #[async_trait]
        impl AgentRuntime for AlwaysBadRuntime {
            async fn invoke(&self, _agent: &crate::runtime::Agent, _prompt: &str, _stream: bool) -> Result<AgentResponse> {
                Ok(AgentResponse { text: "still not json".to_string(), token_usage: TokenUsage::default() })
            }
        }
        let mut runner = make_runner();
        runner.cache = Arc::new(AgentCache::new(Arc::new(AlwaysBadRuntime)));
        let (err, _ctx) = run(&runner, &router_spec(), Context::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Parse { .. }));
    }

    #[tokio::test]
    async fn review_router_override_wins_over_router_pick() {
        let runner_template = make_runner();
        struct ReviewRuntime;
        #[async_trait]
        impl AgentRuntime for ReviewRuntime {
            async fn invoke(&self, agent: &crate::runtime::Agent, _prompt: &str, _stream: bool) -> Result<AgentResponse> {
                let text = match agent.agent_id.as_str() {
                    "router_agent" => r#"{"route": "billing"}"#.to_string(),
                    "reviewer" => "route:support".to_string(),
                    _ => "handled".to_string(),
                };
                Ok(AgentResponse { text, token_usage: TokenUsage::default() })
            }
        }
        let mut spec = (*runner_template.spec).clone();
        spec.agents.insert("reviewer".to_string(), AgentConfig { system_prompt: "review".into(), tools: vec![], model_override: None });
        let mut router = router_spec();
        router.review_router = Some(agent_step("reviewer", "review the pick"));
        spec.pattern = crate::spec::Pattern::Routing(router.clone());

        let runner = StageRunner {
            spec: Arc::new(spec),
            cache: Arc::new(AgentCache::new(Arc::new(ReviewRuntime))),
            hooks: runner_template.hooks.clone(),
            budget: Arc::new(BudgetTracker::new()),
            retry_policy: RetryPolicy::default(),
            hitl: runner_template.hitl.clone(),
            checkpoint: None,
        };
        let outcome = run(&runner, &router, Context::new()).await.unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.context.get_indexed("steps", 0).unwrap()["response"], "handled");
    }
}
