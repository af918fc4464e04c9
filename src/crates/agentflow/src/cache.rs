//! Agent Cache (C3, `spec.md` §4.3).
//!
//! Deduplicates agent instances by `AgentConfig` fingerprint and pools
//! model clients by `RuntimeConfig` fingerprint with bounded LRU capacity
//! (recommended 16). Concurrent calls with the same fingerprint return the
//! same instance (single-flight build, via `tokio::sync::OnceCell` per
//! fingerprint) — the shape is the teacher's `Cache<K, V>`
//! (`langgraph_core::cache`) `get_or_compute` pattern, narrowed from a
//! generic TTL/metrics cache to the two concrete keys this engine needs.

use crate::error::{EngineError, Result};
use crate::runtime::{Agent, AgentRuntime, ModelClient};
use crate::spec::{AgentConfig, RuntimeConfig, SamplingParams};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

const DEFAULT_MODEL_CLIENT_CAPACITY: usize = 16;

struct AgentSlot {
    once: OnceCell<Agent>,
}

struct ModelClientEntry {
    fingerprint: String,
    client: ModelClient,
}

/// Owned by a single `Executor`/run; never a global singleton
/// (`spec.md` §9: "explicit object owned by the Executor"). `close()`
/// must run on every exit path of that owner.
pub struct AgentCache {
    runtime: Arc<dyn AgentRuntime>,
    agents: Mutex<std::collections::HashMap<String, Arc<AgentSlot>>>,
    model_clients: Mutex<VecDeque<ModelClientEntry>>,
    model_client_capacity: usize,
}

impl AgentCache {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            runtime,
            agents: Mutex::new(std::collections::HashMap::new()),
            model_clients: Mutex::new(VecDeque::new()),
            model_client_capacity: DEFAULT_MODEL_CLIENT_CAPACITY,
        }
    }

    pub fn with_model_client_capacity(mut self, capacity: usize) -> Self {
        self.model_client_capacity = capacity.max(1);
        self
    }

    /// Canonical entry point (`spec.md` §4.3 "get_or_build"). Resolves the
    /// agent's effective model, fingerprints the resolved config, and
    /// either returns the cached instance or builds it exactly once even
    /// under concurrent callers. `tool_overrides`, when given (a stage's
    /// `tool_overrides` or a worker template's `tools`), replaces the
    /// agent's configured tool list for the built `Agent` and is folded
    /// into the fingerprint so it never collides with the agent's default
    /// build.
    pub async fn get_or_build(
        &self,
        runtime_cfg: &RuntimeConfig,
        agent_id: &str,
        config: &AgentConfig,
        tool_overrides: Option<&[String]>,
    ) -> Result<Agent> {
        let resolved_model = config.model_override.clone().unwrap_or_else(|| runtime_cfg.model_id.clone());
        let fingerprint = config.fingerprint(agent_id, &resolved_model, &runtime_cfg.sampling, tool_overrides);
        let tools = tool_overrides.map(|t| t.to_vec()).unwrap_or_else(|| config.tools.clone());

        let slot = {
            let mut agents = self.agents.lock().await;
            agents
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(AgentSlot { once: OnceCell::new() }))
                .clone()
        };

        let agent = slot
            .once
            .get_or_try_init(|| async {
                let mut client_runtime_cfg = runtime_cfg.clone();
                client_runtime_cfg.model_id = resolved_model.clone();
                let model_client = self.get_model_client(&client_runtime_cfg).await?;
                Ok::<Agent, EngineError>(Agent {
                    fingerprint: fingerprint.clone(),
                    agent_id: agent_id.to_string(),
                    system_prompt: config.system_prompt.clone(),
                    tools,
                    model_client,
                })
            })
            .await?;
        Ok(agent.clone())
    }

    /// `spec.md` §4.3 "get_model_client" — LRU pool by `RuntimeConfig`
    /// fingerprint. Eviction closes the displaced client before releasing
    /// it (§4.3 invariant).
    pub async fn get_model_client(&self, runtime_cfg: &RuntimeConfig) -> Result<ModelClient> {
        let fingerprint = runtime_cfg.fingerprint();
        let mut pool = self.model_clients.lock().await;

        if let Some(pos) = pool.iter().position(|e| e.fingerprint == fingerprint) {
            let entry = pool.remove(pos).expect("position just checked");
            pool.push_back(ModelClientEntry { fingerprint: entry.fingerprint.clone(), client: entry.client.clone() });
            return Ok(entry.client);
        }

        let client =
            ModelClient::new(fingerprint.clone(), runtime_cfg.provider.clone(), runtime_cfg.model_id.clone(), self.runtime.clone());

        if pool.len() >= self.model_client_capacity {
            if let Some(evicted) = pool.pop_front() {
                evicted.client.close().await;
            }
        }
        pool.push_back(ModelClientEntry { fingerprint, client: client.clone() });
        Ok(client)
    }

    /// Idempotent teardown: closes every tracked model client
    /// (`spec.md` §4.3 "close()").
    pub async fn close(&self) {
        let mut pool = self.model_clients.lock().await;
        for entry in pool.drain(..) {
            entry.client.close().await;
        }
    }
}
