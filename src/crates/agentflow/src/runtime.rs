//! The `AgentRuntime` capability the core consumes but never implements
//! (`spec.md` §1, §6.1). Provider adapters (Bedrock, OpenAI, Ollama,
//! Gemini, ...) live outside this crate; this module only defines the
//! trait boundary and the small value types that cross it.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
    }
}

#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub text: String,
    pub token_usage: TokenUsage,
}

/// A resolved, cacheable agent: a (system prompt, model client, tool
/// binding) triple identified by its config fingerprint (`spec.md`
/// GLOSSARY "Agent").
#[derive(Clone)]
pub struct Agent {
    pub fingerprint: String,
    pub agent_id: String,
    pub system_prompt: String,
    pub tools: Vec<String>,
    pub model_client: ModelClient,
}

/// A pooled model client, keyed by `RuntimeConfig` fingerprint.
#[derive(Clone)]
pub struct ModelClient {
    pub fingerprint: String,
    pub provider: String,
    pub model_id: String,
    runtime: Arc<dyn AgentRuntime>,
}

impl ModelClient {
    pub fn new(fingerprint: String, provider: String, model_id: String, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self { fingerprint, provider, model_id, runtime }
    }

    pub async fn invoke(&self, agent: &Agent, prompt: &str) -> Result<AgentResponse> {
        self.runtime.invoke(agent, prompt, false).await
    }

    /// Cooperative teardown hook; called once per client on cache close
    /// (`spec.md` §4.3 "close()").
    pub async fn close(&self) {
        self.runtime.close_client(&self.fingerprint).await;
    }
}

/// `spec.md` §6.1:
/// ```text
/// invoke(agent, prompt, stream=false) → { response, token_usage }
///   | TransientError | PermanentError
/// ```
/// The core never speaks to LLM APIs directly; it only calls through this
/// trait. Implementations are provided by provider adapters, which this
/// crate does not contain.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(&self, agent: &Agent, prompt: &str, stream: bool) -> Result<AgentResponse>;

    /// Release any resources (HTTP connections, etc.) held for a pooled
    /// client. Default no-op for runtimes with nothing to release.
    async fn close_client(&self, _fingerprint: &str) {}
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Deterministic in-memory stub used throughout the test suite
/// (`spec.md` §8 scenarios all rely on a deterministic agent). Mirrors
/// the teacher's `MockChatModel` pattern from `router/llm_router.rs`:
/// a closure producing the canned behavior, boxed behind the trait.
pub struct StubRuntime {
    respond: Arc<dyn Fn(&str) -> std::result::Result<String, String> + Send + Sync>,
}

impl StubRuntime {
    pub fn new(respond: impl Fn(&str) -> std::result::Result<String, String> + Send + Sync + 'static) -> Self {
        Self { respond: Arc::new(respond) }
    }

    /// Echoes the prompt verbatim, upper-cased — used by the chain/DAG
    /// end-to-end scenarios in `spec.md` §8.
    pub fn uppercase_echo() -> Self {
        Self::new(|prompt| Ok(prompt.to_uppercase()))
    }
}

#[async_trait]
impl AgentRuntime for StubRuntime {
    async fn invoke(&self, _agent: &Agent, prompt: &str, _stream: bool) -> Result<AgentResponse> {
        match (self.respond)(prompt) {
            Ok(text) => {
                let approx_tokens = (text.len() / 4).max(1) as u64;
                Ok(AgentResponse {
                    text,
                    token_usage: TokenUsage { input: (prompt.len() / 4).max(1) as u64, output: approx_tokens },
                })
            }
            Err(message) => Err(EngineError::permanent("stub", message)),
        }
    }
}
