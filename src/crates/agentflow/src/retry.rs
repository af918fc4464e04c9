//! Retry / Budget Enforcer (C10, `spec.md` §4.10, §7).
//!
//! Exponential backoff over the small retryable subset of
//! `EngineError` (`Transient`, `Parse` — see `EngineError::is_retryable`):
//! 3 attempts total, 1s base delay, 2x multiplier, ±20% jitter. The
//! teacher's `langgraph_core::executor::retry` classifies retryability by
//! substring-matching the rendered error message and jitters by
//! `0.5..=1.5`; here retryability is a type-level property of
//! `EngineError` and the jitter window is narrowed to match this engine's
//! stated `±20%` (a deliberate divergence — see `DESIGN.md`).
//!
//! `check_budget` is the companion token-budget gate called before every
//! agent invocation when a `TokenBudget` is configured.

use crate::error::{EngineError, Result};
use crate::spec::TokenBudget;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_secs(1), multiplier: 2.0, jitter: 0.2 }
    }
}

impl RetryPolicy {
    /// Delay before the `attempt`-th retry (1-indexed: `attempt == 1` is
    /// the wait before the second overall call), jittered by ±`jitter`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let unjittered = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64((unjittered * factor).max(0.0))
    }
}

/// Retries `f` under `policy` while the returned error is retryable and
/// attempts remain. Non-retryable errors and the final attempt's error
/// are returned immediately, unchanged (`spec.md` §7: retries never
/// change the error's stage or kind, only how many times it was tried).
pub async fn with_retry<T, Fut, F>(policy: &RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Checks whether `requested` additional tokens would exceed `budget`
/// given `used` so far. A stage with no configured budget is unbounded.
pub fn check_budget(stage: &str, used: u64, requested: u64, budget: Option<&TokenBudget>) -> Result<()> {
    let Some(budget) = budget else { return Ok(()) };
    if used + requested > budget.max_tokens {
        return Err(EngineError::Budget { stage: stage.to_string(), used, requested, max: budget.max_tokens });
    }
    Ok(())
}

/// Cumulative token-usage ledger for one run, shared across every stage
/// invocation. `reserve` is the gate called before an agent invocation;
/// it both checks and debits the budget atomically under one lock so
/// concurrent branches/workers can't both pass the check against a stale
/// total (`spec.md` §4.10).
#[derive(Clone, Default)]
pub struct BudgetTracker(Arc<Mutex<u64>>);

impl BudgetTracker {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(0)))
    }

    pub async fn reserve(&self, stage: &str, requested: u64, budget: Option<&TokenBudget>) -> Result<()> {
        let mut used = self.0.lock().await;
        check_budget(stage, *used, requested, budget)?;
        *used += requested;
        Ok(())
    }

    pub async fn used(&self) -> u64 {
        *self.0.lock().await
    }

    /// Replaces a pre-call estimate with the actual post-call token count.
    /// Called after an invocation returns so the running tally reflects
    /// what the provider actually reported, without a second budget check
    /// (the gate already ran pre-call; this only corrects the ledger).
    pub async fn record_actual(&self, estimated: u64, actual: u64) {
        let mut used = self.0.lock().await;
        *used = used.saturating_sub(estimated).saturating_add(actual);
    }
}
