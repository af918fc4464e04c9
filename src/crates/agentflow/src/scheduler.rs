//! Scheduler Primitives (C8, `spec.md` §4.8).
//!
//! `run_bounded` is the one concurrency primitive every fan-out pattern
//! (Parallel branches, OrchestratorWorkers workers) goes through: a
//! semaphore caps how many futures are in flight at once, and the join is
//! fail-fast — the first `Err` aborts every task still outstanding and is
//! returned immediately. `CancellationToken` additionally gives
//! long-running task bodies a way to check in and stop cooperatively
//! before their abort signal even arrives.

use crate::error::Result;
use futures::future::select_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs `items` through `f` with at most `max_parallel` concurrently in
/// flight, preserving input order in the returned `Vec`. On the first
/// `Err`, already-spawned tasks that haven't completed are aborted, the
/// token is flipped, and the error is propagated — no partial results are
/// returned on failure (`spec.md` §4.8 "fail-fast join").
pub async fn run_bounded<T, V, Fut, F>(max_parallel: usize, items: Vec<T>, token: CancellationToken, f: F) -> Result<Vec<V>>
where
    T: Send + 'static,
    V: Send + 'static,
    Fut: std::future::Future<Output = Result<V>> + Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let f = Arc::new(f);
    let total = items.len();
    let mut handles: Vec<JoinHandle<(usize, Result<V>)>> = Vec::with_capacity(total);

    for (idx, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let f = f.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            (idx, f(item, token).await)
        }));
    }

    let mut results: Vec<Option<V>> = (0..total).map(|_| None).collect();
    while !handles.is_empty() {
        let (joined, _index, remaining) = select_all(handles).await;
        handles = remaining;
        let (idx, result) = joined.expect("scheduled task panicked");
        match result {
            Ok(value) => results[idx] = Some(value),
            Err(e) => {
                token.cancel();
                for handle in &handles {
                    handle.abort();
                }
                return Err(e);
            }
        }
    }
    Ok(results.into_iter().map(|v| v.expect("every index filled on the success path")).collect())
}
