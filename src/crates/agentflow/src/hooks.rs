//! Hook / Event Dispatcher (C11, `spec.md` §4.11).
//!
//! Synchronous lifecycle callbacks fired at each stage boundary, called
//! in registration order. A hook that errors or panics is logged and
//! skipped — it never aborts the run (`spec.md` §4.11 invariant: "hooks
//! observe, they do not participate").

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Event<'a> {
    WorkflowStart { name: &'a str },
    WorkflowComplete { name: &'a str },
    StepStart { stage: &'a str },
    StepComplete { stage: &'a str },
    TaskStart { task_id: &'a str },
    TaskComplete { task_id: &'a str },
    BranchStart { branch_id: &'a str },
    BranchComplete { branch_id: &'a str },
    NodeStart { node_id: &'a str },
    NodeComplete { node_id: &'a str },
    HitlPause { stage: &'a str },
    Error { stage: &'a str, message: &'a str },
}

pub trait Hook: Send + Sync {
    fn on_event(&self, event: &Event<'_>) -> std::result::Result<(), String>;
}

#[derive(Default)]
pub struct HookDispatcher {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Hooks fire in the order they were registered (`spec.md` §4.11).
    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn dispatch(&self, event: Event<'_>) {
        for hook in &self.hooks {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| hook.on_event(&event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    tracing::warn!(event = ?event, error = %message, "hook returned an error; continuing")
                }
                Err(_) => tracing::warn!(event = ?event, "hook panicked; continuing"),
            }
        }
    }
}
