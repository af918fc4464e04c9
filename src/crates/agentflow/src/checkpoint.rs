//! Checkpoint Manager (C6, `spec.md` §4.6).
//!
//! A thin layer over `SessionStore`: a checkpoint IS the session record at
//! rest. `save_after_stage` is called once per completed stage so a crash
//! mid-run resumes no earlier than the last fully-applied stage
//! (`spec.md` §4.6 "at-least-once resume", not exactly-once — Non-goal).
//! `compatibility_check` guards against resuming a session whose spec has
//! since changed underneath it.

use crate::context::Context;
use crate::error::{EngineError, Result, SessionErrorKind};
use crate::session::{SessionRecord, SessionStatus, SessionStore};
use crate::spec::Spec;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Centralizes the timestamp every checkpoint write is stamped with, so
/// `CheckpointManager`/`CheckpointHandle` callers never hand-roll their own.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `spec.md` §9 Open Question: "checkpoint.compatibility_mode ∈ {warn, strict}".
/// Decided here as a constructor parameter rather than a global — see
/// `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityMode {
    Warn,
    Strict,
}

pub struct CheckpointManager {
    store: SessionStore,
    mode: CompatibilityMode,
}

impl CheckpointManager {
    pub fn new(store: SessionStore, mode: CompatibilityMode) -> Self {
        Self { store, mode }
    }

    pub async fn create(&self, spec: &Spec, ctx: &Context, now: &str) -> Result<SessionRecord> {
        self.store.create(spec, ctx, now).await
    }

    /// Persists the context and marks `stage_id` as the last completed
    /// stage. Called once per stage on the hot path, so this must not
    /// fail silently: callers propagate its error like any other stage
    /// error (`spec.md` §4.6).
    pub async fn save_after_stage(
        &self,
        mut record: SessionRecord,
        stage_id: &str,
        ctx: &Context,
        now: &str,
    ) -> Result<SessionRecord> {
        record.context = ctx.to_value();
        record.last_completed_stage = Some(stage_id.to_string());
        record.updated_at = now.to_string();
        self.store.save(&record).await?;
        Ok(record)
    }

    pub async fn mark_status(&self, mut record: SessionRecord, status: SessionStatus, now: &str) -> Result<SessionRecord> {
        record.status = status;
        record.updated_at = now.to_string();
        self.store.save(&record).await?;
        Ok(record)
    }

    /// Persists a HITL pause: marks the session `AwaitingHitl` and records
    /// which stage it's waiting on, so `resume()` can recover it even for
    /// patterns whose resume point isn't otherwise derivable from `ctx`
    /// (graph's `current_node`, `spec.md` §4.9.7).
    pub async fn save_paused(&self, mut record: SessionRecord, stage_id: &str, ctx: &Context, now: &str) -> Result<SessionRecord> {
        record.context = ctx.to_value();
        record.status = SessionStatus::AwaitingHitl;
        record.pending_stage = Some(stage_id.to_string());
        record.updated_at = now.to_string();
        self.store.save(&record).await?;
        Ok(record)
    }

    pub async fn load(&self, session_id: &str) -> Result<SessionRecord> {
        self.store.load(session_id).await
    }

    /// `spec.md` §3: a session is "either deleted or marked Completed on
    /// success" — the engine deletes on success (see `DESIGN.md`).
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.store.delete(session_id).await
    }

    /// Checks the loaded session's `spec_hash` against the spec the caller
    /// intends to resume with. In `Warn` mode a mismatch is tolerated (the
    /// caller logs and proceeds); in `Strict` mode it is a `SessionError`.
    pub fn compatibility_check(&self, record: &SessionRecord, spec: &Spec) -> Result<CompatibilityOutcome> {
        let current_hash = spec.spec_hash();
        if record.spec_hash == current_hash {
            return Ok(CompatibilityOutcome::Match);
        }
        match self.mode {
            CompatibilityMode::Warn => Ok(CompatibilityOutcome::MismatchWarned {
                expected: record.spec_hash.clone(),
                found: current_hash,
            }),
            CompatibilityMode::Strict => Err(EngineError::Session {
                kind: SessionErrorKind::SpecChanged { expected: record.spec_hash.clone(), found: current_hash },
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompatibilityOutcome {
    Match,
    MismatchWarned { expected: String, found: String },
}

/// Lets a pattern executor persist progress after each completed stage
/// without owning the session's lifecycle itself. Wraps the manager and
/// the in-flight record behind a mutex so fan-out patterns
/// (Workflow-DAG, Parallel, Orchestrator-Workers) can check in from
/// concurrent branch/worker tasks through a single cloned handle. A crash
/// between two `save_after_stage` calls loses at most the stage that was
/// in-flight, not everything since the last checkpoint (`spec.md` §4.6).
#[derive(Clone)]
pub struct CheckpointHandle {
    manager: Arc<CheckpointManager>,
    record: Arc<Mutex<SessionRecord>>,
}

impl CheckpointHandle {
    pub fn new(manager: Arc<CheckpointManager>, record: SessionRecord) -> Self {
        Self { manager, record: Arc::new(Mutex::new(record)) }
    }

    pub async fn save_after_stage(&self, stage_id: &str, ctx: &Context) -> Result<()> {
        let now = now_iso();
        let mut record = self.record.lock().await;
        *record = self.manager.save_after_stage(record.clone(), stage_id, ctx, &now).await?;
        Ok(())
    }
}
