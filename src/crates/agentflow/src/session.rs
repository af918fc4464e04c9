//! Session Store (C5, `spec.md` §4.5).
//!
//! One JSON file per session, named by a UUIDv4 session id, under a
//! configured root directory. Writes go through the same temp-file +
//! `fsync` + rename sequence as `artifact.rs` so a crash never leaves a
//! half-written session file behind. Listing supports filtering by
//! workflow name and pagination, per `spec.md` §4.5.

use crate::context::Context;
use crate::error::{EngineError, Result, SessionErrorKind};
use crate::spec::Spec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub workflow_name: String,
    pub spec_hash: String,
    pub created_at: String,
    pub updated_at: String,
    pub status: SessionStatus,
    pub context: serde_json::Value,
    #[serde(default)]
    pub last_completed_stage: Option<String>,
    /// Stage id a HITL pause is waiting on, set only while `status` is
    /// `AwaitingHitl`. Lets `resume()` recover the paused node/route/etc.
    /// even for patterns that don't derive it purely from `context`.
    #[serde(default)]
    pub pending_stage: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    AwaitingHitl,
}

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    /// Allocates a fresh UUIDv4 session id and writes the initial record.
    pub async fn create(&self, spec: &Spec, ctx: &Context, now: &str) -> Result<SessionRecord> {
        let record = SessionRecord {
            session_id: Uuid::new_v4().to_string(),
            workflow_name: spec.name.clone(),
            spec_hash: spec.spec_hash(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
            status: SessionStatus::Running,
            context: ctx.to_value(),
            last_completed_stage: None,
            pending_stage: None,
        };
        self.save(&record).await?;
        Ok(record)
    }

    pub async fn save(&self, record: &SessionRecord) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let path = self.path_for(&record.session_id);
        let body = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &body).await
    }

    pub async fn load(&self, session_id: &str) -> Result<SessionRecord> {
        let path = self.path_for(session_id);
        let bytes = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::Session { kind: SessionErrorKind::NotFound }
            } else {
                EngineError::from(e)
            }
        })?;
        let record: SessionRecord = serde_json::from_slice(&bytes)?;
        Ok(record)
    }

    /// Deletes a session file. Tolerates a session that is already gone —
    /// `spec.md` §3 "Session ... either deleted or marked Completed on
    /// success" means a caller may call this more than once.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::from(e)),
        }
    }

    /// Lists sessions, optionally filtered by workflow name, newest-first,
    /// with `offset`/`limit` pagination (`spec.md` §4.5).
    pub async fn list(&self, workflow_name: Option<&str>, offset: usize, limit: usize) -> Result<Vec<SessionRecord>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(entry.path()).await?;
            if let Ok(record) = serde_json::from_slice::<SessionRecord>(&bytes) {
                if workflow_name.map_or(true, |w| record.workflow_name == w) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }
}

async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("session");
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(body).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, path).await?;
    Ok(())
}
