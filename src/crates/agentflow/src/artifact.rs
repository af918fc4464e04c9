//! Artifact Writer (C4, `spec.md` §4.4).
//!
//! Renders an `ArtifactSpec`'s path and content templates against the run
//! context, then writes the result atomically: content goes to a sibling
//! temp file first, `fsync`'d, then renamed into place (`spec.md` §4.4
//! invariant — "no reader ever observes a partially written artifact").
//! Overwrite is refused unless `outputs.force_overwrite` is set, mirroring
//! the teacher's `session`/checkpoint atomic-write pattern used elsewhere
//! in this crate (see `session.rs`).

use crate::context::Context;
use crate::error::{ArtifactErrorKind, EngineError, Result};
use crate::spec::ArtifactSpec;
use crate::template;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub struct ArtifactWriter {
    output_dir: PathBuf,
    force_overwrite: bool,
}

impl ArtifactWriter {
    pub fn new(output_dir: impl Into<PathBuf>, force_overwrite: bool) -> Self {
        Self { output_dir: output_dir.into(), force_overwrite }
    }

    /// Renders `spec`'s templates against `ctx` and writes the artifact.
    /// Returns the absolute path written.
    pub async fn write(&self, spec: &ArtifactSpec, ctx: &Context, stage: &str) -> Result<PathBuf> {
        let relative = template::render(&spec.path_template, ctx, stage)?;
        let content = template::render(&spec.content_template, ctx, stage)?;
        let path = self.output_dir.join(relative);
        self.write_atomic(&path, &content).await?;
        Ok(path)
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        if path.exists() && !self.force_overwrite {
            return Err(EngineError::Artifact {
                kind: ArtifactErrorKind::Overwrite { path: path.display().to_string() },
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_err(path, e))?;
        }
        let tmp_path = sibling_temp_path(path);
        let mut file = fs::File::create(&tmp_path).await.map_err(|e| io_err(&tmp_path, e))?;
        file.write_all(content.as_bytes()).await.map_err(|e| io_err(&tmp_path, e))?;
        file.sync_all().await.map_err(|e| io_err(&tmp_path, e))?;
        drop(file);
        fs::rename(&tmp_path, path).await.map_err(|e| io_err(path, e))?;
        Ok(())
    }
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact");
    path.with_file_name(format!(".{file_name}.tmp"))
}

fn io_err(path: &Path, e: std::io::Error) -> EngineError {
    EngineError::Artifact { kind: ArtifactErrorKind::Io { path: path.display().to_string(), message: e.to_string() } }
}
