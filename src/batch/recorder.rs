//! Persistence of run results and the batch summary.
//!
//! Layout under a batch directory:
//!
//! ```text
//! <batch_dir>/individual_results/<target>_<task>[_run<N>].json
//! <batch_dir>/<batch_id>_results.json
//! ```
//!
//! Every file is written to a hidden temporary file and renamed into place,
//! so a crash never leaves a half-written result behind.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::RecordingError;
use crate::runner::RunResult;

/// Directory (under the batch directory) holding one file per run.
pub const RESULTS_DIR: &str = "individual_results";

/// Writes run results as they complete.
#[derive(Debug, Clone)]
pub struct RunRecorder {
    batch_dir: PathBuf,
    results_dir: PathBuf,
    runs_per_task: u32,
    save_individual: bool,
}

impl RunRecorder {
    pub fn new(batch_dir: impl Into<PathBuf>, runs_per_task: u32) -> Self {
        let batch_dir = batch_dir.into();
        Self {
            results_dir: batch_dir.join(RESULTS_DIR),
            batch_dir,
            runs_per_task,
            save_individual: true,
        }
    }

    /// Disables per-run files. Batches recorded this way cannot resume.
    pub fn with_individual_results(mut self, save: bool) -> Self {
        self.save_individual = save;
        self
    }

    pub fn batch_dir(&self) -> &Path {
        &self.batch_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Creates the batch and results directories.
    pub async fn prepare(&self) -> Result<(), RecordingError> {
        fs::create_dir_all(&self.results_dir)
            .await
            .map_err(|source| RecordingError::DirectoryCreationFailed {
                path: self.results_dir.clone(),
                source,
            })
    }

    /// Path of the file holding `result`.
    pub fn result_path(&self, result: &RunResult) -> PathBuf {
        self.results_dir
            .join(format!("{}.json", result.identity.file_stem(self.runs_per_task)))
    }

    /// Persists one result. Returns `None` when per-run files are disabled.
    pub async fn record(&self, result: &RunResult) -> Result<Option<PathBuf>, RecordingError> {
        if !self.save_individual {
            return Ok(None);
        }

        let path = self.result_path(result);
        let json = serde_json::to_vec_pretty(result)?;
        atomic_write(&path, &json).await?;

        debug!(run = %result.identity, path = %path.display(), "Recorded run result");
        Ok(Some(path))
    }

    /// Path of the batch summary artifact.
    pub fn summary_path(&self, batch_id: &str) -> PathBuf {
        self.batch_dir.join(format!("{}_results.json", batch_id))
    }

    /// Writes the batch summary artifact.
    pub async fn write_summary<T: Serialize>(
        &self,
        batch_id: &str,
        summary: &T,
    ) -> Result<PathBuf, RecordingError> {
        let path = self.summary_path(batch_id);
        let json = serde_json::to_vec_pretty(summary)?;
        atomic_write(&path, &json).await?;
        Ok(path)
    }

    /// Deletes every recorded run so the batch starts over.
    pub async fn clear(&self) -> Result<usize, RecordingError> {
        let mut entries = match fs::read_dir(&self.results_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(RecordingError::Write {
                    path: self.results_dir.clone(),
                    source,
                })
            }
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|source| RecordingError::Write {
            path: self.results_dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                fs::remove_file(&path)
                    .await
                    .map_err(|source| RecordingError::Write { path, source })?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Writes `bytes` to a hidden sibling of `path`, syncs it, then renames it
/// over `path`.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), RecordingError> {
    let write_err = |source| RecordingError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| RecordingError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "result".to_string());
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));

    let mut file = fs::File::create(&tmp).await.map_err(write_err)?;
    file.write_all(bytes).await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);

    if let Err(source) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(write_err(source));
    }
    Ok(())
}
