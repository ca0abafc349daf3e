//! Append-only JSONL decision trace.
//!
//! One line per request so operators can replay routing decisions and tune
//! thresholds offline. The writer is exclusive (a mutex guards both the write
//! and the rotation check); the file is size-rotated to `.1 .. .N` backups
//! with the current file always at the base name.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::classify::{Complexity, Domain};
use crate::config::TraceSettings;
use crate::error::CascadeError;
use crate::router::Strategy;

/// One decision record — the wire format of the trace file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub complexity: Complexity,
    pub domain: Domain,
    pub strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drafter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<String>,
    pub threshold: f64,
    /// Draft confidence; absent for direct strategies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<f64>,
    pub draft_accepted: bool,
    #[serde(default)]
    pub budget_forced: bool,
    pub draft_cost: f64,
    pub verifier_cost: f64,
    pub latency_ms: u64,
    pub reason: Vec<String>,
}

/// Size-rotated JSONL sink. Cheap to share behind an `Arc`.
pub struct DecisionTrace {
    path: PathBuf,
    max_file_size: u64,
    max_backups: u32,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl DecisionTrace {
    pub fn new(settings: &TraceSettings) -> Option<Self> {
        settings.path.as_ref().map(|path| Self {
            path: path.clone(),
            max_file_size: settings.max_file_size,
            max_backups: settings.max_backups,
            writer: Mutex::new(None),
        })
    }

    pub fn at_path(path: impl Into<PathBuf>, max_file_size: u64, max_backups: u32) -> Self {
        Self {
            path: path.into(),
            max_file_size,
            max_backups,
            writer: Mutex::new(None),
        }
    }

    /// Append one record. Rotation is checked under the same lock as the
    /// write, so concurrent appends can never interleave lines.
    pub async fn append(&self, record: &TraceRecord) -> Result<(), CascadeError> {
        let line = serde_json::to_string(record)
            .map_err(|e| CascadeError::Validation(format!("serializing trace record: {e}")))?;

        let mut writer = self.writer.lock().await;

        if self.needs_rotation().await {
            *writer = None;
            self.rotate().await;
        }

        if writer.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    CascadeError::Config(format!("opening trace file {}: {e}", self.path.display()))
                })?;
            *writer = Some(file);
        }

        let file = writer.as_mut().expect("writer just opened");
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        result.map_err(|e| CascadeError::Config(format!("writing decision trace: {e}")))?;
        Ok(())
    }

    /// Flush and close the current file handle.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(file) = writer.as_mut() {
            let _ = file.flush().await;
        }
        *writer = None;
    }

    async fn needs_rotation(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len() >= self.max_file_size,
            Err(_) => false,
        }
    }

    /// Shift backups: the oldest is deleted, each remaining `.i` becomes
    /// `.i+1`, and the current file becomes `.1`.
    async fn rotate(&self) {
        let backup = |i: u32| -> PathBuf { backup_path(&self.path, i) };

        let oldest = backup(self.max_backups);
        let _ = tokio::fs::remove_file(&oldest).await;

        for i in (1..self.max_backups).rev() {
            let src = backup(i);
            if tokio::fs::metadata(&src).await.is_ok() {
                let _ = tokio::fs::rename(&src, backup(i + 1)).await;
            }
        }

        if self.max_backups > 0 {
            let _ = tokio::fs::rename(&self.path, backup(1)).await;
        } else {
            let _ = tokio::fs::remove_file(&self.path).await;
        }
    }
}

fn backup_path(path: &Path, i: u32) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(format!(".{i}"));
    PathBuf::from(s)
}
