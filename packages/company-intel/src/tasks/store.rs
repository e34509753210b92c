//! File-per-task persistence.
//!
//! Each task lives in `<dir>/<id>.json`. When a result payload serializes to
//! `offload_threshold` bytes or more it is written to `<dir>/<id>_result.json`
//! and the record's `result` becomes a `{"$offloaded": {reference, timestamp}}`
//! pointer.
//! The record on disk is the only source of truth for a task.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::tasks::task::{ResultReference, StoredResult, Task};

const RECORD_EXT: &str = "json";
const RESULT_SUFFIX: &str = "_result";

pub struct TaskStore {
    dir: PathBuf,
    offload_threshold: usize,
}

impl TaskStore {
    pub fn new(dir: impl Into<PathBuf>, offload_threshold: usize) -> Self {
        Self {
            dir: dir.into(),
            offload_threshold,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXT}"))
    }

    pub fn result_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(result_file_name(id))
    }

    /// Persist `task`, off-loading an oversized inline result first.
    ///
    /// Returns the record exactly as written.
    pub async fn save(&self, task: &Task) -> StoreResult<Task> {
        fs::create_dir_all(&self.dir).await?;

        let mut record = task.clone();
        if let Some(StoredResult::Inline(payload)) = &record.result {
            let bytes = serde_json::to_vec(payload)?;
            if bytes.len() >= self.offload_threshold {
                debug!(
                    task_id = %task.id,
                    bytes = bytes.len(),
                    "off-loading oversized task result"
                );
                write_atomic(&self.result_path(task.id), &bytes).await?;
                record.result = Some(StoredResult::Reference(ResultReference {
                    reference: result_file_name(task.id),
                    timestamp: Utc::now(),
                }));
            }
        }

        let bytes = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.record_path(task.id), &bytes).await?;
        Ok(record)
    }

    /// Read a record as persisted; off-loaded results stay as references.
    pub async fn load(&self, id: Uuid) -> StoreResult<Option<Task>> {
        let bytes = match fs::read(self.record_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Resolve a task's result payload, following a reference if needed.
    pub async fn load_result(&self, task: &Task) -> StoreResult<Option<Value>> {
        match &task.result {
            None => Ok(None),
            Some(StoredResult::Inline(value)) => Ok(Some(value.clone())),
            Some(StoredResult::Reference(pointer)) => {
                let path = self.dir.join(&pointer.reference);
                match fs::read(&path).await {
                    Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(StoreError::MissingResult(task.id))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Every readable record in the directory. Unreadable files are skipped.
    pub async fn list(&self) -> StoreResult<Vec<Task>> {
        let mut tasks = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tasks),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = record_id(&path) else {
                continue;
            };
            match self.load(id).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable task record"),
            }
        }
        Ok(tasks)
    }

    pub async fn delete(&self, id: Uuid) -> StoreResult<()> {
        for path in [self.record_path(id), self.result_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete files last modified more than `max_age` ago.
    ///
    /// Per-file failures are logged and skipped so one bad file cannot stop
    /// the sweep. Returns the number of files removed.
    pub async fn cleanup(&self, max_age: Duration) -> StoreResult<usize> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "task cleanup stopped reading directory");
                    break;
                }
            };
            let path = entry.path();

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot stat task file");
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = age.as_secs(), "removed expired task file");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove expired task file"),
            }
        }
        Ok(removed)
    }
}

fn result_file_name(id: Uuid) -> String {
    format!("{id}{RESULT_SUFFIX}.{RECORD_EXT}")
}

/// Task id of a primary record path; companion and temp files yield `None`.
fn record_id(path: &Path) -> Option<Uuid> {
    if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| Uuid::parse_str(stem).ok())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}
