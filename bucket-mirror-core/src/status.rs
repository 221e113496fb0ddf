//! Run status record shared with the dashboard through the filesystem.
//!
//! The coordinator rewrites one JSON file on every transition. Readers never
//! share memory with the coordinator; they see whatever was last persisted.
//! Each write goes to a temp file in the same directory and is renamed into
//! place, so a reader never observes a half-written record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::coordinator::RunRecord;
use crate::error::StatusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Syncing,
    RetryWait,
    Idle,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub phase: Phase,
    pub updated_at: DateTime<Utc>,
    pub pid: u32,
    pub session_id: Option<String>,
    pub bucket: Option<String>,
    pub attempt: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<RunRecord>,
}

impl StatusRecord {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            updated_at: Utc::now(),
            pid: std::process::id(),
            session_id: None,
            bucket: None,
            attempt: None,
            next_run_at: None,
            last_run: None,
        }
    }
}

/// Writes the status record on each transition. Write failures are logged and
/// never interrupt a run.
pub struct StatusWriter {
    path: Option<PathBuf>,
    current: Mutex<StatusRecord>,
}

impl StatusWriter {
    /// Persists a `starting` record right away.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let writer = Self {
            path: Some(path.into()),
            current: Mutex::new(StatusRecord::new(Phase::Starting)),
        };
        writer.update(|_| {});
        writer
    }

    /// Tracks transitions in memory only.
    pub fn disabled() -> Self {
        Self {
            path: None,
            current: Mutex::new(StatusRecord::new(Phase::Starting)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Applies `change`, stamps the record and persists it.
    pub fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut StatusRecord),
    {
        let snapshot = {
            let mut current = match self.current.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            change(&mut current);
            current.updated_at = Utc::now();
            current.clone()
        };
        if let Some(path) = &self.path {
            if let Err(e) = write_status(path, &snapshot) {
                warn!(error = %e, status_file = %path.display(), "Failed to write status record");
            }
        }
    }

    pub fn snapshot(&self) -> StatusRecord {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub fn write_status(path: &Path, record: &StatusRecord) -> Result<(), StatusError> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            dir.to_path_buf()
        }
        None => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(&mut tmp, record)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

/// Reads the last persisted record; `None` if nothing has been written yet.
pub fn read_status(path: &Path) -> Result<Option<StatusRecord>, StatusError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
