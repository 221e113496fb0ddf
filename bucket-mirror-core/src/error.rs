//! Error taxonomy shared by the coordinator, the sync primitive and the
//! scheduler variants.
//!
//! Only [`ConfigError`] is fatal. Per-bucket errors ([`DiskSpaceError`],
//! [`TransferError`]) are folded into the run record by the coordinator, and
//! [`SchedulerRegistrationError`] is reported to whoever asked for the
//! registration.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration could not be loaded or is missing a required field.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("missing required config field `{0}`")]
    MissingField(&'static str),

    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

/// The destination volume cannot hold the bucket. Never retried.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("insufficient disk space for bucket {bucket} at {destination}: required {required} bytes, available {available} bytes")]
pub struct DiskSpaceError {
    pub bucket: String,
    pub destination: PathBuf,
    pub required: u64,
    pub available: u64,
}

/// A single invocation of the external sync tool failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("sync tool not found: {0}")]
    NotFound(String),

    #[error("failed to launch sync tool: {0}")]
    Spawn(String),

    #[error("sync tool exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("remote query failed: {0}")]
    Query(String),
}

/// Registering, removing or querying the recurring job failed.
#[derive(Error, Debug)]
pub enum SchedulerRegistrationError {
    #[error("scheduler I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("interval of {0} hours cannot be expressed by this scheduler")]
    InvalidInterval(u64),

    #[error("scheduler registration is not supported on {0}")]
    Unsupported(String),
}

/// The status record could not be written or read back.
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("status file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("status file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to replace status file: {0}")]
    Persist(#[from] tempfile::PersistError),
}
