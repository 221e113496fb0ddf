//! # contract: seams between the coordinator and the outside world
//!
//! The coordinator never spawns processes or inspects volumes itself. It talks
//! to two traits:
//! - [`SyncPrimitive`]: the external command-line sync tool (remote size
//!   query, the transfer itself, and a printable form of the command line).
//! - [`DiskSpaceProbe`]: free space on the volume holding a destination path.
//!
//! Both are annotated for `mockall` so tests can script attempt-by-attempt
//! behaviour without a real tool installed. Scheduler registration has its own
//! trait in [`crate::scheduler`].

use async_trait::async_trait;
use mockall::automock;
use std::path::{Path, PathBuf};

use crate::config::SyncOptions;
use crate::error::TransferError;

/// Everything the external tool needs to mirror one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncInvocation {
    /// Source identifier, e.g. `s3://bucket`.
    pub source: String,
    pub bucket: String,
    pub destination: PathBuf,
    pub profile: String,
    pub options: SyncOptions,
}

impl SyncInvocation {
    pub fn new(
        bucket: &str,
        destination: PathBuf,
        profile: &str,
        options: &SyncOptions,
    ) -> Self {
        Self {
            source: format!("s3://{bucket}"),
            bucket: bucket.to_string(),
            destination,
            profile: profile.to_string(),
            options: options.clone(),
        }
    }
}

/// What a successful invocation reported, as far as its output reveals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferOutcome {
    /// Files downloaded, copied or deleted locally.
    pub files_changed: u64,
    /// Bytes transferred, when the tool printed progress.
    pub bytes: Option<u64>,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SyncPrimitive: Send + Sync {
    /// Total size of the remote bucket in bytes, if the tool can report it.
    async fn remote_size(&self, bucket: &str, profile: &str) -> Result<Option<u64>, TransferError>;

    /// Runs one transfer attempt to completion.
    async fn sync(&self, invocation: &SyncInvocation) -> Result<TransferOutcome, TransferError>;

    /// The command line that `sync` would execute.
    fn describe(&self, invocation: &SyncInvocation) -> String;

    /// Checks the tool is installed and the credentials resolve; returns a
    /// short human-readable identity string.
    async fn preflight(&self, profile: &str) -> Result<String, TransferError>;
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait DiskSpaceProbe: Send + Sync {
    /// Bytes available to an unprivileged writer on the volume holding `path`.
    fn available_bytes(&self, path: &Path) -> std::io::Result<u64>;
}
