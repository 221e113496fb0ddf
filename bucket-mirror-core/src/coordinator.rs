//! Sync coordinator: drives every configured bucket through the external sync
//! tool, with retries, and reports the outcome as a [`RunRecord`].
//!
//! # Per-bucket lifecycle
//! `Pending -> Attempting -> {Success | RetryWait -> Attempting | Failed}`.
//! `max_retries` is the total attempt budget of a bucket within one run. A
//! disk-space shortfall is terminal on the first attempt and never reaches the
//! sync tool.
//!
//! # Runs
//! Buckets are processed one at a time, in configuration order. One bucket's
//! failure never prevents the next bucket from being attempted. All buckets
//! of a run share one session directory:
//! `{destination_root}/{session_id}/{source_namespace}/{bucket}`.
//!
//! # Shutdown
//! The [`CancellationToken`] is observed between buckets, during retry waits
//! and during the inter-run sleep of [`SyncCoordinator::run_continuously`]. An
//! in-flight transfer is always allowed to finish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfiguration;
use crate::contract::{DiskSpaceProbe, SyncInvocation, SyncPrimitive};
use crate::disk::required_space;
use crate::error::DiskSpaceError;
use crate::status::{Phase, StatusWriter};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Do everything except the transfer itself.
    pub simulate: bool,
    /// Resume into an existing session directory instead of starting a new one.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketState {
    Success,
    Failed,
}

/// Where a bucket is in its lifecycle. Only used for tracing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketPhase {
    Pending,
    Attempting(u32),
    RetryWait(u32),
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketOutcome {
    pub bucket: String,
    pub destination: PathBuf,
    pub state: BucketState,
    /// Attempts consumed from the budget. Zero for simulated buckets.
    pub attempts: u32,
    pub duration_secs: f64,
    pub files_changed: Option<u64>,
    pub bytes: Option<u64>,
    pub error: Option<String>,
}

impl BucketOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == BucketState::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub simulated: bool,
    /// Set when shutdown stopped the run before every bucket was attempted.
    pub cancelled: bool,
    pub buckets: Vec<BucketOutcome>,
    pub success: bool,
}

impl RunRecord {
    pub fn outcome(&self, bucket: &str) -> Option<&BucketOutcome> {
        self.buckets.iter().find(|b| b.bucket == bucket)
    }

    pub fn failed(&self) -> impl Iterator<Item = &BucketOutcome> {
        self.buckets.iter().filter(|b| !b.succeeded())
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// One-line summary printed at the end of a CLI run.
    pub fn summary_line(&self) -> String {
        let ok = self.buckets.iter().filter(|b| b.succeeded()).count();
        let mut line = format!(
            "{} session {}: {}/{} bucket(s) synced in {:.2}s",
            if self.success { "SUCCESS" } else { "FAILED" },
            self.session_id,
            ok,
            self.buckets.len(),
            self.duration_secs()
        );
        if self.simulated {
            line.push_str(" (dry run)");
        }
        if self.cancelled {
            line.push_str(" (cancelled)");
        }
        line
    }
}

/// `{prefix}_{YYYYMMDDHHMMSS}_{8 hex}`: sortable by time, unique across
/// processes started within the same second.
pub fn new_session_id(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, now.format("%Y%m%d%H%M%S"), &suffix[..8])
}

pub fn destination_path(root: &Path, session_id: &str, namespace: &str, bucket: &str) -> PathBuf {
    root.join(session_id).join(namespace).join(bucket)
}

pub struct SyncCoordinator<P, D> {
    config: SyncConfiguration,
    primitive: P,
    disk: D,
    status: StatusWriter,
    shutdown: CancellationToken,
}

impl<P, D> SyncCoordinator<P, D>
where
    P: SyncPrimitive,
    D: DiskSpaceProbe,
{
    pub fn new(config: SyncConfiguration, primitive: P, disk: D) -> Self {
        Self {
            config,
            primitive,
            disk,
            status: StatusWriter::disabled(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_status(mut self, status: StatusWriter) -> Self {
        self.status = status;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &SyncConfiguration {
        &self.config
    }

    pub fn status(&self) -> &StatusWriter {
        &self.status
    }

    /// Syncs every configured bucket once.
    pub async fn run_once(&self, options: &RunOptions) -> RunRecord {
        let started_at = Utc::now();
        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| new_session_id(&self.config.session_prefix, started_at));
        let total = self.config.buckets.len();

        info!(
            session_id = %session_id,
            buckets = total,
            simulate = options.simulate,
            "[RUN] Sync run started"
        );
        self.status.update(|s| {
            s.phase = Phase::Syncing;
            s.session_id = Some(session_id.clone());
            s.bucket = None;
            s.attempt = None;
            s.next_run_at = None;
        });

        if total == 0 {
            info!(session_id = %session_id, "[RUN] No buckets configured, nothing to do");
        }

        let mut outcomes = Vec::with_capacity(total);
        let mut cancelled = false;
        for (index, bucket) in self.config.buckets.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                warn!(
                    session_id = %session_id,
                    remaining = total - index,
                    "[RUN] Shutdown requested, remaining buckets not attempted"
                );
                cancelled = true;
                break;
            }
            info!(bucket = %bucket, position = index + 1, total, "[SYNC] Processing bucket");
            let outcome = self.sync_bucket(&session_id, bucket, options.simulate).await;
            outcomes.push(outcome);
        }
        let success = !cancelled && outcomes.iter().all(BucketOutcome::succeeded);
        let record = RunRecord {
            session_id,
            started_at,
            finished_at: Utc::now(),
            simulated: options.simulate,
            cancelled,
            buckets: outcomes,
            success,
        };
        self.log_completion(&record);

        let finished = record.clone();
        self.status.update(move |s| {
            s.phase = Phase::Idle;
            s.bucket = None;
            s.attempt = None;
            s.last_run = Some(finished);
        });
        record
    }

    /// Runs, sleeps until `interval` after the start of that run, and repeats
    /// until shutdown. A run longer than the interval is followed immediately
    /// by the next one. Returns the number of completed runs.
    pub async fn run_continuously(&self, interval: Duration, simulate: bool) -> u64 {
        info!(
            interval_secs = interval.as_secs(),
            "[WATCH] Continuous sync mode started"
        );
        let options = RunOptions {
            simulate,
            session_id: None,
        };
        let mut runs = 0u64;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let iteration_start = tokio::time::Instant::now();
            let record = self.run_once(&options).await;
            runs += 1;
            if record.success {
                info!(runs, "[WATCH] Scheduled sync completed successfully");
            } else {
                error!(runs, "[WATCH] Scheduled sync failed");
            }

            let next_start = iteration_start + interval;
            let now = tokio::time::Instant::now();
            if next_start <= now {
                if !interval.is_zero() {
                    warn!(
                        overrun_secs = (now - next_start).as_secs(),
                        "[WATCH] Run took longer than the interval, starting next run now"
                    );
                }
                tokio::task::yield_now().await;
                continue;
            }

            let remaining = next_start - now;
            let next_run_at = Utc::now()
                + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());
            self.status.update(|s| {
                s.phase = Phase::Sleeping;
                s.next_run_at = Some(next_run_at);
            });
            info!(next_run_at = %next_run_at, "[WATCH] Next sync scheduled");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next_start) => {}
            }
        }

        self.status.update(|s| {
            s.phase = Phase::Stopped;
            s.next_run_at = None;
        });
        info!(runs, "[WATCH] Continuous sync stopped");
        runs
    }

    async fn sync_bucket(&self, session_id: &str, bucket: &str, simulate: bool) -> BucketOutcome {
        let started = Instant::now();
        let destination = destination_path(
            &self.config.destination_root,
            session_id,
            &self.config.source_namespace,
            bucket,
        );
        let invocation = SyncInvocation::new(
            bucket,
            destination.clone(),
            &self.config.profile,
            &self.config.sync_options,
        );
        let finish = |state: BucketState, attempts: u32, error: Option<String>| BucketOutcome {
            bucket: bucket.to_string(),
            destination: destination.clone(),
            state,
            attempts,
            duration_secs: started.elapsed().as_secs_f64(),
            files_changed: None,
            bytes: None,
            error,
        };
        let mut phase = BucketPhase::Pending;
        debug!(bucket, ?phase, destination = %destination.display(), "[SYNC] Bucket state");

        if let Err(e) = self.check_space(&invocation).await {
            phase = BucketPhase::Failed;
            error!(
                bucket,
                destination = %destination.display(),
                attempt = 1,
                ?phase,
                required = e.required,
                available = e.available,
                "[SYNC][ERROR] Insufficient disk space, bucket skipped"
            );
            return finish(BucketState::Failed, 1, Some(e.to_string()));
        }

        if simulate {
            let command = self.primitive.describe(&invocation);
            info!(bucket, command = %command, "[DRY RUN] Would run sync command");
            return finish(BucketState::Success, 0, None);
        }

        if let Err(e) = tokio::fs::create_dir_all(&destination).await {
            error!(
                bucket,
                destination = %destination.display(),
                error = %e,
                "[SYNC][ERROR] Failed to create destination directory"
            );
            return finish(
                BucketState::Failed,
                0,
                Some(format!("failed to create {}: {e}", destination.display())),
            );
        }

        let budget = self.config.automation.attempt_budget();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            phase = BucketPhase::Attempting(attempt);
            self.status.update(|s| {
                s.phase = Phase::Syncing;
                s.bucket = Some(bucket.to_string());
                s.attempt = Some(attempt);
            });
            info!(
                bucket,
                destination = %destination.display(),
                attempt,
                budget,
                ?phase,
                "[SYNC] Starting transfer"
            );
            debug!(bucket, command = %self.primitive.describe(&invocation), "[SYNC] Command");

            let error = match self.primitive.sync(&invocation).await {
                Ok(outcome) => {
                    phase = BucketPhase::Success;
                    let mut result = finish(BucketState::Success, attempt, None);
                    result.files_changed = Some(outcome.files_changed);
                    result.bytes = outcome.bytes;
                    info!(
                        bucket,
                        attempt,
                        ?phase,
                        files_changed = outcome.files_changed,
                        duration_secs = %format!("{:.2}", result.duration_secs),
                        "[SYNC] Bucket synced successfully"
                    );
                    return result;
                }
                Err(e) => e,
            };

            error!(
                bucket,
                destination = %destination.display(),
                attempt,
                budget,
                error = %error,
                "[SYNC][ERROR] Transfer attempt failed"
            );
            if attempt >= budget {
                phase = BucketPhase::Failed;
                error!(bucket, attempts = attempt, ?phase, "[SYNC][ERROR] Retry budget exhausted");
                return finish(BucketState::Failed, attempt, Some(error.to_string()));
            }

            phase = BucketPhase::RetryWait(attempt);
            let delay = self.config.automation.retry_delay();
            self.status.update(|s| s.phase = Phase::RetryWait);
            warn!(
                bucket,
                attempt,
                ?phase,
                retry_in_secs = delay.as_secs(),
                "[SYNC] Will retry transfer"
            );
            if !self.pause(delay).await {
                phase = BucketPhase::Failed;
                warn!(bucket, attempts = attempt, ?phase, "[SYNC] Shutdown during retry wait");
                return finish(
                    BucketState::Failed,
                    attempt,
                    Some(format!("cancelled during retry wait after: {error}")),
                );
            }
        }
    }

    /// Fails only on a confirmed shortfall. When either the remote size or the
    /// local free space cannot be determined the transfer goes ahead.
    async fn check_space(&self, invocation: &SyncInvocation) -> Result<(), DiskSpaceError> {
        let remote = match self
            .primitive
            .remote_size(&invocation.bucket, &invocation.profile)
            .await
        {
            Ok(Some(bytes)) if bytes > 0 => bytes,
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(bucket = %invocation.bucket, error = %e, "Could not get remote bucket size");
                return Ok(());
            }
        };

        let required = required_space(remote);
        match self.disk.available_bytes(&invocation.destination) {
            Ok(available) if available < required => Err(DiskSpaceError {
                bucket: invocation.bucket.clone(),
                destination: invocation.destination.clone(),
                required,
                available,
            }),
            Ok(available) => {
                info!(
                    bucket = %invocation.bucket,
                    required,
                    available,
                    "Disk space check passed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    bucket = %invocation.bucket,
                    destination = %invocation.destination.display(),
                    error = %e,
                    "Could not check disk space"
                );
                Ok(())
            }
        }
    }

    /// Sleeps for `delay` unless shutdown comes first. Returns false on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.shutdown.is_cancelled();
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn log_completion(&self, record: &RunRecord) {
        let failed: Vec<&BucketOutcome> = record.failed().collect();
        if record.success {
            info!(
                session_id = %record.session_id,
                buckets = record.buckets.len(),
                duration_secs = %format!("{:.2}", record.duration_secs()),
                "[RUN] Sync run completed successfully"
            );
        } else {
            error!(
                session_id = %record.session_id,
                failed = failed.len(),
                buckets = record.buckets.len(),
                cancelled = record.cancelled,
                duration_secs = %format!("{:.2}", record.duration_secs()),
                "[RUN] Sync run failed"
            );
        }
        for outcome in failed {
            error!(
                bucket = %outcome.bucket,
                destination = %outcome.destination.display(),
                attempts = outcome.attempts,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "[RUN] Bucket failed"
            );
        }
        info!(
            session_id = %record.session_id,
            location = %self.config.destination_root.join(&record.session_id).display(),
            "[RUN] Backup location"
        );
    }
}
