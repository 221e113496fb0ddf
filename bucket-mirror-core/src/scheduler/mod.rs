//! Registration of the recurring sync job with the host OS scheduler.
//!
//! Each variant renders a scheduler artifact (a plist, a crontab line, a
//! `schtasks` invocation) from a [`ScheduleRequest`] and installs it through
//! the platform's own tooling. Nothing here touches a running sync loop.

mod cron;
mod launchd;
mod windows;

pub use cron::Cron;
pub use launchd::LaunchAgent;
pub use windows::TaskScheduler;

use async_trait::async_trait;
use mockall::automock;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::SchedulerRegistrationError;

/// Label used when none is given on the command line.
pub const DEFAULT_LABEL: &str = "com.bucket-mirror.sync";

/// What to run, from where, and how often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub interval_hours: u64,
}

impl ScheduleRequest {
    /// Program plus arguments, shell-quoted.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|part| shell_quote(&part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SchedulerRegistration: Send + Sync {
    /// Short name of the host mechanism, for messages.
    fn name(&self) -> &'static str;

    /// The artifact `register` would install.
    fn render(&self, request: &ScheduleRequest) -> Result<String, SchedulerRegistrationError>;

    /// Installs or replaces the job for `request.label`.
    async fn register(&self, request: &ScheduleRequest) -> Result<(), SchedulerRegistrationError>;

    /// Removes the job. Removing an absent job is not an error.
    async fn unregister(&self, label: &str) -> Result<(), SchedulerRegistrationError>;

    /// Human-readable registration state.
    async fn status(&self, label: &str) -> Result<String, SchedulerRegistrationError>;
}

/// The variant for the OS this binary was built for.
pub fn for_host() -> Result<Box<dyn SchedulerRegistration>, SchedulerRegistrationError> {
    if cfg!(target_os = "macos") {
        Ok(Box::new(LaunchAgent::for_current_user()?))
    } else if cfg!(windows) {
        Ok(Box::new(TaskScheduler))
    } else if cfg!(unix) {
        Ok(Box::new(Cron))
    } else {
        Err(SchedulerRegistrationError::Unsupported(
            std::env::consts::OS.to_string(),
        ))
    }
}

pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    input: Option<&str>,
) -> Result<Output, SchedulerRegistrationError> {
    debug!(program, args = ?args, "Running scheduler command");
    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(text.as_bytes()).await?;
        stdin.shutdown().await?;
    }
    Ok(child.wait_with_output().await?)
}

/// Like [`run_command`], but a non-zero exit is an error.
pub(crate) async fn run_checked(
    program: &str,
    args: &[String],
    input: Option<&str>,
) -> Result<String, SchedulerRegistrationError> {
    let output = run_command(program, args, input).await?;
    if !output.status.success() {
        return Err(SchedulerRegistrationError::Command {
            command: format!("{program} {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
