//! [`SyncPrimitive`] backed by the AWS command-line tool.
//!
//! Transfers run `aws s3 sync`; the remote size estimate comes from
//! `aws s3api list-objects-v2`. The tool's exit code and its stdout/stderr are
//! the only feedback channel.

use async_trait::async_trait;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use which::which;

use crate::contract::{SyncInvocation, SyncPrimitive, TransferOutcome};
use crate::error::TransferError;

/// Checked in order when the tool is not on PATH.
#[cfg(windows)]
pub const FALLBACK_LOCATIONS: &[&str] = &[
    r"C:\Program Files\Amazon\AWSCLIV2\aws.exe",
    r"C:\Program Files (x86)\Amazon\AWSCLIV2\aws.exe",
];
#[cfg(not(windows))]
pub const FALLBACK_LOCATIONS: &[&str] = &[
    "/usr/local/bin/aws",
    "/usr/bin/aws",
    "/opt/homebrew/bin/aws",
];

/// Last bytes of stderr kept in a [`TransferError::Exit`].
const STDERR_TAIL: usize = 2048;

#[derive(Debug)]
pub struct AwsCli {
    program: PathBuf,
}

impl AwsCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Finds the tool: the explicit path when given, otherwise `aws` on PATH,
    /// then the usual install locations. Schedulers start jobs with a minimal
    /// PATH, so the fallbacks matter there.
    pub fn locate(explicit: Option<&Path>) -> Result<Self, TransferError> {
        Self::locate_from(explicit, FALLBACK_LOCATIONS)
    }

    pub fn locate_from<P: AsRef<Path>>(
        explicit: Option<&Path>,
        fallbacks: &[P],
    ) -> Result<Self, TransferError> {
        let candidate = explicit.unwrap_or_else(|| Path::new("aws"));
        if candidate.components().count() > 1 {
            if candidate.is_file() {
                debug!(program = %candidate.display(), "Using configured sync tool");
                return Ok(Self::new(candidate));
            }
            return Err(TransferError::NotFound(format!(
                "{} does not exist",
                candidate.display()
            )));
        }

        let program = match which(candidate) {
            Ok(program) => program,
            Err(e) => fallbacks
                .iter()
                .map(|path| AsRef::<Path>::as_ref(path))
                .find(|path| path.is_file())
                .map(Path::to_path_buf)
                .ok_or_else(|| {
                    TransferError::NotFound(format!(
                        "{} ({e}). Please install the AWS CLI and ensure it is on PATH",
                        candidate.display()
                    ))
                })?,
        };
        debug!(program = %program.display(), "Located sync tool");
        Ok(Self::new(program))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments for `aws s3 sync`, without the program itself.
    pub fn sync_args(invocation: &SyncInvocation) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "s3".into(),
            "sync".into(),
            invocation.source.clone().into(),
            invocation.destination.clone().into_os_string(),
        ];
        push_profile(&mut args, &invocation.profile);

        let options = &invocation.options;
        if options.delete {
            args.push("--delete".into());
        }
        for pattern in &options.exclude_patterns {
            args.push("--exclude".into());
            args.push(pattern.into());
        }
        for pattern in &options.include_patterns {
            args.push("--include".into());
            args.push(pattern.into());
        }
        if let Some(class) = options.storage_class.as_deref().filter(|c| !c.is_empty()) {
            args.push("--storage-class".into());
            args.push(class.into());
        }
        if options.encrypt {
            args.push("--sse".into());
        }
        args
    }

    fn remote_size_args(bucket: &str, profile: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "s3api".into(),
            "list-objects-v2".into(),
            "--bucket".into(),
            bucket.into(),
            "--query".into(),
            "sum(Contents[].Size)".into(),
            "--output".into(),
            "text".into(),
        ];
        push_profile(&mut args, profile);
        args
    }

    async fn capture(&self, args: &[OsString]) -> Result<String, TransferError> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TransferError::Spawn(format!("{}: {e}", self.program.display())))?;
        if !output.status.success() {
            return Err(TransferError::Exit {
                code: output.status.code(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr)),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn push_profile(args: &mut Vec<OsString>, profile: &str) {
    if !profile.is_empty() && profile != "default" {
        args.push("--profile".into());
        args.push(profile.into());
    }
}

fn tail(text: &str) -> String {
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '*' || c == '?') {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}

/// Parses `list-objects-v2 --output text` of `sum(Contents[].Size)`.
/// An empty bucket prints `None`.
pub fn parse_remote_size(text: &str) -> Result<u64, TransferError> {
    let text = text.trim();
    if text.is_empty() || text == "None" {
        return Ok(0);
    }
    text.parse::<f64>()
        .map(|v| v.max(0.0) as u64)
        .map_err(|e| TransferError::Query(format!("unexpected size output `{text}`: {e}")))
}

/// Tallies what a run of `aws s3 sync` printed to stdout.
#[derive(Debug, Default)]
pub struct OutputTally {
    pub files_changed: u64,
    pub bytes: Option<u64>,
}

impl OutputTally {
    /// Feeds one stdout line. Progress updates arrive `\r`-separated inside a
    /// single line, so each segment is inspected on its own.
    pub fn observe(&mut self, line: &str) {
        for segment in line.split('\r') {
            let segment = segment.trim();
            if ["download:", "copy:", "delete:", "move:"]
                .iter()
                .any(|prefix| segment.starts_with(prefix))
            {
                self.files_changed += 1;
            } else if let Some(bytes) = parse_progress(segment) {
                self.bytes = Some(bytes);
            }
        }
    }

    pub fn into_outcome(self) -> TransferOutcome {
        TransferOutcome {
            files_changed: self.files_changed,
            bytes: self.bytes,
        }
    }
}

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Completed ([0-9]+(?:\.[0-9]+)?) (Bytes|KiB|MiB|GiB|TiB)/")
            .expect("static progress pattern is valid")
    })
}

fn parse_progress(segment: &str) -> Option<u64> {
    let caps = progress_regex().captures(segment)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let scale = match caps.get(2)?.as_str() {
        "Bytes" => 1u64,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        _ => 1 << 40,
    };
    Some((value * scale as f64).round() as u64)
}

#[async_trait]
impl SyncPrimitive for AwsCli {
    async fn remote_size(&self, bucket: &str, profile: &str) -> Result<Option<u64>, TransferError> {
        let args = Self::remote_size_args(bucket, profile);
        let text = self.capture(&args).await.map_err(|e| match e {
            TransferError::Exit { stderr, .. } => TransferError::Query(stderr),
            other => other,
        })?;
        parse_remote_size(&text).map(Some)
    }

    async fn sync(&self, invocation: &SyncInvocation) -> Result<TransferOutcome, TransferError> {
        let mut child = Command::new(&self.program)
            .args(Self::sync_args(invocation))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransferError::Spawn(format!("{}: {e}", self.program.display())))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Keys are printed in the tool's locale encoding, so lines are decoded
        // lossily and the pipe is drained to EOF whatever it carries.
        let read_stdout = async {
            let mut tally = OutputTally::default();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).split(b'\n');
                loop {
                    match lines.next_segment().await {
                        Ok(Some(raw)) => {
                            let line = String::from_utf8_lossy(&raw);
                            if !line.trim().is_empty() {
                                debug!(bucket = %invocation.bucket, line = %line.trim(), "sync tool output");
                            }
                            tally.observe(&line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(bucket = %invocation.bucket, error = %e, "Failed to read sync tool output");
                            break;
                        }
                    }
                }
            }
            tally
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                if let Err(e) = stderr.read_to_end(&mut buf).await {
                    warn!(bucket = %invocation.bucket, error = %e, "Failed to read sync tool stderr");
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let (tally, stderr_text) = tokio::join!(read_stdout, read_stderr);
        let status = child
            .wait()
            .await
            .map_err(|e| TransferError::Spawn(format!("waiting for sync tool: {e}")))?;

        if !stderr_text.trim().is_empty() {
            warn!(bucket = %invocation.bucket, stderr = %tail(&stderr_text), "sync tool stderr");
        }

        if status.success() {
            let outcome = tally.into_outcome();
            info!(
                bucket = %invocation.bucket,
                files_changed = outcome.files_changed,
                bytes = ?outcome.bytes,
                "sync tool finished"
            );
            Ok(outcome)
        } else {
            Err(TransferError::Exit {
                code: status.code(),
                stderr: tail(&stderr_text),
            })
        }
    }

    fn describe(&self, invocation: &SyncInvocation) -> String {
        std::iter::once(self.program.as_os_str().to_os_string())
            .chain(Self::sync_args(invocation))
            .map(|arg| quote(&arg.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn preflight(&self, profile: &str) -> Result<String, TransferError> {
        let version = self.capture(&[OsString::from("--version")]).await?;
        info!(version = %version, "Sync tool version");

        let mut args: Vec<OsString> = vec!["sts".into(), "get-caller-identity".into()];
        push_profile(&mut args, profile);
        let identity = self.capture(&args).await?;
        let arn = serde_json::from_str::<serde_json::Value>(&identity)
            .ok()
            .and_then(|v| v.get("Arn").and_then(|a| a.as_str()).map(str::to_string))
            .unwrap_or_else(|| "Unknown".to_string());
        info!(identity = %arn, "Credentials resolved");
        Ok(format!("{version} as {arn}"))
    }
}
