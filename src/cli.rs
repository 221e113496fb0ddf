use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bucket_mirror_core::aws_cli::AwsCli;
use bucket_mirror_core::config::SyncConfiguration;
use bucket_mirror_core::contract::SyncPrimitive;
use bucket_mirror_core::coordinator::{RunOptions, SyncCoordinator};
use bucket_mirror_core::disk::SystemDiskProbe;
use bucket_mirror_core::logging;
use bucket_mirror_core::scheduler::{self, ScheduleRequest, DEFAULT_LABEL};
use bucket_mirror_core::status::{read_status, StatusWriter};

use crate::load_config::{load_config, single_bucket_config};

/// CLI for bucket-mirror: mirror S3 buckets to local disk.
#[derive(Parser)]
#[clap(
    name = "bucket-mirror",
    version,
    about = "Mirror S3 buckets to local disk through the AWS CLI, with retries and a status record"
)]
pub struct Cli {
    /// Path to the JSON or YAML config file
    #[clap(long, global = true, default_value = "config.json")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sync every configured bucket once
    Run {
        /// Log the commands that would run without transferring anything
        #[clap(long)]
        dry_run: bool,
        /// Credential profile, overriding the config file and environment
        #[clap(long)]
        profile: Option<String>,
        /// Resume an existing session directory instead of starting a new one
        #[clap(long)]
        session: Option<String>,
        /// Sync only this bucket, without reading a config file
        #[clap(long, requires = "local_path")]
        bucket: Option<String>,
        /// Destination root for --bucket
        #[clap(long, requires = "bucket")]
        local_path: Option<PathBuf>,
        /// Path to the AWS CLI, overriding the config file
        #[clap(long)]
        aws_cli: Option<PathBuf>,
    },
    /// Sync repeatedly until interrupted
    Watch {
        /// Hours between run starts; 0 runs back to back
        #[clap(long)]
        interval_hours: Option<u64>,
        #[clap(long)]
        dry_run: bool,
        #[clap(long)]
        profile: Option<String>,
        /// Path to the AWS CLI, overriding the config file
        #[clap(long)]
        aws_cli: Option<PathBuf>,
    },
    /// Load and validate the configuration
    Validate {
        /// Also check the AWS CLI is installed and the credentials resolve
        #[clap(long)]
        preflight: bool,
    },
    /// Show the last recorded status and the end of the log file
    Status {
        /// Number of log lines to show
        #[clap(long, default_value_t = 20)]
        lines: usize,
    },
    /// Register the sync job with the OS scheduler
    Schedule {
        #[clap(subcommand)]
        action: ScheduleAction,
    },
    /// Write a sample configuration file
    Init {
        /// Overwrite an existing file
        #[clap(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum ScheduleAction {
    /// Install or replace the recurring job
    Install {
        #[clap(long, default_value = DEFAULT_LABEL)]
        label: String,
        /// Hours between runs; defaults to automation.interval_hours
        #[clap(long)]
        interval_hours: Option<u64>,
        /// Print the scheduler artifact instead of installing it
        #[clap(long)]
        print: bool,
    },
    /// Remove the recurring job
    Remove {
        #[clap(long, default_value = DEFAULT_LABEL)]
        label: String,
    },
    /// Report whether the job is registered
    Status {
        #[clap(long, default_value = DEFAULT_LABEL)]
        label: String,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Commands::Run {
            dry_run,
            profile,
            session,
            bucket,
            local_path,
            aws_cli,
        } => {
            let mut config = match (bucket, local_path) {
                (Some(bucket), Some(local_path)) => {
                    single_bucket_config(&bucket, &local_path, profile.as_deref())?
                }
                _ => load_config(&config_path, profile.as_deref())?,
            };
            if aws_cli.is_some() {
                config.aws_cli = aws_cli;
            }
            run_once(config, dry_run, session).await
        }
        Commands::Watch {
            interval_hours,
            dry_run,
            profile,
            aws_cli,
        } => {
            let mut config = load_config(&config_path, profile.as_deref())?;
            if aws_cli.is_some() {
                config.aws_cli = aws_cli;
            }
            watch(config, interval_hours, dry_run).await
        }
        Commands::Validate { preflight } => validate(&config_path, preflight).await,
        Commands::Status { lines } => status(&config_path, lines),
        Commands::Schedule { action } => schedule(&config_path, action).await,
        Commands::Init { force } => init(&config_path, force),
    }
}

/// A simulated run leaves the destination untouched, log copy included.
fn init_logging(config: &SyncConfiguration, simulate: bool) -> Result<()> {
    let copy = if simulate {
        None
    } else {
        config.logging.destination_copy(&config.destination_root)
    };
    logging::init(&config.logging, copy.as_deref()).with_context(|| {
        format!(
            "Failed to open log file {}",
            config
                .logging
                .destination
                .as_deref()
                .or(copy.as_deref())
                .unwrap_or_else(|| Path::new("-"))
                .display()
        )
    })
}

/// In simulate mode a missing tool only costs the size estimate.
fn sync_tool(config: &SyncConfiguration, simulate: bool) -> Result<AwsCli> {
    match AwsCli::locate(config.aws_cli.as_deref()) {
        Ok(tool) => Ok(tool),
        Err(e) if simulate => {
            warn!(error = %e, "[DRY RUN] Sync tool not found, continuing without it");
            Ok(AwsCli::new(
                config.aws_cli.clone().unwrap_or_else(|| PathBuf::from("aws")),
            ))
        }
        Err(e) => Err(e).context("Sync tool is not available"),
    }
}

fn coordinator(
    config: SyncConfiguration,
    simulate: bool,
) -> Result<SyncCoordinator<AwsCli, SystemDiskProbe>> {
    let tool = sync_tool(&config, simulate)?;
    let status = StatusWriter::new(&config.status_file);
    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());
    Ok(SyncCoordinator::new(config, tool, SystemDiskProbe)
        .with_status(status)
        .with_shutdown(shutdown))
}

async fn run_once(config: SyncConfiguration, dry_run: bool, session: Option<String>) -> Result<()> {
    init_logging(&config, dry_run)?;
    let coordinator = coordinator(config, dry_run)?;

    let record = coordinator
        .run_once(&RunOptions {
            simulate: dry_run,
            session_id: session,
        })
        .await;

    for outcome in record.failed() {
        eprintln!(
            "[ERROR] {}: {}",
            outcome.bucket,
            outcome.error.as_deref().unwrap_or("failed")
        );
    }
    println!("{}", record.summary_line());
    if !record.success {
        bail!(
            "Sync run {} failed ({} of {} bucket(s) failed{})",
            record.session_id,
            record.failed().count(),
            record.buckets.len(),
            if record.cancelled { ", cancelled" } else { "" }
        );
    }
    Ok(())
}

async fn watch(config: SyncConfiguration, interval_hours: Option<u64>, dry_run: bool) -> Result<()> {
    init_logging(&config, dry_run)?;
    let interval = interval_hours
        .map(|h| Duration::from_secs(h.saturating_mul(3600)))
        .unwrap_or_else(|| config.automation.interval());
    let coordinator = coordinator(config, dry_run)?;

    let runs = coordinator.run_continuously(interval, dry_run).await;
    match coordinator.status().snapshot().last_run {
        Some(last) => {
            println!("Stopped after {runs} run(s); last: {}", last.summary_line());
            if !last.success {
                bail!(
                    "Last sync run {} failed ({} of {} bucket(s) failed{})",
                    last.session_id,
                    last.failed().count(),
                    last.buckets.len(),
                    if last.cancelled { ", cancelled" } else { "" }
                );
            }
        }
        None => println!("Stopped after {runs} run(s)"),
    }
    Ok(())
}

async fn validate(config_path: &Path, preflight: bool) -> Result<()> {
    let config = load_config(config_path, None)?;
    println!(
        "Configuration OK: {} bucket(s) -> {} (profile {})",
        config.buckets.len(),
        config.destination_root.display(),
        config.profile
    );
    for bucket in &config.buckets {
        println!("  - {bucket}");
    }
    if preflight {
        let tool = AwsCli::locate(config.aws_cli.as_deref()).context("Sync tool is not available")?;
        let identity = tool
            .preflight(&config.profile)
            .await
            .context("Preflight check failed")?;
        println!("Sync tool OK: {identity}");
    }
    Ok(())
}

fn status(config_path: &Path, lines: usize) -> Result<()> {
    let config = load_config(config_path, None)?;
    match read_status(&config.status_file)
        .with_context(|| format!("Failed to read {}", config.status_file.display()))?
    {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!(
            "No status recorded yet at {}",
            config.status_file.display()
        ),
    }

    if let Some(log) = config.logging.destination.as_deref().filter(|p| p.exists()) {
        let tail = logging::tail(log, lines)
            .with_context(|| format!("Failed to read {}", log.display()))?;
        println!("--- last {} line(s) of {} ---", tail.len(), log.display());
        for line in tail {
            println!("{line}");
        }
    }
    Ok(())
}

async fn schedule(config_path: &Path, action: ScheduleAction) -> Result<()> {
    let registration = scheduler::for_host().context("No scheduler available on this host")?;
    match action {
        ScheduleAction::Install {
            label,
            interval_hours,
            print,
        } => {
            let config = load_config(config_path, None)?;
            let absolute = std::fs::canonicalize(config_path)
                .with_context(|| format!("Failed to resolve {}", config_path.display()))?;
            let mut args = vec![
                "run".to_string(),
                "--config".to_string(),
                absolute.to_string_lossy().into_owned(),
            ];
            // Scheduled jobs start with a minimal PATH, so the tool is pinned now.
            match AwsCli::locate(config.aws_cli.as_deref()) {
                Ok(tool) => {
                    let program = std::fs::canonicalize(tool.program())
                        .unwrap_or_else(|_| tool.program().to_path_buf());
                    args.push("--aws-cli".to_string());
                    args.push(program.to_string_lossy().into_owned());
                }
                Err(e) => warn!(
                    error = %e,
                    "Sync tool not found now; the scheduled job will search for it on each run"
                ),
            }
            let request = ScheduleRequest {
                label,
                program: std::env::current_exe().context("Failed to locate own executable")?,
                args,
                working_dir: absolute
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
                interval_hours: interval_hours.unwrap_or(config.automation.interval_hours),
            };
            if print {
                println!("{}", registration.render(&request)?);
                return Ok(());
            }
            registration
                .register(&request)
                .await
                .with_context(|| format!("Failed to register {} with {}", request.label, registration.name()))?;
            info!(label = %request.label, scheduler = registration.name(), "Sync job registered");
            println!(
                "Registered {} with {} every {} hour(s)",
                request.label,
                registration.name(),
                request.interval_hours
            );
        }
        ScheduleAction::Remove { label } => {
            registration
                .unregister(&label)
                .await
                .with_context(|| format!("Failed to remove {label}"))?;
            println!("Removed {label} from {}", registration.name());
        }
        ScheduleAction::Status { label } => {
            println!("{}", registration.status(&label).await?);
        }
    }
    Ok(())
}

fn init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }
    SyncConfiguration::sample()
        .write_to(config_path)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Wrote sample configuration to {}", config_path.display());
    println!("Edit the bucket names and destination_root, then run `bucket-mirror validate`.");
    Ok(())
}

fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, finishing current transfer");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Ctrl-C handler failed, relying on SIGTERM");
                        terminate.recv().await;
                    }
                }
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Ctrl-C handler failed, shutdown only by terminating the process");
        std::future::pending::<()>().await;
    }
}
