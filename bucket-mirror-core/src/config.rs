//! Configuration model and loader.
//!
//! The file is JSON (by `.json` extension) or YAML. Both the original key names
//! of the JSON format (`s3_buckets`, `local_base_path`, `aws_profile`, `sse`,
//! `file`) and the descriptive names used here are accepted. Unknown keys are
//! ignored so older binaries keep reading newer files.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::ConfigError;

/// Fully loaded configuration. Read-only after load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncConfiguration {
    pub buckets: Vec<String>,
    pub destination_root: PathBuf,
    pub profile: String,
    pub source_namespace: String,
    pub session_prefix: String,
    pub status_file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_cli: Option<PathBuf>,
    pub sync_options: SyncOptions,
    pub logging: LoggingOptions,
    pub automation: AutomationOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub delete: bool,
    pub exclude_patterns: Vec<String>,
    pub include_patterns: Vec<String>,
    pub storage_class: Option<String>,
    #[serde(alias = "sse")]
    pub encrypt: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            delete: true,
            exclude_patterns: vec!["*.tmp".to_string(), "*/temp/*".to_string()],
            include_patterns: Vec::new(),
            storage_class: None,
            encrypt: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    pub level: String,
    #[serde(alias = "file")]
    pub destination: Option<PathBuf>,
    pub max_size_mb: u64,
    pub backup_count: usize,
    /// Also write the log to `{destination_root}/logs/status.log`.
    pub copy_to_destination: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            destination: Some(PathBuf::from("logs/status.log")),
            max_size_mb: 10,
            backup_count: 5,
            copy_to_destination: true,
        }
    }
}

impl LoggingOptions {
    /// Path of the log copy kept with the mirrored data, when enabled.
    pub fn destination_copy(&self, destination_root: &Path) -> Option<PathBuf> {
        self.copy_to_destination
            .then(|| destination_root.join("logs").join("status.log"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationOptions {
    pub enabled: bool,
    pub interval_hours: u64,
    pub max_retries: u32,
    pub retry_delay_minutes: u64,
}

impl Default for AutomationOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: 6,
            max_retries: 3,
            retry_delay_minutes: 5,
        }
    }
}

impl AutomationOptions {
    /// Total attempts a bucket gets in one run. Never less than one.
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_minutes.saturating_mul(60))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.saturating_mul(3600))
    }
}

/// A bucket may be listed by name or as `{ name: ... }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BucketEntry {
    Name(String),
    Object { name: Option<String> },
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(alias = "s3_buckets")]
    buckets: Option<Vec<BucketEntry>>,
    #[serde(alias = "local_base_path")]
    destination_root: Option<PathBuf>,
    #[serde(alias = "aws_profile")]
    profile: Option<String>,
    source_namespace: Option<String>,
    session_prefix: Option<String>,
    status_file: Option<PathBuf>,
    aws_cli: Option<PathBuf>,
    #[serde(default)]
    sync_options: SyncOptions,
    #[serde(default)]
    logging: LoggingOptions,
    #[serde(default)]
    automation: AutomationOptions,
}

/// Loads and validates the configuration at `path`.
pub fn load_configuration<P: AsRef<Path>>(path: P) -> Result<SyncConfiguration, ConfigError> {
    let path = path.as_ref();
    info!(config_path = %path.display(), "Loading configuration from file");

    let content = fs::read_to_string(path).map_err(|source| {
        error!(error = %source, config_path = %path.display(), "Failed to read config file");
        ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let raw = parse_raw(path, &content)?;
    let config = from_raw(raw)?;
    config.validate()?;
    config.trace_loaded();
    Ok(config)
}

fn parse_raw(path: &Path, content: &str) -> Result<RawConfig, ConfigError> {
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let parsed = if is_json {
        serde_json::from_str::<RawConfig>(content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str::<RawConfig>(content).map_err(|e| e.to_string())
    };

    parsed.map_err(|message| {
        let message = explain_duplicate_alias(message);
        error!(error = %message, config_path = %path.display(), "Failed to parse config file");
        ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        }
    })
}

/// Keys that may be written under either name.
const KEY_ALIASES: &[(&str, &str)] = &[
    ("buckets", "s3_buckets"),
    ("destination_root", "local_base_path"),
    ("profile", "aws_profile"),
];

/// A file that uses both spellings of one key gets a message naming both.
fn explain_duplicate_alias(message: String) -> String {
    let hit = KEY_ALIASES.iter().find(|(name, alias)| {
        message.contains(&format!("duplicate field `{name}`"))
            || message.contains(&format!("duplicate field `{alias}`"))
    });
    match hit {
        Some((name, alias)) => {
            format!("{message} (`{name}` and `{alias}` are the same setting; keep only one)")
        }
        None => message,
    }
}

fn from_raw(raw: RawConfig) -> Result<SyncConfiguration, ConfigError> {
    let entries = raw.buckets.ok_or(ConfigError::MissingField("buckets"))?;
    let destination_root = raw
        .destination_root
        .ok_or(ConfigError::MissingField("destination_root"))?;

    let mut buckets = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let name = match entry {
            BucketEntry::Name(name) => Some(name),
            BucketEntry::Object { name } => name,
        };
        match name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            Some(name) => buckets.push(name),
            None => {
                return Err(ConfigError::Invalid {
                    field: format!("buckets[{index}]"),
                    reason: "bucket entry has no name".to_string(),
                })
            }
        }
    }

    Ok(SyncConfiguration {
        buckets,
        destination_root,
        profile: raw.profile.unwrap_or_else(|| "default".to_string()),
        source_namespace: raw.source_namespace.unwrap_or_else(|| "s3".to_string()),
        session_prefix: raw.session_prefix.unwrap_or_else(|| "mirror".to_string()),
        status_file: raw
            .status_file
            .unwrap_or_else(|| PathBuf::from("logs/status.json")),
        aws_cli: raw.aws_cli,
        sync_options: raw.sync_options,
        logging: raw.logging,
        automation: raw.automation,
    })
}

impl SyncConfiguration {
    /// Checks the invariants a run depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destination_root.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("destination_root"));
        }
        if self.profile.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "profile".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        for (field, segment) in [
            ("source_namespace", &self.source_namespace),
            ("session_prefix", &self.session_prefix),
        ] {
            if segment.is_empty() || segment.contains(['/', '\\']) {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "must be a single non-empty path segment".to_string(),
                });
            }
        }
        if let Some(bad) = self
            .buckets
            .iter()
            .find(|b| b.contains(['/', '\\']) || b.as_str() == "." || b.as_str() == "..")
        {
            return Err(ConfigError::Invalid {
                field: "buckets".to_string(),
                reason: format!("`{bad}` is not a valid bucket name"),
            });
        }
        if crate::logging::parse_level(&self.logging.level).is_none() {
            return Err(ConfigError::Invalid {
                field: "logging.level".to_string(),
                reason: format!("unknown level `{}`", self.logging.level),
            });
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            buckets = self.buckets.len(),
            destination_root = %self.destination_root.display(),
            profile = %self.profile,
            interval_hours = self.automation.interval_hours,
            max_retries = self.automation.max_retries,
            "Loaded configuration"
        );
        debug!(?self, "Configuration loaded (full debug)");
    }

    /// One-off configuration syncing `bucket` into `destination_root`, with
    /// defaults for everything else. No file is involved.
    pub fn single_bucket(
        bucket: &str,
        destination_root: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let bucket = bucket.trim();
        if bucket.is_empty() {
            return Err(ConfigError::Invalid {
                field: "bucket".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        let config = Self {
            buckets: vec![bucket.to_string()],
            destination_root: destination_root.into(),
            profile: "default".to_string(),
            source_namespace: "s3".to_string(),
            session_prefix: "mirror".to_string(),
            status_file: PathBuf::from("logs/status.json"),
            aws_cli: None,
            sync_options: SyncOptions::default(),
            logging: LoggingOptions::default(),
            automation: AutomationOptions::default(),
        };
        config.validate()?;
        info!(bucket, destination_root = %config.destination_root.display(), "Using single-bucket configuration");
        Ok(config)
    }

    /// Starter configuration written by `init`.
    pub fn sample() -> Self {
        let mut sync_options = SyncOptions::default();
        sync_options.exclude_patterns.extend(
            [
                "*.temp",
                "*/cache/*",
                "*/.cache/*",
                "*/tmp/*",
                ".DS_Store",
                "._*",
                ".Spotlight-V100/*",
                ".Trashes/*",
                ".fseventsd/*",
            ]
            .iter()
            .map(|p| p.to_string()),
        );

        Self {
            buckets: vec!["my-important-bucket".to_string(), "my-data-bucket".to_string()],
            destination_root: PathBuf::from("./mirror_backup"),
            profile: "default".to_string(),
            source_namespace: "s3".to_string(),
            session_prefix: "mirror".to_string(),
            status_file: PathBuf::from("logs/status.json"),
            aws_cli: None,
            sync_options,
            logging: LoggingOptions::default(),
            automation: AutomationOptions::default(),
        }
    }

    /// Serializes the configuration to `path`, as JSON for `.json` files and
    /// YAML otherwise.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let rendered = if is_json {
            serde_json::to_string_pretty(self).map_err(|e| e.to_string())
        } else {
            serde_yaml::to_string(self).map_err(|e| e.to_string())
        }
        .map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, rendered).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    }
}
