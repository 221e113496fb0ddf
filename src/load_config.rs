use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use bucket_mirror_core::config::{load_configuration, SyncConfiguration};

/// Environment variable that overrides the profile from the config file.
pub const PROFILE_ENV: &str = "BUCKET_MIRROR_PROFILE";

/// Loads the config file and applies overrides: `BUCKET_MIRROR_PROFILE` over
/// the file, `profile_flag` over both. The merged result is validated again.
pub fn load_config<P: AsRef<Path>>(path: P, profile_flag: Option<&str>) -> Result<SyncConfiguration> {
    let path_ref = path.as_ref();
    let config = load_configuration(path_ref)
        .with_context(|| format!("Failed to load configuration from {}", path_ref.display()))?;
    apply_overrides(config, profile_flag)
}

/// Configuration for `run --bucket B --local-path P`. The profile overrides
/// apply the same way as for a file.
pub fn single_bucket_config(
    bucket: &str,
    local_path: &Path,
    profile_flag: Option<&str>,
) -> Result<SyncConfiguration> {
    let config = SyncConfiguration::single_bucket(bucket, local_path)
        .with_context(|| format!("Invalid single-bucket sync of {bucket} to {}", local_path.display()))?;
    apply_overrides(config, profile_flag)
}

fn apply_overrides(
    mut config: SyncConfiguration,
    profile_flag: Option<&str>,
) -> Result<SyncConfiguration> {
    if let Some(profile) = std::env::var(PROFILE_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty())
    {
        info!(profile = %profile, "Profile overridden from {PROFILE_ENV}");
        config.profile = profile;
    }
    if let Some(profile) = profile_flag {
        info!(profile = %profile, "Profile overridden from --profile");
        config.profile = profile.to_string();
    }

    config
        .validate()
        .context("Configuration is invalid after applying overrides")?;
    Ok(config)
}
