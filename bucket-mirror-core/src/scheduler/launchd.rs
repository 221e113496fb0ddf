use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{run_checked, run_command, ScheduleRequest, SchedulerRegistration};
use crate::error::SchedulerRegistrationError;

/// Per-user launchd agent (macOS). Runs only while the user is logged in.
#[derive(Debug, Clone)]
pub struct LaunchAgent {
    agents_dir: PathBuf,
}

impl LaunchAgent {
    pub fn new(agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
        }
    }

    /// `~/Library/LaunchAgents`.
    pub fn for_current_user() -> Result<Self, SchedulerRegistrationError> {
        let home = std::env::var_os("HOME").ok_or_else(|| {
            SchedulerRegistrationError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "HOME is not set",
            ))
        })?;
        Ok(Self::new(Path::new(&home).join("Library/LaunchAgents")))
    }

    pub fn plist_path(&self, label: &str) -> PathBuf {
        self.agents_dir.join(format!("{label}.plist"))
    }

    pub fn plist(request: &ScheduleRequest) -> Result<String, SchedulerRegistrationError> {
        let seconds = match request.interval_hours {
            0 => return Err(SchedulerRegistrationError::InvalidInterval(0)),
            h => h
                .checked_mul(3600)
                .ok_or(SchedulerRegistrationError::InvalidInterval(h))?,
        };
        let program_arguments: String = std::iter::once(request.program.to_string_lossy().into_owned())
            .chain(request.args.iter().cloned())
            .map(|arg| format!("        <string>{}</string>\n", escape(&arg)))
            .collect();
        let label = escape(&request.label);
        Ok(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{program_arguments}    </array>
    <key>StartInterval</key>
    <integer>{seconds}</integer>
    <key>RunAtLoad</key>
    <true/>
    <key>WorkingDirectory</key>
    <string>{dir}</string>
    <key>StandardOutPath</key>
    <string>/tmp/{label}.log</string>
    <key>StandardErrorPath</key>
    <string>/tmp/{label}.error.log</string>
</dict>
</plist>
"#,
            dir = escape(&request.working_dir.to_string_lossy()),
        ))
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn path_arg(path: &Path) -> Vec<String> {
    vec![path.to_string_lossy().into_owned()]
}

#[async_trait]
impl SchedulerRegistration for LaunchAgent {
    fn name(&self) -> &'static str {
        "launchd"
    }

    fn render(&self, request: &ScheduleRequest) -> Result<String, SchedulerRegistrationError> {
        Self::plist(request)
    }

    async fn register(&self, request: &ScheduleRequest) -> Result<(), SchedulerRegistrationError> {
        let plist = Self::plist(request)?;
        let path = self.plist_path(&request.label);
        fs::create_dir_all(&self.agents_dir)?;
        if path.exists() {
            let mut args = vec!["unload".to_string()];
            args.extend(path_arg(&path));
            let output = run_command("launchctl", &args, None).await?;
            if !output.status.success() {
                warn!(plist = %path.display(), "launchctl unload of previous agent failed");
            }
        }
        fs::write(&path, plist)?;
        let mut args = vec!["load".to_string()];
        args.extend(path_arg(&path));
        run_checked("launchctl", &args, None).await?;
        info!(plist = %path.display(), "Launch agent loaded");
        Ok(())
    }

    async fn unregister(&self, label: &str) -> Result<(), SchedulerRegistrationError> {
        let path = self.plist_path(label);
        if !path.exists() {
            return Ok(());
        }
        let mut args = vec!["unload".to_string()];
        args.extend(path_arg(&path));
        let output = run_command("launchctl", &args, None).await?;
        if !output.status.success() {
            warn!(plist = %path.display(), "launchctl unload failed; removing plist anyway");
        }
        fs::remove_file(&path)?;
        Ok(())
    }

    async fn status(&self, label: &str) -> Result<String, SchedulerRegistrationError> {
        let path = self.plist_path(label);
        if !path.exists() {
            return Ok("not registered".to_string());
        }
        let output = run_command("launchctl", &["list".to_string(), label.to_string()], None).await?;
        if output.status.success() {
            Ok(format!(
                "loaded from {}\n{}",
                path.display(),
                String::from_utf8_lossy(&output.stdout).trim()
            ))
        } else {
            Ok(format!("plist present at {} but not loaded", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::request;

    #[test]
    fn plist_carries_interval_in_seconds_and_arguments() {
        let plist = LaunchAgent::plist(&request(6)).unwrap();
        assert!(plist.contains("<string>com.example.mirror</string>"));
        assert!(plist.contains("<integer>21600</integer>"));
        assert!(plist.contains("        <string>/opt/bucket mirror/bin/bucket-mirror</string>\n        <string>run</string>"));
        assert!(plist.contains("<key>WorkingDirectory</key>\n    <string>/srv/mirror</string>"));
        assert!(plist.contains("<key>RunAtLoad</key>\n    <true/>"));
    }

    #[test]
    fn plist_values_are_escaped() {
        let mut req = request(1);
        req.args.push("a&b<c>".into());
        let plist = LaunchAgent::plist(&req).unwrap();
        assert!(plist.contains("<string>a&amp;b&lt;c&gt;</string>"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(
            LaunchAgent::plist(&request(0)),
            Err(SchedulerRegistrationError::InvalidInterval(0))
        ));
    }

    #[tokio::test]
    async fn status_without_plist_reports_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let agent = LaunchAgent::new(dir.path());
        assert_eq!(
            agent.plist_path("com.example.mirror"),
            dir.path().join("com.example.mirror.plist")
        );
        assert_eq!(agent.status("com.example.mirror").await.unwrap(), "not registered");
        agent.unregister("com.example.mirror").await.unwrap();
    }
}
