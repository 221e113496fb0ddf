use async_trait::async_trait;

use super::{run_checked, run_command, shell_quote, ScheduleRequest, SchedulerRegistration};
use crate::error::SchedulerRegistrationError;

/// User crontab. Lines are tagged with `# {label}` so they can be found again.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cron;

impl Cron {
    /// Hours must divide a day evenly; longer intervals must be whole days.
    pub fn expression(interval_hours: u64) -> Result<String, SchedulerRegistrationError> {
        match interval_hours {
            h @ 1..=23 if 24 % h == 0 => Ok(format!("0 */{h} * * *")),
            h if h >= 24 && h % 24 == 0 && h / 24 <= 31 => Ok(format!("0 0 */{} * *", h / 24)),
            h => Err(SchedulerRegistrationError::InvalidInterval(h)),
        }
    }

    pub fn line(request: &ScheduleRequest) -> Result<String, SchedulerRegistrationError> {
        let command = format!(
            "cd {} && {}",
            shell_quote(&request.working_dir.to_string_lossy()),
            request.command_line(),
        );
        Ok(format!(
            "{} {} {}",
            Self::expression(request.interval_hours)?,
            escape_percent(&command),
            tag(&request.label)
        ))
    }

    async fn current_crontab() -> Result<String, SchedulerRegistrationError> {
        // `crontab -l` exits non-zero when the user has no crontab yet.
        let output = run_command("crontab", &["-l".to_string()], None).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Ok(String::new())
        }
    }

    async fn install(table: &str) -> Result<(), SchedulerRegistrationError> {
        run_checked("crontab", &["-".to_string()], Some(table)).await?;
        Ok(())
    }
}

/// Cron turns an unescaped `%` in the command field into a newline.
fn escape_percent(text: &str) -> String {
    text.replace('%', r"\%")
}

fn tag(label: &str) -> String {
    format!("# {}", escape_percent(label))
}

fn is_tagged(line: &str, label: &str) -> bool {
    line.trim_end().ends_with(&tag(label))
}

/// `existing` without the lines tagged with `label`, plus `line` when given.
pub(crate) fn merge_crontab(existing: &str, label: &str, line: Option<&str>) -> String {
    let mut lines: Vec<&str> = existing
        .lines()
        .filter(|l| !is_tagged(l, label))
        .collect();
    if let Some(line) = line {
        lines.push(line);
    }
    let mut table = lines.join("\n");
    if !table.is_empty() {
        table.push('\n');
    }
    table
}

#[async_trait]
impl SchedulerRegistration for Cron {
    fn name(&self) -> &'static str {
        "cron"
    }

    fn render(&self, request: &ScheduleRequest) -> Result<String, SchedulerRegistrationError> {
        Self::line(request)
    }

    async fn register(&self, request: &ScheduleRequest) -> Result<(), SchedulerRegistrationError> {
        let line = Self::line(request)?;
        let existing = Self::current_crontab().await?;
        Self::install(&merge_crontab(&existing, &request.label, Some(&line))).await
    }

    async fn unregister(&self, label: &str) -> Result<(), SchedulerRegistrationError> {
        let existing = Self::current_crontab().await?;
        if !existing.lines().any(|l| is_tagged(l, label)) {
            return Ok(());
        }
        Self::install(&merge_crontab(&existing, label, None)).await
    }

    async fn status(&self, label: &str) -> Result<String, SchedulerRegistrationError> {
        let existing = Self::current_crontab().await?;
        Ok(existing
            .lines()
            .find(|l| is_tagged(l, label))
            .map(|l| format!("registered: {l}"))
            .unwrap_or_else(|| "not registered".to_string()))
    }
}
