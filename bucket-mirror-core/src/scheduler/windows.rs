use async_trait::async_trait;

use super::{run_checked, run_command, ScheduleRequest, SchedulerRegistration};
use crate::error::SchedulerRegistrationError;

/// Windows Task Scheduler through `schtasks`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskScheduler;

impl TaskScheduler {
    /// `/SC HOURLY /MO 1..23`, or `/SC DAILY /MO 1..365` for whole days.
    fn schedule(interval_hours: u64) -> Result<[String; 4], SchedulerRegistrationError> {
        let (kind, modifier) = match interval_hours {
            h @ 1..=23 => ("HOURLY", h),
            h if h % 24 == 0 && (1..=365).contains(&(h / 24)) => ("DAILY", h / 24),
            h => return Err(SchedulerRegistrationError::InvalidInterval(h)),
        };
        Ok([
            "/SC".to_string(),
            kind.to_string(),
            "/MO".to_string(),
            modifier.to_string(),
        ])
    }

    /// The `/TR` value: change into the working directory, then run.
    fn task_run(request: &ScheduleRequest) -> String {
        let command = std::iter::once(request.program.to_string_lossy().into_owned())
            .chain(request.args.iter().cloned())
            .map(|part| quote(&part))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "cmd /c cd /d {} && {}",
            quote(&request.working_dir.to_string_lossy()),
            command
        )
    }

    pub fn create_args(request: &ScheduleRequest) -> Result<Vec<String>, SchedulerRegistrationError> {
        let mut args = vec!["/Create".to_string(), "/F".to_string()];
        args.extend(Self::schedule(request.interval_hours)?);
        args.extend([
            "/TN".to_string(),
            request.label.clone(),
            "/TR".to_string(),
            Self::task_run(request),
        ]);
        Ok(args)
    }
}

/// Quotes for the Windows command line: whitespace or quotes force a quoted
/// argument, and embedded quotes are backslash-escaped.
fn quote(part: &str) -> String {
    if part.is_empty() || part.contains(|c: char| c.is_whitespace() || c == '"') {
        format!("\"{}\"", part.replace('"', "\\\""))
    } else {
        part.to_string()
    }
}

#[async_trait]
impl SchedulerRegistration for TaskScheduler {
    fn name(&self) -> &'static str {
        "schtasks"
    }

    fn render(&self, request: &ScheduleRequest) -> Result<String, SchedulerRegistrationError> {
        let args = Self::create_args(request)?;
        Ok(std::iter::once("schtasks".to_string())
            .chain(args.iter().map(|a| quote(a)))
            .collect::<Vec<_>>()
            .join(" "))
    }

    async fn register(&self, request: &ScheduleRequest) -> Result<(), SchedulerRegistrationError> {
        run_checked("schtasks", &Self::create_args(request)?, None).await?;
        Ok(())
    }

    async fn unregister(&self, label: &str) -> Result<(), SchedulerRegistrationError> {
        let query = ["/Query".to_string(), "/TN".to_string(), label.to_string()];
        if !run_command("schtasks", &query, None).await?.status.success() {
            return Ok(());
        }
        let delete = [
            "/Delete".to_string(),
            "/F".to_string(),
            "/TN".to_string(),
            label.to_string(),
        ];
        run_checked("schtasks", &delete, None).await?;
        Ok(())
    }

    async fn status(&self, label: &str) -> Result<String, SchedulerRegistrationError> {
        let query = [
            "/Query".to_string(),
            "/TN".to_string(),
            label.to_string(),
            "/FO".to_string(),
            "LIST".to_string(),
        ];
        let output = run_command("schtasks", &query, None).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Ok("not registered".to_string())
        }
    }
}
