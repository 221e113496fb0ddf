//! Log sink setup.
//!
//! Lines look like `2024-03-09 14:05:07 - WARNING - message key=value`, the
//! format the dashboard filters on. The file sink is append-only and rotates
//! by size, keeping a bounded number of numbered backups (`status.log.1`,
//! `status.log.2`, ...). A second copy can be kept next to the mirrored data
//! so the history travels with the backup volume.

use chrono::Local;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingOptions;

/// Accepts the level names of the config file, including `WARNING` and
/// `CRITICAL`.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" | "CRITICAL" => Some(Level::ERROR),
        _ => None,
    }
}

fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARNING",
        Level::ERROR => "ERROR",
    }
}

/// `timestamp - LEVEL - fields` event format.
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} - {} - ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level_label(event.metadata().level())
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Append-only file that rolls over once it would exceed `max_bytes`.
pub struct SizeRotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl SizeRotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    pub fn backup_path(&self, index: usize) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups > 0 {
            remove_if_exists(&self.backup_path(self.backups))?;
            for index in (1..self.backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
            self.file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
        } else {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
        }
        self.written = 0;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Write for SizeRotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0
            && self.written > 0
            && self.written + buf.len() as u64 > self.max_bytes
        {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Every line goes to each file.
pub struct FileSinks(Vec<SizeRotatingFile>);

impl FileSinks {
    pub fn new(sinks: Vec<SizeRotatingFile>) -> Self {
        Self(sinks)
    }
}

impl Write for FileSinks {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut first_error = None;
        for sink in &mut self.0 {
            if let Err(e) = sink.write_all(buf) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in &mut self.0 {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Installs the global subscriber: console on stderr plus the rotating file
/// sinks. `copy` is a second log file, usually under the destination root.
/// `RUST_LOG` overrides the configured level. Calling it again after a
/// subscriber is set is a no-op.
pub fn init(options: &LoggingOptions, copy: Option<&Path>) -> io::Result<()> {
    let level = parse_level(&options.level).unwrap_or(Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    let console = tracing_subscriber::fmt::layer()
        .event_format(LineFormat)
        .with_writer(io::stderr);

    let max_bytes = options.max_size_mb.saturating_mul(1024 * 1024);
    let mut sinks = Vec::new();
    for path in options.destination.as_deref().into_iter().chain(copy) {
        if sinks.iter().any(|s: &SizeRotatingFile| s.path == path) {
            continue;
        }
        sinks.push(SizeRotatingFile::open(path, max_bytes, options.backup_count)?);
    }
    let file_layer = if sinks.is_empty() {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_ansi(false)
                .with_writer(Mutex::new(FileSinks::new(sinks))),
        )
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();
    Ok(())
}

/// Last `lines` lines of the log file.
pub fn tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn level_names_from_config() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level(" INFO "), Some(Level::INFO));
        assert_eq!(parse_level("CRITICAL"), Some(Level::ERROR));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn events_are_written_as_level_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.log");
        let sink = SizeRotatingFile::open(&path, 0, 0).unwrap();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .event_format(LineFormat)
            .with_writer(Mutex::new(sink))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let bucket = "photos";
            tracing::warn!(bucket = %bucket, "disk low");
            tracing::error!("sync failed");
        });

        let lines = tail(&path, 10).unwrap();
        assert_eq!(lines.len(), 2);
        let warn = Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2} - WARNING - disk low bucket=photos$").unwrap();
        assert!(warn.is_match(&lines[0]), "got: {}", lines[0]);
        assert!(lines[1].contains(" - ERROR - sync failed"), "got: {}", lines[1]);
    }

    #[test]
    fn file_rotates_by_size_and_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/status.log");
        let mut sink = SizeRotatingFile::open(&path, 64, 2).unwrap();

        for i in 0..5 {
            sink.write_all(format!("line {i} {}\n", "x".repeat(30)).as_bytes())
                .unwrap();
        }
        sink.flush().unwrap();

        assert!(path.exists());
        assert!(sink.backup_path(1).exists());
        assert!(sink.backup_path(2).exists());
        assert!(!sink.backup_path(3).exists());
        let newest = fs::read_to_string(&path).unwrap();
        assert!(newest.starts_with("line 4"), "got: {newest}");
        let previous = fs::read_to_string(sink.backup_path(1)).unwrap();
        assert!(previous.starts_with("line 3"), "got: {previous}");
    }

    #[test]
    fn every_file_sink_receives_each_line() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("logs/status.log");
        let copy = dir.path().join("backup/logs/status.log");
        let sinks = FileSinks::new(vec![
            SizeRotatingFile::open(&local, 0, 0).unwrap(),
            SizeRotatingFile::open(&copy, 0, 0).unwrap(),
        ]);
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .event_format(LineFormat)
            .with_writer(Mutex::new(sinks))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(bucket = "photos", "[SYNC] Processing bucket");
        });

        for path in [&local, &copy] {
            let lines = tail(path, 10).unwrap();
            assert_eq!(lines.len(), 1, "{}", path.display());
            assert!(lines[0].contains(" - INFO - [SYNC] Processing bucket"), "got: {}", lines[0]);
        }
    }

    #[test]
    fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.log");
        fs::write(&path, "a\nb\nc\n").unwrap();
        assert_eq!(tail(&path, 2).unwrap(), vec!["b", "c"]);
        assert_eq!(tail(&path, 10).unwrap(), vec!["a", "b", "c"]);
    }
}
