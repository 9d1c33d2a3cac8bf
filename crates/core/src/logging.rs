//! Log filter resolution, the rolling log file and the crash report hook.
//!
//! Everything here runs before the tracing subscriber exists, so problems are
//! returned to the caller instead of logged.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fmt::Write as _,
    fs,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime is chatty at info level; keep it quiet unless asked for.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const LOG_RETENTION_DAYS: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
const LOG_FILE_PREFIX: &str = "volseg";
const LOG_FILE_SUFFIX: &str = "log";

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_HOOK_LOCK: Mutex<()> = Mutex::new(());
static WRITING_REPORT: AtomicBool = AtomicBool::new(false);
static REPORT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Inputs that decide the tracing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub rust_log: Option<String>,
}

impl LogSettings {
    pub fn from_env(verbose: u8, cli_filter: Option<&str>) -> Self {
        Self {
            verbose,
            cli_filter: cli_filter.map(ToString::to_string),
            rust_log: std::env::var("RUST_LOG").ok().filter(|v| !v.trim().is_empty()),
        }
    }

    /// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then `info`.
    /// The ort noise filter is prepended unless the level was picked on the
    /// command line.
    pub fn filter(&self) -> String {
        if let Some(filter) = &self.cli_filter {
            return filter.clone();
        }
        match self.verbose {
            0 => {}
            1 => return "debug".to_string(),
            _ => return "trace".to_string(),
        }
        let base = self.rust_log.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
        format!("{DEFAULT_NOISE_FILTER},{base}")
    }
}

/// Where the file layer writes, or why there is none.
#[derive(Debug)]
pub enum LogSink {
    File {
        dir: PathBuf,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_dir: Option<PathBuf>,
        reason: String,
    },
}

/// Open a daily rolling log under `<data_dir>/logs`, keeping
/// [`LOG_RETENTION_DAYS`] files.
pub fn open_log_sink(data_dir: Option<&Path>) -> LogSink {
    let Some(data_dir) = data_dir else {
        return LogSink::ConsoleOnly {
            attempted_dir: None,
            reason: "no data directory".to_string(),
        };
    };

    let dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&dir) {
        return LogSink::ConsoleOnly {
            attempted_dir: Some(dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_RETENTION_DAYS)
        .build(&dir);

    match built {
        Ok(appender) => LogSink::File { dir, appender },
        Err(error) => LogSink::ConsoleOnly {
            attempted_dir: Some(dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashHook {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
    Unavailable {
        crash_dir: Option<PathBuf>,
        reason: String,
    },
}

/// Chain a panic hook that saves a crash report under `<data_dir>/logs/crash`.
///
/// Panics on the tile producer and consumer threads surface as join errors in
/// the runner; the report keeps the payload and backtrace that the join error
/// loses. Only the first successful call installs anything.
pub fn install_crash_hook(data_dir: Option<&Path>) -> CrashHook {
    if let Some(dir) = CRASH_DIR.get() {
        return CrashHook::AlreadyInstalled(dir.clone());
    }
    let Some(data_dir) = data_dir else {
        return CrashHook::Unavailable {
            crash_dir: None,
            reason: "no data directory".to_string(),
        };
    };

    let dir = crash_dir(data_dir);
    if let Err(error) = fs::create_dir_all(&dir) {
        return CrashHook::Unavailable {
            crash_dir: Some(dir),
            reason: format!("failed to create crash directory: {error}"),
        };
    }

    let _guard = CRASH_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = CRASH_DIR.get() {
        return CrashHook::AlreadyInstalled(existing.clone());
    }

    let previous = panic::take_hook();
    let hook_dir = dir.clone();
    panic::set_hook(Box::new(move |info| {
        save_crash_report(&hook_dir, info);
        previous(info);
    }));
    let _ = CRASH_DIR.set(dir.clone());
    CrashHook::Installed(dir)
}

fn save_crash_report(dir: &Path, info: &PanicHookInfo<'_>) {
    // a panic while writing the report must not recurse into the hook
    if WRITING_REPORT.swap(true, Ordering::AcqRel) {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_into(dir)
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write crash report under '{}': {error}",
            dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash report writer panicked under '{}'",
            dir.display()
        ),
    }

    WRITING_REPORT.store(false, Ordering::Release);
}

#[derive(Debug)]
struct CrashReport {
    at: DateTime<Utc>,
    thread: String,
    location: String,
    message: String,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "<unknown>".to_string());

        let backtrace = Backtrace::capture();
        let backtrace = match backtrace.status() {
            BacktraceStatus::Captured => backtrace.to_string(),
            BacktraceStatus::Disabled => "<disabled, set RUST_BACKTRACE=1>".to_string(),
            _ => "<unavailable>".to_string(),
        };

        Self {
            at: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location,
            message: payload_message(info.payload()),
            backtrace,
        }
    }

    fn render(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "timestamp_utc={}", self.at.to_rfc3339());
        let _ = writeln!(text, "pid={}", std::process::id());
        let _ = writeln!(text, "version={}", env!("CARGO_PKG_VERSION"));
        let _ = writeln!(text, "thread={}", self.thread);
        let _ = writeln!(text, "location={}", self.location);
        let _ = writeln!(text, "payload={}", self.message);
        let _ = writeln!(text, "backtrace:");
        let _ = writeln!(text, "{}", self.backtrace);
        text
    }

    fn write_into(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let sequence = REPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "crash-{}-{}-{sequence:04}.log",
            self.at.format("%Y%m%dT%H%M%S%.3f"),
            std::process::id()
        ));
        fs::write(&path, self.render())?;
        Ok(path)
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    fn settings(verbose: u8, cli: Option<&str>, rust_log: Option<&str>) -> LogSettings {
        LogSettings {
            verbose,
            cli_filter: cli.map(ToString::to_string),
            rust_log: rust_log.map(ToString::to_string),
        }
    }

    #[test]
    fn filter_precedence() {
        assert_eq!(settings(0, None, None).filter(), "ort=error,info");
        assert_eq!(
            settings(0, None, Some("volseg_core::runner=debug")).filter(),
            "ort=error,volseg_core::runner=debug"
        );
        assert_eq!(settings(1, None, Some("warn")).filter(), "debug");
        assert_eq!(settings(3, None, Some("warn")).filter(), "trace");
        assert_eq!(
            settings(2, Some("volseg_core=trace"), Some("warn")).filter(),
            "volseg_core=trace"
        );
    }

    #[test]
    fn log_sink_opens_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        match open_log_sink(Some(data_dir.path())) {
            LogSink::File { dir, .. } => {
                assert_eq!(dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert!(dir.is_dir());
            }
            LogSink::ConsoleOnly { reason, .. } => panic!("expected file sink: {reason}"),
        }
    }

    #[test]
    fn log_sink_falls_back_to_console() {
        assert!(matches!(
            open_log_sink(None),
            LogSink::ConsoleOnly { attempted_dir: None, .. }
        ));

        let not_a_dir = NamedTempFile::new().expect("temp file");
        match open_log_sink(Some(not_a_dir.path())) {
            LogSink::File { .. } => panic!("a file cannot hold a log directory"),
            LogSink::ConsoleOnly {
                attempted_dir,
                reason,
            } => {
                assert_eq!(
                    attempted_dir,
                    Some(not_a_dir.path().join(DEFAULT_LOG_DIR_NAME))
                );
                assert!(reason.contains("failed to create log directory"));
            }
        }
    }

    #[test]
    fn crash_report_is_written_with_all_fields() {
        let dir = tempdir().expect("tempdir");
        let report = CrashReport {
            at: Utc::now(),
            thread: "tile-consumer".to_string(),
            location: "src/runner.rs:12:7".to_string(),
            message: "model returned NaN".to_string(),
            backtrace: "frames".to_string(),
        };

        let first = report.write_into(dir.path()).expect("write report");
        let second = report.write_into(dir.path()).expect("write report");
        assert_ne!(first, second);

        let contents = fs::read_to_string(&first).expect("read report");
        assert!(contents.starts_with("timestamp_utc="));
        assert!(contents.contains(&format!("pid={}", std::process::id())));
        assert!(contents.contains("thread=tile-consumer"));
        assert!(contents.contains("location=src/runner.rs:12:7"));
        assert!(contents.contains("payload=model returned NaN"));
        assert!(contents.ends_with("backtrace:\nframes\n"));
    }

    #[test]
    fn payload_message_handles_str_string_and_other() {
        let borrowed: &(dyn Any + Send) = &"boom";
        let owned: &(dyn Any + Send) = &"kaboom".to_string();
        let other: &(dyn Any + Send) = &7_u8;

        assert_eq!(payload_message(borrowed), "boom");
        assert_eq!(payload_message(owned), "kaboom");
        assert_eq!(payload_message(other), "<non-string panic payload>");
    }
}
