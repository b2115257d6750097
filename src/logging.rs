// ============================================================================
// SECTION 4: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging for every omega process:
// - Structured logging (JSON support)
// - Stdout and daily-rolling file targets
// - Log levels and filtering through RUST_LOG
// - Rotating sink for the supervised child's stdout/stderr
// ============================================================================

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LogConfig;
use crate::error::{OmegaError, OmegaResult};

// ----------------------------------------------------------------------------
// 4.1 Logger Initialization
// ----------------------------------------------------------------------------

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the non-blocking file writer flushing; hold it until exit.
#[derive(Debug)]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn format_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer().with_writer(writer).with_target(true);
    match (config.format.as_str(), config.disable_timestamp) {
        ("json", false) => base.json().boxed(),
        ("json", true) => base.json().without_time().boxed(),
        ("pretty", false) => base.pretty().with_ansi(ansi).boxed(),
        ("pretty", true) => base.pretty().with_ansi(ansi).without_time().boxed(),
        (_, false) => base.compact().with_ansi(ansi).boxed(),
        (_, true) => base.compact().with_ansi(ansi).without_time().boxed(),
    }
}

/// Initialize logging: stdout (optional) plus a daily-rolling `file_name`
/// inside `dir`. `dir` is used as given; callers resolve it first.
pub fn init_logging(config: &LogConfig, dir: Option<&Path>, file_name: &str) -> OmegaResult<LogGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    if config.stdout {
        layers.push(format_layer(config, io::stdout, true));
    }

    let mut file_guard = None;
    if let Some(dir) = dir {
        fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(format_layer(config, writer, false));
        file_guard = Some(guard);
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(env_filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| OmegaError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "omega::init",
        level = %config.level,
        format = %config.format,
        file = file_name,
        "Logging initialized"
    );

    Ok(LogGuard { _file: file_guard })
}

// ----------------------------------------------------------------------------
// 4.2 Child Output Sink
// ----------------------------------------------------------------------------

/// Daily-rotated files receiving a supervised child's stdout and stderr.
///
/// The child writes to the file descriptor directly, so its output survives
/// a watchdog restart. Rotation happens when a new child is spawned.
#[derive(Debug, Clone)]
pub struct ChildLogSink {
    dir: PathBuf,
    prefix: String,
    max_files: usize,
}

impl ChildLogSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, max_files: usize) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            max_files: max_files.max(1),
        }
    }

    /// Path of today's file.
    pub fn current_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.prefix, Utc::now().format("%Y-%m-%d")))
    }

    /// Open today's file for appending and prune old rotations.
    pub fn open(&self) -> io::Result<File> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        self.prune()?;
        Ok(file)
    }

    fn prune(&self) -> io::Result<()> {
        let marker = format!("{}.", self.prefix);
        let mut rotated: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&marker))
                    .unwrap_or(false)
            })
            .collect();
        if rotated.len() <= self.max_files {
            return Ok(());
        }
        // Date suffixes sort lexicographically.
        rotated.sort();
        let excess = rotated.len() - self.max_files;
        for path in rotated.into_iter().take(excess) {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
