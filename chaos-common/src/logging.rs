//! Tracing subscriber setup shared by the chaos binaries.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `chaosd=debug,info`.
    pub level: String,
    pub format: LogFormat,
    /// Write to stderr (stdout otherwise). Workers keep stdout clean.
    pub stderr: bool,
    /// Optional daily-rotated log file, written through a non-blocking appender.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Build from `CHAOS_LOG`, `CHAOS_LOG_FORMAT` and `CHAOS_LOG_FILE`,
    /// falling back to `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("CHAOS_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| default_level.to_string());
        let format = std::env::var("CHAOS_LOG_FORMAT")
            .ok()
            .and_then(|f| f.parse().ok())
            .unwrap_or_default();
        let file = std::env::var("CHAOS_LOG_FILE")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        Self {
            level,
            format,
            stderr: false,
            file,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Keeps non-blocking writers flushing until dropped at process exit.
#[must_use = "dropping the guards stops log flushing"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log filter '{}'", config.level))?;

    let mut guards = Vec::new();

    let (console, guard) = if config.stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };
    guards.push(guard);

    let console_layer = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(console)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_writer(console)
            .compact()
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_writer(console)
            .json()
            .with_current_span(true)
            .boxed(),
    };

    let file_layer = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "chaos.log".to_string());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LoggingGuards { _guards: guards })
}
