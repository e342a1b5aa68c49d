//! Process-wide root logger.
//!
//! The first call to [`init`] or [`root`] installs the global `tracing`
//! subscriber; every later call returns the same [`RootLogger`] and ignores
//! its arguments. Request loggers are spans bound under this subscriber by
//! the pipeline's tracer.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};

static ROOT: OnceLock<RootLogger> = OnceLock::new();

/// How the root logger is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directives, e.g. `info` or `omnibus=debug,tower=warn`.
    pub level: String,
    /// Logger name attached to every request span.
    pub name: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            name: env!("CARGO_PKG_NAME").to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl From<&Config> for LogSettings {
    fn from(config: &Config) -> Self {
        Self {
            level: config.log_level.clone(),
            name: config.log_name.clone(),
            format: config.log_format,
        }
    }
}

/// Handle to the installed root logger.
#[derive(Debug)]
pub struct RootLogger {
    settings: LogSettings,
    installed: bool,
}

impl RootLogger {
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &LogSettings {
        &self.settings
    }

    /// Whether this logger owns the global subscriber.
    ///
    /// `false` when something else, such as a test harness, installed one first.
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

/// Install the root logger with `settings`, or return the existing one.
pub fn init(settings: LogSettings) -> &'static RootLogger {
    ROOT.get_or_init(|| install(settings))
}

/// The root logger, installed with default settings on first use.
pub fn root() -> &'static RootLogger {
    ROOT.get_or_init(|| install(LogSettings::default()))
}

fn install(settings: LogSettings) -> RootLogger {
    let filter = EnvFilter::try_new(&settings.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match settings.format {
        LogFormat::Pretty => builder.with_thread_ids(true).try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    }
    .is_ok();

    RootLogger {
        settings,
        installed,
    }
}
