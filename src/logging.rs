//! Logger installation.
//!
//! Call [`create_logger`] before loading the config, then [`set_loglevel`]
//! once the config is known:
//!
//! ```no_run
//! use dakara_base::config::load_config;
//! use dakara_base::logging::{create_logger, set_loglevel, LoggerOptions};
//!
//! let logger = create_logger(LoggerOptions::default())?;
//! let config = load_config("player.yaml".as_ref(), false, &[])?;
//! set_loglevel(&logger, &config)?;
//! # Ok::<(), dakara_base::DakaraError>(())
//! ```

use std::io::{self, Write};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::{Config, DEFAULT_LOG_LEVEL};
use crate::error::{DakaraError, Result};
use crate::progress::multi_progress;

#[derive(Debug, Clone, Default)]
pub struct LoggerOptions {
    /// Print through the progress bars so both can share the terminal.
    pub wrap: bool,
    /// Initial level, `INFO` when unset.
    pub level: Option<String>,
}

/// Handle on the installed logger, used to change its level later on.
#[derive(Debug, Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: &str) -> Result<()> {
        let filter = level_filter(level)?;
        self.filter
            .reload(filter)
            .map_err(|e| DakaraError::ConfigurationError(format!("Unable to set log level: {}", e)))
    }
}

/// Installs the global logger, colored on stderr.
///
/// Records of the `log` facade are forwarded to it. Fails if a global logger
/// is already installed.
pub fn create_logger(options: LoggerOptions) -> Result<LogHandle> {
    let filter = level_filter(options.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL))?;
    let (filter, handle) = reload::Layer::new(filter);

    let writer = if options.wrap {
        BoxMakeWriter::new(|| ProgressWriter)
    } else {
        BoxMakeWriter::new(io::stderr)
    };
    let output = fmt::layer().with_writer(writer).with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .map_err(|e| DakaraError::ConfigurationError(format!("Logger already installed: {}", e)))?;

    // the filter decides, not the facade, so that raising the level later works
    log::set_max_level(log::LevelFilter::Trace);

    Ok(LogHandle { filter: handle })
}

/// Applies the `loglevel` key of the config.
pub fn set_loglevel(handle: &LogHandle, config: &Config) -> Result<()> {
    let level = config
        .get_str("loglevel")
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    handle.set_level(&level)
}

/// Parses `DEBUG`, `info`, `warning`, `critical` and friends.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    let normalized = match level.trim().to_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "notset" => "trace".to_string(),
        other => other.to_string(),
    };
    normalized
        .parse()
        .map_err(|_| DakaraError::ConfigurationError(format!("Unknown log level '{}'", level)))
}

fn level_filter(level: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::default().add_directive(parse_level(level)?.into()))
}

struct ProgressWriter;

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        multi_progress().suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("info").unwrap(), LevelFilter::INFO);
        assert_eq!(parse_level("Warning").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("CRITICAL").unwrap(), LevelFilter::ERROR);
        assert!(matches!(
            parse_level("loud"),
            Err(DakaraError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_logger_installs_once() {
        let handle = create_logger(LoggerOptions {
            wrap: true,
            level: Some("WARNING".to_string()),
        })
        .unwrap();

        let config = Config::from_value("TESTLOG", serde_json::json!({"loglevel": "DEBUG"})).unwrap();
        set_loglevel(&handle, &config).unwrap();
        assert!(handle.set_level("nonsense").is_err());

        assert!(matches!(
            create_logger(LoggerOptions::default()),
            Err(DakaraError::ConfigurationError(_))
        ));
    }
}
