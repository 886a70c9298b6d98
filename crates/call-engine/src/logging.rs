//! Subscriber setup for the `lancall` binary
//!
//! The engine only emits `tracing` events. [`setup_logging`] installs a fmt
//! subscriber whose filter treats the lancall crates and everything else
//! (tokio, socket plumbing) separately, so `--log-level debug` does not drown
//! the console in dependency noise. `RUST_LOG`, when set, replaces the
//! computed filter entirely.

use std::str::FromStr;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{EngineError, Result};

/// Tracing targets of the workspace crates
pub const LANCALL_TARGETS: [&str; 3] = ["lancall_wire_core", "lancall_call_engine", "lancall"];

/// Console output flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// What the subscriber lets through and how it prints it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level for the lancall crates
    pub level: LevelFilter,
    /// Level for every other target
    pub dependency_level: LevelFilter,
    pub format: LogFormat,
    /// Print file:line with each event
    pub source_locations: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            dependency_level: LevelFilter::WARN,
            format: LogFormat::Pretty,
            source_locations: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_dependency_level(mut self, level: LevelFilter) -> Self {
        self.dependency_level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_source_locations(mut self) -> Self {
        self.source_locations = true;
        self
    }

    /// Filter directives, e.g. `warn,lancall_wire_core=debug,...`
    pub fn directives(&self) -> String {
        let mut directives = self.dependency_level.to_string().to_lowercase();
        for target in LANCALL_TARGETS {
            directives.push_str(&format!(",{}={}", target, self.level.to_string().to_lowercase()));
        }
        directives
    }

    fn filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(self.directives())
            .map_err(|e| EngineError::config(format!("bad log filter {:?}: {}", self.directives(), e)))
    }
}

/// Install the global subscriber; fails if one is already installed
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let builder = fmt::Subscriber::builder()
        .with_env_filter(config.filter()?)
        .with_file(config.source_locations)
        .with_line_number(config.source_locations);

    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| EngineError::config(format!("logging already initialized: {}", e)))?;

    tracing::debug!("Log filter: {}", config.directives());
    Ok(())
}

/// Parse `off`, `error`, `warn`, `info`, `debug` or `trace`
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level).map_err(|_| EngineError::config(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_quiet_dependencies() {
        assert_eq!(
            LoggingConfig::default().directives(),
            "warn,lancall_wire_core=info,lancall_call_engine=info,lancall=info"
        );
    }

    #[test]
    fn test_directives_follow_levels() {
        let config = LoggingConfig::new(LevelFilter::DEBUG).with_dependency_level(LevelFilter::OFF);
        assert_eq!(
            config.directives(),
            "off,lancall_wire_core=debug,lancall_call_engine=debug,lancall=debug"
        );
        assert!(EnvFilter::try_new(config.directives()).is_ok());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("WARN").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("off").unwrap(), LevelFilter::OFF);
        assert!(parse_level("loud").is_err());
    }
}
