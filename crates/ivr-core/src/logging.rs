//! Logging setup for applications driving lines
//!
//! The library only emits `tracing` events, inside a `line` span carrying the line id
//! for every public line operation. Installing a subscriber is up to the application;
//! [`setup_logging`] is the usual way to do it.

use std::str::FromStr;

use tracing::{Level, Span};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{LineError, LineResult};

const CRATE_TARGET: &str = "ivr_core";
const DRIVER_TARGET: &str = "ivr_core::driver";

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for this crate's events
    pub level: Level,
    /// Separate level for the driver boundary and the simulator, which log every
    /// event poll at trace level
    pub driver_level: Option<Level>,
    /// JSON lines instead of human readable output
    pub json: bool,
    /// Log `line` span enter and exit
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            driver_level: None,
            json: false,
            log_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    pub fn with_driver_level(mut self, level: Level) -> Self {
        self.driver_level = Some(level);
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    /// Filter directives for this configuration, crate-wide first
    pub fn directives(&self) -> Vec<String> {
        let mut directives = vec![format!("{CRATE_TARGET}={}", self.level)];
        if let Some(level) = self.driver_level {
            directives.push(format!("{DRIVER_TARGET}={level}"));
        }
        directives
    }

    /// `RUST_LOG` first, then this configuration's directives on top
    pub fn env_filter(&self) -> LineResult<EnvFilter> {
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        for directive in self.directives() {
            let parsed: Directive = directive
                .parse()
                .map_err(|e| LineError::config(format!("bad log directive {directive}: {e}")))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install a global subscriber for this crate's events
///
/// Fails with [`LineError::Configuration`] when a global subscriber is already installed.
pub fn setup_logging(config: &LoggingConfig) -> LineResult<()> {
    let filter = config.env_filter()?;
    let span_events = if config.log_spans {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events);

    let installed = if config.json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| LineError::config(format!("logging already installed: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        directives = ?config.directives(),
        "ivr-core logging ready"
    );
    Ok(())
}

/// Parse a level name such as `debug` or `WARN`
pub fn parse_log_level(level: &str) -> LineResult<Level> {
    Level::from_str(level).map_err(|_| LineError::config(format!("invalid log level: {level}")))
}

/// Span wrapping one operation on line `line`
pub fn line_span(line: u32) -> Span {
    tracing::info_span!("line", line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(matches!(
            parse_log_level("loud"),
            Err(LineError::Configuration { .. })
        ));
    }

    #[test]
    fn test_directives() {
        assert_eq!(LoggingConfig::default().directives(), vec!["ivr_core=INFO"]);

        let config = LoggingConfig::new(Level::DEBUG).with_driver_level(Level::TRACE);
        assert_eq!(
            config.directives(),
            vec!["ivr_core=DEBUG", "ivr_core::driver=TRACE"]
        );
        assert!(config.env_filter().is_ok());
    }
}
