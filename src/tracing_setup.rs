//! Tracing initialisation
//!
//! Builds a `tracing-subscriber` registry with an `EnvFilter` and one of
//! three formatters. `RUST_LOG` takes precedence over the configured level.
//! Logs go to stderr so the readout on stdout stays clean.
//!
//! # Example
//! ```no_run
//! use pm_monitor::{config::Settings, tracing_setup::TracingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! let config = TracingConfig::from_settings(&settings)?.overridden(None, Some("json"))?;
//! pm_monitor::tracing_setup::init(config);
//! tracing::info!("Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    EnvFilter, Layer, Registry,
};

/// Log line layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured
    Pretty,
    /// Single-line, no colours
    Compact,
    /// One JSON object per event
    Json,
}

/// Everything needed to install the global subscriber.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Log line layout
    pub format: OutputFormat,
    /// Also log when spans (e.g. an acquisition run) open and close
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
}

impl TracingConfig {
    /// Tracing config from the `[application]` settings.
    ///
    /// # Errors
    ///
    /// Returns a message if the level or format is not recognised.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            format: parse_output_format(&settings.application.log_format)?,
            with_span_events: false,
            with_file_and_line: false,
        })
    }

    /// Replace the level and/or format, e.g. from command-line flags.
    ///
    /// # Errors
    ///
    /// Returns a message if a given value is not recognised.
    pub fn overridden(
        mut self,
        level: Option<&str>,
        format: Option<&str>,
    ) -> Result<Self, String> {
        if let Some(level) = level {
            self.level = parse_log_level(level)?;
        }
        if let Some(format) = format {
            self.format = parse_output_format(format)?;
        }
        Ok(self)
    }
}

/// Install the global subscriber. A no-op if one is already installed.
pub fn init(config: TracingConfig) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(layer.with_filter(env_filter));
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }
}

/// Parse a level name, case-insensitively.
///
/// # Errors
///
/// Returns a message naming the accepted levels.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}

/// Parse a format name, case-insensitively.
///
/// # Errors
///
/// Returns a message naming the accepted formats.
pub fn parse_output_format(format: &str) -> Result<OutputFormat, String> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(format!(
            "Invalid log format '{}'. Must be one of: pretty, compact, json",
            format
        )),
    }
}
