//! Configuration system using Figment
//!
//! Settings are loaded from:
//! 1. `config/pm_monitor.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `PM_MONITOR_`, with `__` separating
//!    nested keys
//!
//! ```text
//! PM_MONITOR_APPLICATION__LOG_LEVEL=debug
//! PM_MONITOR_INSTRUMENT__IO_TIMEOUT=500ms
//! PM_MONITOR_ACQUISITION__WINDOW_SIZE=20
//! ```
//!
//! Every field has a default, so a missing file yields a usable configuration.
//!
//! [`AcquisitionConfig`] is the per-run configuration the presentation layer
//! collects (window size, offset, frequency, delay). It is validated before any
//! instrument I/O happens.

use crate::error::{AppResult, MonitorError};
use crate::instrument::ResourceFilter;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default location of the settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/pm_monitor.toml";

/// Largest accepted averaging window.
pub const MAX_WINDOW_SIZE: usize = 1_000_000;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    Load(#[from] figment::Error),
    /// Values parsed but are not acceptable.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument discovery and I/O settings
    #[serde(default)]
    pub instrument: InstrumentSettings,
    /// Default acquisition inputs
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Which resource manager the application talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// System VISA library (requires the `instrument_visa` feature).
    #[default]
    Visa,
    /// In-process simulated power meter.
    Simulated,
}

/// Where the user offset is applied. Either way it is applied exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetMode {
    /// Instrument gain is zeroed and the offset is added to every reading.
    #[default]
    PostRead,
    /// Offset is written as the instrument gain and readings are used as-is.
    Instrument,
}

impl OffsetMode {
    /// Gain written to the instrument for a user offset.
    pub fn instrument_gain(self, offset_db: f64) -> f64 {
        match self {
            OffsetMode::PostRead => 0.0,
            OffsetMode::Instrument => offset_db,
        }
    }

    /// Amount added to every raw reading for a user offset.
    pub fn reading_offset(self, offset_db: f64) -> f64 {
        match self {
            OffsetMode::PostRead => offset_db,
            OffsetMode::Instrument => 0.0,
        }
    }
}

/// Instrument discovery, I/O timeout and failure policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// Resource manager backend
    #[serde(default)]
    pub backend: Backend,
    /// Address prefix identifying the bus/interface class (e.g. "USB0")
    #[serde(default = "default_interface_prefix")]
    pub interface_prefix: String,
    /// Vendor code expected inside the address (e.g. "MY")
    #[serde(default = "default_vendor_code")]
    pub vendor_code: String,
    /// Byte offset of the vendor code in the address
    #[serde(default = "default_vendor_offset")]
    pub vendor_offset: usize,
    /// Bound on every write/query
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Consecutive read failures tolerated before the run fails
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// How long `stop()` waits for the worker before aborting it
    #[serde(default = "default_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Where the user offset is applied
    #[serde(default)]
    pub offset_mode: OffsetMode,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            interface_prefix: default_interface_prefix(),
            vendor_code: default_vendor_code(),
            vendor_offset: default_vendor_offset(),
            io_timeout: default_io_timeout(),
            max_consecutive_failures: default_max_consecutive_failures(),
            stop_grace: default_stop_grace(),
            offset_mode: OffsetMode::default(),
        }
    }
}

impl InstrumentSettings {
    /// Address filter used during discovery.
    pub fn filter(&self) -> ResourceFilter {
        ResourceFilter::new(
            self.interface_prefix.clone(),
            self.vendor_code.clone(),
            self.vendor_offset,
        )
    }
}

/// Per-run acquisition configuration collected from the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Averaging window capacity
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Offset in dB added to each reading
    #[serde(default)]
    pub offset_db: f64,
    /// Measurement frequency in GHz
    #[serde(default = "default_frequency_ghz")]
    pub frequency_ghz: f64,
    /// Interval between samples in seconds
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            offset_db: 0.0,
            frequency_ghz: default_frequency_ghz(),
            delay_seconds: default_delay_seconds(),
        }
    }
}

impl AcquisitionConfig {
    /// Parse the four text inputs of the presentation form.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Configuration`] naming the first offending field.
    pub fn from_inputs(
        window: &str,
        offset: &str,
        frequency: &str,
        delay: &str,
    ) -> AppResult<Self> {
        let config = Self {
            window_size: parse_window_size(window)?,
            offset_db: parse_number("offset", offset)?,
            frequency_ghz: parse_number("frequency", frequency)?,
            delay_seconds: parse_number("delay", delay)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration before any hardware I/O.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Configuration`] with a descriptive message.
    pub fn validate(&self) -> AppResult<()> {
        if self.window_size < 1 {
            return Err(MonitorError::Configuration(
                "window size must be at least 1".to_string(),
            ));
        }
        if self.window_size > MAX_WINDOW_SIZE {
            return Err(MonitorError::Configuration(format!(
                "window size {} exceeds the maximum of {}",
                self.window_size, MAX_WINDOW_SIZE
            )));
        }
        if !self.offset_db.is_finite() {
            return Err(MonitorError::Configuration(format!(
                "offset must be finite, got {}",
                self.offset_db
            )));
        }
        if !self.frequency_ghz.is_finite() || self.frequency_ghz <= 0.0 {
            return Err(MonitorError::Configuration(format!(
                "frequency must be a positive number of GHz, got {}",
                self.frequency_ghz
            )));
        }
        if !self.delay_seconds.is_finite() || self.delay_seconds <= 0.0 {
            return Err(MonitorError::Configuration(format!(
                "delay must be greater than 0 s, got {}",
                self.delay_seconds
            )));
        }
        self.delay().map(|_| ())
    }

    /// Sampling cadence.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Configuration`] if the delay is not representable.
    pub fn delay(&self) -> AppResult<Duration> {
        Duration::try_from_secs_f64(self.delay_seconds).map_err(|e| {
            MonitorError::Configuration(format!("delay {} s is invalid: {}", self.delay_seconds, e))
        })
    }
}

fn parse_number(field: &str, text: &str) -> AppResult<f64> {
    text.trim().parse::<f64>().map_err(|_| {
        MonitorError::Configuration(format!("{} must be numeric, got '{}'", field, text.trim()))
    })
}

fn parse_window_size(text: &str) -> AppResult<usize> {
    let value = parse_number("window size", text)?;
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(MonitorError::Configuration(format!(
            "window size must be a whole number, got '{}'",
            text.trim()
        )));
    }
    if value < 1.0 {
        return Err(MonitorError::Configuration(format!(
            "window size must be at least 1, got {}",
            value
        )));
    }
    if value > MAX_WINDOW_SIZE as f64 {
        return Err(MonitorError::Configuration(format!(
            "window size {} exceeds the maximum of {}",
            value, MAX_WINDOW_SIZE
        )));
    }
    Ok(value as usize)
}

impl Settings {
    /// Load settings from the default location plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if parsing or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if parsing or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PM_MONITOR_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.instrument.interface_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "instrument.interface_prefix cannot be empty".to_string(),
            ));
        }
        if self.instrument.vendor_code.is_empty() {
            return Err(ConfigError::Validation(
                "instrument.vendor_code cannot be empty".to_string(),
            ));
        }
        if self.instrument.io_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "instrument.io_timeout must be greater than zero".to_string(),
            ));
        }
        if self.instrument.max_consecutive_failures == 0 {
            return Err(ConfigError::Validation(
                "instrument.max_consecutive_failures must be at least 1".to_string(),
            ));
        }

        self.acquisition
            .validate()
            .map_err(|e| ConfigError::Validation(format!("[acquisition] {}", e)))
    }
}

fn default_name() -> String {
    "USB Power Meter".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_interface_prefix() -> String {
    "USB0".to_string()
}

fn default_vendor_code() -> String {
    "MY".to_string()
}

fn default_vendor_offset() -> usize {
    22
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(3)
}

fn default_window_size() -> usize {
    10
}

fn default_frequency_ghz() -> f64 {
    5.0
}

fn default_delay_seconds() -> f64 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.acquisition.window_size, 10);
        assert_eq!(settings.acquisition.delay_seconds, 0.5);
        assert_eq!(settings.instrument.vendor_offset, 22);
        assert_eq!(settings.instrument.offset_mode, OffsetMode::PostRead);
    }

    #[test]
    #[serial]
    fn test_missing_file_yields_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.application.name, "USB Power Meter");
        assert_eq!(settings.instrument.io_timeout, Duration::from_secs(2));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"

            [instrument]
            backend = "simulated"
            io_timeout = "750ms"
            offset_mode = "instrument"

            [acquisition]
            window_size = 3
            offset_db = 2.5
            "#,
        );

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.instrument.backend, Backend::Simulated);
        assert_eq!(settings.instrument.io_timeout, Duration::from_millis(750));
        assert_eq!(settings.instrument.offset_mode, OffsetMode::Instrument);
        assert_eq!(settings.acquisition.window_size, 3);
        assert_eq!(settings.acquisition.offset_db, 2.5);
        assert_eq!(settings.acquisition.frequency_ghz, 5.0);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[acquisition]\nwindow_size = 3\n");
        std::env::set_var("PM_MONITOR_ACQUISITION__WINDOW_SIZE", "7");
        let result = Settings::load_from(file.path());
        std::env::remove_var("PM_MONITOR_ACQUISITION__WINDOW_SIZE");

        assert_eq!(result.unwrap().acquisition.window_size, 7);
    }

    #[test]
    #[serial]
    fn test_invalid_file_values_rejected() {
        let file = write_config("[acquisition]\ndelay_seconds = 0.0\n");
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("delay"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_failure_threshold_rejected() {
        let mut settings = Settings::default();
        settings.instrument.max_consecutive_failures = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_from_inputs_accepts_form_defaults() {
        let config = AcquisitionConfig::from_inputs("10", "0", "5", "0.5").unwrap();
        assert_eq!(config, AcquisitionConfig::default());
        assert_eq!(config.delay().unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_from_inputs_trims_whitespace() {
        let config = AcquisitionConfig::from_inputs(" 4 ", " -1.5", "2.4 ", " 1 ").unwrap();
        assert_eq!(config.window_size, 4);
        assert_eq!(config.offset_db, -1.5);
    }

    #[test]
    fn test_from_inputs_rejects_non_numeric() {
        let err = AcquisitionConfig::from_inputs("10", "abc", "5", "0.5").unwrap_err();
        assert_eq!(
            err,
            MonitorError::Configuration("offset must be numeric, got 'abc'".to_string())
        );

        let err = AcquisitionConfig::from_inputs("10", "0", "5", "").unwrap_err();
        assert!(err.to_string().contains("delay must be numeric"));
    }

    #[test]
    fn test_fractional_window_size_rejected() {
        let err = AcquisitionConfig::from_inputs("2.5", "0", "5", "0.5").unwrap_err();
        assert!(err.to_string().contains("whole number"));

        let config = AcquisitionConfig::from_inputs("10.0", "0", "5", "0.5").unwrap();
        assert_eq!(config.window_size, 10);
    }

    #[test]
    fn test_window_size_below_one_rejected() {
        assert!(AcquisitionConfig::from_inputs("0", "0", "5", "0.5").is_err());
        assert!(AcquisitionConfig::from_inputs("-3", "0", "5", "0.5").is_err());

        let config = AcquisitionConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MonitorError::Configuration(_))));
    }

    #[test]
    fn test_delay_must_be_positive_and_finite() {
        assert!(AcquisitionConfig::from_inputs("10", "0", "5", "0").is_err());
        assert!(AcquisitionConfig::from_inputs("10", "0", "5", "-0.5").is_err());
        assert!(AcquisitionConfig::from_inputs("10", "0", "5", "inf").is_err());
        assert!(AcquisitionConfig::from_inputs("10", "0", "5", "NaN").is_err());
        assert!(AcquisitionConfig::from_inputs("10", "0", "5", "1e30").is_err());
    }

    #[test]
    fn test_frequency_must_be_positive() {
        assert!(AcquisitionConfig::from_inputs("10", "0", "0", "0.5").is_err());
        assert!(AcquisitionConfig::from_inputs("10", "0", "-5", "0.5").is_err());
    }

    #[test]
    fn test_offset_applied_exactly_once() {
        for mode in [OffsetMode::PostRead, OffsetMode::Instrument] {
            let total = mode.instrument_gain(3.0) + mode.reading_offset(3.0);
            assert_eq!(total, 3.0, "{:?}", mode);
        }
    }

    #[test]
    fn test_filter_from_settings() {
        let filter = InstrumentSettings::default().filter();
        assert!(filter.matches("USB0::0x2A8D::0x1E01::MY12345678::0::INSTR"));
        assert!(!filter.matches("ASRL1::INSTR"));
    }
}
