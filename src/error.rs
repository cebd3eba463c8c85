//! Custom error types for the power meter monitor.
//!
//! This module defines `MonitorError`, the single error type of the library.
//! Each variant corresponds to one failure class of the acquisition pipeline:
//!
//! - **`NoDeviceFound`**: no enumerated address matched the resource filter, or
//!   none of the candidates answered the identification query.
//! - **`Connection`**: the resource manager itself failed (e.g. the VISA library
//!   could not enumerate resources).
//! - **`Configuration`**: invalid user input (non-numeric text, delay <= 0,
//!   window size < 1) or a settings write rejected by the instrument.
//! - **`Read`**: a transient measurement failure (timeout, garbled response).
//!   The acquisition loop reports it and keeps going.
//! - **`DeviceLost`**: the instrument disappeared. Terminal for the run.
//! - **`AlreadyAcquiring`**: a second acquisition was requested while one is active.
//! - **`EmptyWindow`**: an average was requested before any sample was pushed.
//! - **`Cancelled`**: a single read was stopped before it produced a value.
//!
//! `ErrorKind` is the serialisable tag the presentation layer renders next to
//! the message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, MonitorError>;

/// Error type for every fallible operation of the acquisition pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    /// No power meter matched the filter or answered `*IDN?`.
    #[error("No power meter detected ({probed} candidate address(es) probed)")]
    NoDeviceFound {
        /// Number of candidate addresses that were probed.
        probed: usize,
    },

    /// The resource manager could not be used.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid acquisition configuration or a rejected settings write.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transient measurement failure.
    #[error("Read error: {0}")]
    Read(String),

    /// The instrument is gone; the run cannot continue.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Another acquisition (continuous or single) is active.
    #[error("An acquisition is already running")]
    AlreadyAcquiring,

    /// Average requested from an empty window.
    #[error("Average requested from an empty window")]
    EmptyWindow,

    /// The operation was stopped on request.
    #[error("Acquisition cancelled")]
    Cancelled,
}

/// Serialisable classification of a [`MonitorError`], used by the presentation contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`MonitorError::NoDeviceFound`].
    NoDeviceFound,
    /// See [`MonitorError::Connection`].
    ConnectionError,
    /// See [`MonitorError::Configuration`].
    ConfigurationError,
    /// See [`MonitorError::Read`].
    ReadError,
    /// See [`MonitorError::DeviceLost`].
    DeviceLost,
    /// See [`MonitorError::AlreadyAcquiring`].
    AlreadyAcquiring,
    /// See [`MonitorError::EmptyWindow`].
    EmptyWindow,
    /// See [`MonitorError::Cancelled`].
    Cancelled,
}

impl MonitorError {
    /// Classification tag for display.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MonitorError::NoDeviceFound { .. } => ErrorKind::NoDeviceFound,
            MonitorError::Connection(_) => ErrorKind::ConnectionError,
            MonitorError::Configuration(_) => ErrorKind::ConfigurationError,
            MonitorError::Read(_) => ErrorKind::ReadError,
            MonitorError::DeviceLost(_) => ErrorKind::DeviceLost,
            MonitorError::AlreadyAcquiring => ErrorKind::AlreadyAcquiring,
            MonitorError::EmptyWindow => ErrorKind::EmptyWindow,
            MonitorError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the acquisition loop may keep running after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, MonitorError::Read(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MonitorError::Read("timed out after 2s".to_string());
        assert_eq!(err.to_string(), "Read error: timed out after 2s");

        let err = MonitorError::NoDeviceFound { probed: 0 };
        assert!(err.to_string().contains("No power meter detected"));
    }

    #[test]
    fn test_only_read_errors_are_transient() {
        assert!(MonitorError::Read("hiccup".into()).is_transient());
        assert!(!MonitorError::DeviceLost("unplugged".into()).is_transient());
        assert!(!MonitorError::AlreadyAcquiring.is_transient());
        assert!(!MonitorError::EmptyWindow.is_transient());
        assert!(!MonitorError::Cancelled.is_transient());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let kind = MonitorError::Configuration("delay".into()).kind();
        assert_eq!(kind, ErrorKind::ConfigurationError);
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"configuration_error\"");
    }
}
