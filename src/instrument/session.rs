//! Power meter session
//!
//! `InstrumentSession` owns one open handle to a USB power meter and speaks
//! its SCPI dialect:
//!
//! | Step      | Command                                   |
//! |-----------|-------------------------------------------|
//! | probe     | `*IDN?`                                   |
//! | configure | `CALC:GAIN <dB>`, `SENS:FREQ <f> GHZ`, `TRIG:LEV:AUTO 1`, `TRIG:DEL:AUTO 1` |
//! | start     | `INIT1:CONT 1`                            |
//! | read      | `FETC1:POW:AC?`                           |
//!
//! Discovery keeps the handle that answered the identification query, so the
//! meter is opened exactly once per session. Every write and query is bounded
//! by the configured I/O timeout; an elapsed timeout is a
//! [`MonitorError::Read`].

use crate::config::OffsetMode;
use crate::error::{AppResult, MonitorError};
use crate::instrument::{InstrumentIo, ResourceFilter, ResourceManager};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// SCPI commands understood by the meter.
pub mod commands {
    /// Identification query.
    pub const IDENTIFY: &str = "*IDN?";
    /// Prefix of the gain (offset) write.
    pub const GAIN_PREFIX: &str = "CALC:GAIN ";
    /// Automatic trigger level.
    pub const TRIGGER_LEVEL_AUTO: &str = "TRIG:LEV:AUTO 1";
    /// Automatic trigger delay.
    pub const TRIGGER_DELAY_AUTO: &str = "TRIG:DEL:AUTO 1";
    /// Continuous measurement on channel 1.
    pub const CONTINUOUS: &str = "INIT1:CONT 1";
    /// Fetch the latest AC power measurement on channel 1.
    pub const MEASURE_POWER: &str = "FETC1:POW:AC?";

    /// Gain write for `gain_db`.
    pub fn gain(gain_db: f64) -> String {
        format!("{}{}", GAIN_PREFIX, gain_db)
    }

    /// Frequency write for `frequency_ghz`.
    pub fn frequency(frequency_ghz: f64) -> String {
        format!("SENS:FREQ {} GHZ", frequency_ghz)
    }
}

/// Value SCPI instruments return for "not a number".
const NAN_SENTINEL: f64 = 9.91e37;

/// An open connection to one power meter.
pub struct InstrumentSession {
    handle: Option<Box<dyn InstrumentIo>>,
    address: String,
    identity: String,
    io_timeout: Duration,
}

impl std::fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("address", &self.address)
            .field("identity", &self.identity)
            .field("open", &self.is_open())
            .finish()
    }
}

impl InstrumentSession {
    /// Discover and open the first power meter that answers `*IDN?`.
    ///
    /// Addresses are probed in enumeration order. Candidates that fail to
    /// open or identify are closed and skipped.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::Connection`] if enumeration fails
    /// - [`MonitorError::NoDeviceFound`] if no candidate answered
    pub async fn connect(
        manager: &dyn ResourceManager,
        filter: &ResourceFilter,
        io_timeout: Duration,
    ) -> AppResult<Self> {
        let addresses = manager.list_resources().await.map_err(|e| match e {
            MonitorError::Connection(_) => e,
            other => MonitorError::Connection(other.to_string()),
        })?;
        debug!(count = addresses.len(), "Enumerated instrument resources");

        let mut probed = 0;
        for address in addresses.iter().filter(|a| filter.matches(a)) {
            probed += 1;
            match Self::probe(manager, address, io_timeout).await {
                Ok(session) => {
                    info!(
                        address = %session.address,
                        identity = %session.identity,
                        "Connected to power meter"
                    );
                    return Ok(session);
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Candidate did not identify, skipping");
                }
            }
        }

        Err(MonitorError::NoDeviceFound { probed })
    }

    async fn probe(
        manager: &dyn ResourceManager,
        address: &str,
        io_timeout: Duration,
    ) -> AppResult<Self> {
        let mut handle = bounded(io_timeout, "open", manager.open(address)).await?;

        let response =
            bounded(io_timeout, commands::IDENTIFY, handle.query(commands::IDENTIFY)).await;
        let identity = match response {
            Ok(response) if !response.trim().is_empty() => response.trim().to_string(),
            Ok(_) => {
                close_quietly(handle.as_mut(), io_timeout).await;
                return Err(MonitorError::Read("empty identification response".to_string()));
            }
            Err(e) => {
                close_quietly(handle.as_mut(), io_timeout).await;
                return Err(e);
            }
        };

        Ok(Self {
            handle: Some(handle),
            address: address.to_string(),
            identity,
            io_timeout,
        })
    }

    /// Apply gain, frequency and automatic triggering.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Configuration`] naming the rejected command.
    pub async fn configure(
        &mut self,
        offset_db: f64,
        frequency_ghz: f64,
        mode: OffsetMode,
    ) -> AppResult<()> {
        let setup = [
            commands::gain(mode.instrument_gain(offset_db)),
            commands::frequency(frequency_ghz),
            commands::TRIGGER_LEVEL_AUTO.to_string(),
            commands::TRIGGER_DELAY_AUTO.to_string(),
        ];
        for command in &setup {
            self.write(command).await.map_err(|e| {
                MonitorError::Configuration(format!("'{}' failed: {}", command, e))
            })?;
        }
        debug!(address = %self.address, offset_db, frequency_ghz, ?mode, "Power meter configured");
        Ok(())
    }

    /// Put the meter into continuous measurement.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Configuration`] if the write fails.
    pub async fn start_measurement(&mut self) -> AppResult<()> {
        self.write(commands::CONTINUOUS).await.map_err(|e| {
            MonitorError::Configuration(format!("'{}' failed: {}", commands::CONTINUOUS, e))
        })
    }

    /// Fetch one raw power reading in dBm.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::Read`] on timeout or an unusable response
    /// - [`MonitorError::DeviceLost`] if the meter is gone or the session is closed
    pub async fn read_power(&mut self) -> AppResult<f64> {
        let response = self.query(commands::MEASURE_POWER).await?;
        parse_power_response(&response)
    }

    /// Release the handle. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            close_quietly(handle.as_mut(), self.io_timeout).await;
            info!(address = %self.address, "Power meter session closed");
        }
    }

    /// Whether the handle is still held.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Address of the connected meter.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Response to `*IDN?`.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        let io_timeout = self.io_timeout;
        let handle = self.handle_mut()?;
        bounded(io_timeout, command, handle.write(command)).await
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        let io_timeout = self.io_timeout;
        let handle = self.handle_mut()?;
        bounded(io_timeout, command, handle.query(command)).await
    }

    fn handle_mut(&mut self) -> AppResult<&mut Box<dyn InstrumentIo>> {
        self.handle
            .as_mut()
            .ok_or_else(|| MonitorError::DeviceLost("session is closed".to_string()))
    }
}

impl Drop for InstrumentSession {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!(address = %self.address, "Session dropped while open, releasing handle");
        }
    }
}

/// Parse a `FETC1:POW:AC?` response.
///
/// Accepts plain and scientific notation. Error markers, empty responses and
/// the SCPI not-a-number sentinel are read errors.
///
/// # Errors
///
/// Returns [`MonitorError::Read`] describing the rejected response.
pub fn parse_power_response(response: &str) -> AppResult<f64> {
    let trimmed = response.trim();

    if trimmed.is_empty() {
        return Err(MonitorError::Read("empty power response".to_string()));
    }
    if trimmed.contains("ERR") || trimmed.contains("OVER") || trimmed.contains("UNDER") {
        return Err(MonitorError::Read(format!("meter error response: {}", trimmed)));
    }

    let value = trimmed.parse::<f64>().map_err(|_| {
        MonitorError::Read(format!("failed to parse power response: '{}'", trimmed))
    })?;

    if !value.is_finite() || value.abs() >= NAN_SENTINEL {
        return Err(MonitorError::Read(format!(
            "meter returned no valid measurement: {}",
            trimmed
        )));
    }
    Ok(value)
}

async fn bounded<T>(
    io_timeout: Duration,
    operation: &str,
    fut: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    tokio::time::timeout(io_timeout, fut)
        .await
        .unwrap_or_else(|_| {
            Err(MonitorError::Read(format!(
                "'{}' timed out after {:?}",
                operation, io_timeout
            )))
        })
}

async fn close_quietly(handle: &mut dyn InstrumentIo, io_timeout: Duration) {
    let address = handle.address().to_string();
    if let Err(e) = bounded(io_timeout, "close", handle.close()).await {
        warn!(address = %address, error = %e, "Failed to close instrument handle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{MockDevice, MockResourceManager, DEFAULT_ADDRESS};

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn filter() -> ResourceFilter {
        ResourceFilter::new("USB0".to_string(), "MY".to_string(), 22)
    }

    #[test]
    fn test_parse_power_response() {
        assert_eq!(parse_power_response("-10.25\n").unwrap(), -10.25);
        assert_eq!(parse_power_response("+1.234000E-3").unwrap(), 0.001234);
        assert_eq!(parse_power_response("  -3.5E+01 ").unwrap(), -35.0);
    }

    #[test]
    fn test_parse_rejects_bad_responses() {
        let responses = [
            "", "   ", "ERR -113", "OVER", "UNDER", "abc", "9.91E37", "-9.91E+37", "NaN",
        ];
        for response in responses {
            let err = parse_power_response(response).unwrap_err();
            assert!(matches!(err, MonitorError::Read(_)), "{:?} -> {:?}", response, err);
        }
    }

    #[tokio::test]
    async fn test_connect_picks_first_identifying_candidate() {
        let second = "USB0::0x2A8D::0x1E01::MY00000002::0::INSTR";
        let manager = MockResourceManager::new()
            .with_device(MockDevice::new("ASRL1::INSTR"))
            .with_device(MockDevice::new(DEFAULT_ADDRESS).silent())
            .with_device(MockDevice::new(second));

        let session = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(session.address(), second);
        assert!(session.identity().contains("U2002A"));
        assert_eq!(manager.opens("ASRL1::INSTR"), 0);
        assert_eq!(manager.opens(second), 1);
        assert_eq!(manager.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_candidates() {
        let manager = MockResourceManager::new().with_device(MockDevice::new("GPIB0::13::INSTR"));
        let err = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, MonitorError::NoDeviceFound { probed: 0 });
    }

    #[tokio::test]
    async fn test_connect_when_no_candidate_answers() {
        let manager = MockResourceManager::new()
            .with_device(MockDevice::new(DEFAULT_ADDRESS).silent())
            .with_device(
                MockDevice::new("USB0::0x2A8D::0x1E01::MY00000002::0::INSTR").failing_open(),
            );
        let err = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, MonitorError::NoDeviceFound { probed: 2 });
        assert_eq!(manager.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_connect_enumeration_failure() {
        let manager = MockResourceManager::new().with_listing_error("no VISA runtime");
        let err = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Connection(_)));
    }

    #[tokio::test]
    async fn test_configure_sends_setup_commands() {
        let manager = MockResourceManager::single_meter();
        let mut session = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap();

        session.configure(2.5, 5.0, OffsetMode::PostRead).await.unwrap();
        session.start_measurement().await.unwrap();

        let sent = manager.commands(DEFAULT_ADDRESS);
        assert_eq!(
            sent,
            vec![
                "*IDN?",
                "CALC:GAIN 0",
                "SENS:FREQ 5 GHZ",
                "TRIG:LEV:AUTO 1",
                "TRIG:DEL:AUTO 1",
                "INIT1:CONT 1",
            ]
        );
    }

    #[tokio::test]
    async fn test_configure_in_instrument_mode_writes_gain() {
        let manager = MockResourceManager::single_meter();
        let mut session = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap();

        session.configure(2.5, 2.4, OffsetMode::Instrument).await.unwrap();
        assert_eq!(manager.commands(DEFAULT_ADDRESS)[1], "CALC:GAIN 2.5");
        assert_eq!(session.read_power().await.unwrap(), -7.5);
    }

    #[tokio::test]
    async fn test_configure_rejection_is_configuration_error() {
        let manager = MockResourceManager::new()
            .with_device(MockDevice::new(DEFAULT_ADDRESS).rejecting_writes("SENS:FREQ"));
        let mut session = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap();

        let err = session
            .configure(0.0, 5.0, OffsetMode::PostRead)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Configuration(ref m) if m.contains("SENS:FREQ")));
    }

    #[tokio::test]
    async fn test_read_timeout_is_read_error() {
        let manager = MockResourceManager::new()
            .with_device(MockDevice::new(DEFAULT_ADDRESS).with_latency(Duration::from_millis(50)));
        let mut session = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap();
        session.io_timeout = Duration::from_millis(5);

        let err = session.read_power().await.unwrap_err();
        assert!(matches!(err, MonitorError::Read(ref m) if m.contains("timed out")));
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_probe_timeout_skips_candidate() {
        let manager = MockResourceManager::new()
            .with_device(MockDevice::new(DEFAULT_ADDRESS).with_latency(Duration::from_millis(100)));
        let err = InstrumentSession::connect(&manager, &filter(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, MonitorError::NoDeviceFound { probed: 1 });
        assert_eq!(manager.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = MockResourceManager::single_meter();
        let mut session = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap();

        session.close().await;
        session.close().await;
        assert!(!session.is_open());
        assert_eq!(manager.open_handles(), 0);

        let err = session.read_power().await.unwrap_err();
        assert!(matches!(err, MonitorError::DeviceLost(_)));
    }

    #[tokio::test]
    async fn test_drop_releases_handle() {
        let manager = MockResourceManager::single_meter();
        let session = InstrumentSession::connect(&manager, &filter(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(manager.open_handles(), 1);
        drop(session);
        assert_eq!(manager.open_handles(), 0);
    }
}
