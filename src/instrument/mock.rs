//! Simulated power meter
//!
//! Provides an in-process [`ResourceManager`] with scripted power meters so the
//! whole pipeline can run without hardware. All simulated delays use
//! `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! Each [`MockDevice`] can be scripted with:
//! - readings (cycled) and optional uniform jitter
//! - response latency, overall or for measurements only
//! - a number of leading transient read failures
//! - a device-loss point after N successful reads
//! - a command prefix whose writes are rejected
//!
//! The manager records every command per address and counts open handles so
//! tests can assert that nothing is leaked.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = MockResourceManager::new()
//!     .with_device(MockDevice::new(DEFAULT_ADDRESS).with_readings(vec![-10.0]));
//! let session = InstrumentSession::connect(&manager, &filter, timeout).await?;
//! assert_eq!(manager.open_handles(), 1);
//! ```

use crate::error::{AppResult, MonitorError};
use crate::instrument::session::commands;
use crate::instrument::{InstrumentIo, ResourceManager};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Address of the default simulated meter. Matches the default resource filter.
pub const DEFAULT_ADDRESS: &str = "USB0::0x2A8D::0x1E01::MY12345678::0::INSTR";

/// Identification string answered by default.
pub const DEFAULT_IDENTITY: &str = "Keysight Technologies,U2002A,MY12345678,A1.02.03";

/// Behaviour of one simulated instrument.
#[derive(Debug, Clone)]
pub struct MockDevice {
    address: String,
    identity: Option<String>,
    readings: Vec<f64>,
    jitter_db: f64,
    latency: Duration,
    measure_latency: Duration,
    transient_failures: usize,
    lost_after: Option<usize>,
    rejected_prefix: Option<String>,
    open_fails: bool,
}

impl MockDevice {
    /// A well-behaved meter at `address` that always reads -10 dBm.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            identity: Some(DEFAULT_IDENTITY.to_string()),
            readings: vec![-10.0],
            jitter_db: 0.0,
            latency: Duration::ZERO,
            measure_latency: Duration::ZERO,
            transient_failures: 0,
            lost_after: None,
            rejected_prefix: None,
            open_fails: false,
        }
    }

    /// Raw readings returned in order, cycling when exhausted.
    pub fn with_readings(mut self, readings: Vec<f64>) -> Self {
        if !readings.is_empty() {
            self.readings = readings;
        }
        self
    }

    /// Add uniform noise of +/- `jitter_db` to every reading.
    pub fn with_jitter(mut self, jitter_db: f64) -> Self {
        self.jitter_db = jitter_db.abs();
        self
    }

    /// Delay every write and query by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay only measurement queries by `latency`.
    pub fn with_measure_latency(mut self, latency: Duration) -> Self {
        self.measure_latency = latency;
        self
    }

    /// Do not answer `*IDN?`.
    pub fn silent(mut self) -> Self {
        self.identity = None;
        self
    }

    /// The first `count` measurement queries fail with a read error.
    pub fn with_transient_failures(mut self, count: usize) -> Self {
        self.transient_failures = count;
        self
    }

    /// After `reads` successful measurements the device disappears.
    pub fn lost_after(mut self, reads: usize) -> Self {
        self.lost_after = Some(reads);
        self
    }

    /// Writes starting with `prefix` are rejected.
    pub fn rejecting_writes(mut self, prefix: &str) -> Self {
        self.rejected_prefix = Some(prefix.to_string());
        self
    }

    /// Opening the resource fails.
    pub fn failing_open(mut self) -> Self {
        self.open_fails = true;
        self
    }
}

/// Per-address record of what happened on the bus.
#[derive(Debug, Default, Clone)]
struct DeviceLog {
    commands: Vec<String>,
    opens: usize,
    open_handles: usize,
    measurements: usize,
    gain_db: f64,
}

type SharedLog = Arc<Mutex<HashMap<String, DeviceLog>>>;

fn lock(log: &SharedLog) -> MutexGuard<'_, HashMap<String, DeviceLog>> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated resource manager.
#[derive(Debug, Default)]
pub struct MockResourceManager {
    devices: Vec<MockDevice>,
    listing_error: Option<String>,
    log: SharedLog,
}

impl MockResourceManager {
    /// A manager with no devices attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager with one well-behaved meter at [`DEFAULT_ADDRESS`].
    pub fn single_meter() -> Self {
        Self::new().with_device(MockDevice::new(DEFAULT_ADDRESS))
    }

    /// Attach a device. Enumeration order is attachment order.
    pub fn with_device(mut self, device: MockDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Make `list_resources` fail.
    pub fn with_listing_error(mut self, message: &str) -> Self {
        self.listing_error = Some(message.to_string());
        self
    }

    /// Number of handles currently open across all devices.
    pub fn open_handles(&self) -> usize {
        lock(&self.log).values().map(|l| l.open_handles).sum()
    }

    /// Number of times `address` was opened.
    pub fn opens(&self, address: &str) -> usize {
        lock(&self.log).get(address).map_or(0, |l| l.opens)
    }

    /// Commands sent to `address`, in order.
    pub fn commands(&self, address: &str) -> Vec<String> {
        lock(&self.log)
            .get(address)
            .map(|l| l.commands.clone())
            .unwrap_or_default()
    }

    /// Number of measurement queries answered (or failed) by `address`.
    pub fn measurements(&self, address: &str) -> usize {
        lock(&self.log).get(address).map_or(0, |l| l.measurements)
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    async fn list_resources(&self) -> AppResult<Vec<String>> {
        if let Some(message) = &self.listing_error {
            return Err(MonitorError::Connection(message.clone()));
        }
        Ok(self.devices.iter().map(|d| d.address.clone()).collect())
    }

    async fn open(&self, address: &str) -> AppResult<Box<dyn InstrumentIo>> {
        let device = self
            .devices
            .iter()
            .find(|d| d.address == address)
            .ok_or_else(|| MonitorError::Connection(format!("resource '{}' not found", address)))?;

        if device.open_fails {
            return Err(MonitorError::Connection(format!(
                "resource '{}' is locked by another session",
                address
            )));
        }

        {
            let mut log = lock(&self.log);
            let entry = log.entry(address.to_string()).or_default();
            entry.opens += 1;
            entry.open_handles += 1;
        }
        debug!(address, "Simulated resource opened");

        Ok(Box::new(MockHandle {
            device: device.clone(),
            log: self.log.clone(),
            open: true,
        }))
    }
}

/// Open handle to a simulated device.
struct MockHandle {
    device: MockDevice,
    log: SharedLog,
    open: bool,
}

impl MockHandle {
    fn ensure_open(&self) -> AppResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(MonitorError::DeviceLost(format!(
                "handle to '{}' is closed",
                self.device.address
            )))
        }
    }

    fn record(&self, command: &str) -> usize {
        let mut log = lock(&self.log);
        let entry = log.entry(self.device.address.clone()).or_default();
        entry.commands.push(command.to_string());
        entry.commands.len()
    }

    fn measure(&self) -> AppResult<f64> {
        let (index, gain_db) = {
            let mut log = lock(&self.log);
            let entry = log.entry(self.device.address.clone()).or_default();
            let index = entry.measurements;
            entry.measurements += 1;
            (index, entry.gain_db)
        };

        if index < self.device.transient_failures {
            return Err(MonitorError::Read("simulated measurement timeout".to_string()));
        }
        let successes = index - self.device.transient_failures;
        if self.device.lost_after.is_some_and(|limit| successes >= limit) {
            return Err(MonitorError::DeviceLost(format!(
                "'{}' was removed from the bus",
                self.device.address
            )));
        }

        let base = self.device.readings[successes % self.device.readings.len()];
        let noise = if self.device.jitter_db > 0.0 {
            rand::thread_rng().gen_range(-self.device.jitter_db..=self.device.jitter_db)
        } else {
            0.0
        };
        Ok(base + gain_db + noise)
    }
}

#[async_trait]
impl InstrumentIo for MockHandle {
    fn address(&self) -> &str {
        &self.device.address
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.ensure_open()?;
        if !self.device.latency.is_zero() {
            tokio::time::sleep(self.device.latency).await;
        }
        self.record(command);

        if let Some(prefix) = &self.device.rejected_prefix {
            if command.starts_with(prefix.as_str()) {
                return Err(MonitorError::Read(format!(
                    "instrument rejected '{}' (-113, Undefined header)",
                    command
                )));
            }
        }

        if let Some(gain) = command
            .strip_prefix(commands::GAIN_PREFIX)
            .and_then(|v| v.trim().parse::<f64>().ok())
        {
            let mut log = lock(&self.log);
            log.entry(self.device.address.clone()).or_default().gain_db = gain;
        }
        Ok(())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.ensure_open()?;
        if !self.device.latency.is_zero() {
            tokio::time::sleep(self.device.latency).await;
        }
        self.record(command);

        match command {
            commands::IDENTIFY => self
                .device
                .identity
                .clone()
                .ok_or_else(|| {
                    MonitorError::Read("no response to identification query".to_string())
                }),
            commands::MEASURE_POWER => {
                if !self.device.measure_latency.is_zero() {
                    tokio::time::sleep(self.device.measure_latency).await;
                }
                self.measure().map(|value| format!("{:+.6E}\n", value))
            }
            _ => Ok("0\n".to_string()),
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.open {
            self.open = false;
            let mut log = lock(&self.log);
            if let Some(entry) = log.get_mut(&self.device.address) {
                entry.open_handles = entry.open_handles.saturating_sub(1);
            }
            debug!(address = %self.device.address, "Simulated resource closed");
        }
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        if self.open {
            let mut log = lock(&self.log);
            if let Some(entry) = log.get_mut(&self.device.address) {
                entry.open_handles = entry.open_handles.saturating_sub(1);
            }
        }
    }
}
