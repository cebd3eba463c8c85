//! VISA backend
//!
//! Talks to real power meters through the system VISA library using the
//! `visa-rs` crate. VISA calls block, so every call runs on
//! `tokio::task::spawn_blocking` with the instrument behind a mutex.
//! Each session's VISA timeout is set to the I/O timeout, so a blocking read
//! gives up no later than the async deadline that wraps it.
//!
//! Enabled with the `instrument_visa` feature.

use crate::error::{AppResult, MonitorError};
use crate::instrument::{InstrumentIo, ResourceManager};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use visa_rs::attribute::AttrTmoValue;
use visa_rs::prelude::*;

/// Expression matching every instrument resource.
const FIND_ALL_INSTRUMENTS: &str = "?*INSTR";

/// Status names VISA reports when a device vanished.
const LOST_MARKERS: [&str; 3] = ["CONN_LOST", "RSRC_NFOUND", "INV_OBJECT"];

/// Resource manager backed by the VISA default resource manager.
pub struct VisaResourceManager {
    rm: Arc<Mutex<DefaultRM>>,
    io_timeout: Duration,
}

impl VisaResourceManager {
    /// Open the VISA default resource manager. Sessions it opens time out
    /// after `io_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Connection`] if the VISA library is unavailable.
    pub fn new(io_timeout: Duration) -> AppResult<Self> {
        let rm = DefaultRM::new().map_err(|e| {
            MonitorError::Connection(format!("Failed to create VISA resource manager: {}", e))
        })?;
        Ok(Self {
            rm: Arc::new(Mutex::new(rm)),
            io_timeout,
        })
    }
}

/// `VI_ATTR_TMO_VALUE` in milliseconds: at least 1 (0 means "fail at once"),
/// at most `u32::MAX - 1` (`u32::MAX` means "wait forever").
fn timeout_attribute_ms(io_timeout: Duration) -> u32 {
    let ms = u32::try_from(io_timeout.as_millis()).unwrap_or(u32::MAX);
    ms.clamp(1, u32::MAX - 1)
}

fn visa_string(text: &str) -> AppResult<VisaString> {
    CString::new(text)
        .map(VisaString::from)
        .map_err(|e| MonitorError::Connection(format!("Invalid VISA string '{}': {}", text, e)))
}

fn classify(context: &str, message: String) -> MonitorError {
    if LOST_MARKERS.iter().any(|marker| message.contains(marker)) {
        MonitorError::DeviceLost(format!("{}: {}", context, message))
    } else {
        MonitorError::Read(format!("{}: {}", context, message))
    }
}

fn classify_io(context: &str, e: std::io::Error) -> MonitorError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted => {
            MonitorError::DeviceLost(format!("{}: {}", context, e))
        }
        _ => classify(context, e.to_string()),
    }
}

async fn blocking<T, F>(context: &'static str, f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MonitorError::Connection(format!("{} task failed: {}", context, e)))?
}

#[async_trait]
impl ResourceManager for VisaResourceManager {
    async fn list_resources(&self) -> AppResult<Vec<String>> {
        let rm = self.rm.clone();
        let expression = visa_string(FIND_ALL_INSTRUMENTS)?;
        blocking("VISA enumeration", move || {
            let rm = rm.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut list = rm.find_res_list(&expression).map_err(|e| {
                MonitorError::Connection(format!("VISA resource enumeration failed: {}", e))
            })?;

            let mut addresses = Vec::new();
            while let Some(address) = list.find_next().map_err(|e| {
                MonitorError::Connection(format!("VISA resource enumeration failed: {}", e))
            })? {
                addresses.push(address.to_string());
            }
            Ok(addresses)
        })
        .await
    }

    async fn open(&self, address: &str) -> AppResult<Box<dyn InstrumentIo>> {
        let rm = self.rm.clone();
        let resource = visa_string(address)?;
        let owned_address = address.to_string();
        let timeout_ms = timeout_attribute_ms(self.io_timeout);
        let instrument = blocking("VISA open", move || {
            let rm = rm.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let instrument = rm
                .open(&resource, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| {
                    MonitorError::Connection(format!("Failed to open VISA resource: {}", e))
                })?;
            let attribute = AttrTmoValue::new_checked(timeout_ms).ok_or_else(|| {
                MonitorError::Connection(format!("Invalid VISA timeout {}ms", timeout_ms))
            })?;
            instrument.set_attr(attribute).map_err(|e| {
                MonitorError::Connection(format!("Failed to set VISA timeout: {}", e))
            })?;
            Ok(instrument)
        })
        .await?;

        debug!(address = %owned_address, timeout_ms, "VISA resource opened");
        Ok(Box::new(VisaHandle {
            address: owned_address,
            instrument: Arc::new(Mutex::new(Some(instrument))),
        }))
    }
}

/// One open VISA session. Dropping it closes the session.
struct VisaHandle {
    address: String,
    instrument: Arc<Mutex<Option<Instrument>>>,
}

impl VisaHandle {
    async fn exchange(&self, command: &str, expect_response: bool) -> AppResult<String> {
        let instrument = self.instrument.clone();
        let line = format!("{}\n", command);
        blocking("VISA I/O", move || {
            let mut guard = instrument.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let instr = guard
                .as_mut()
                .ok_or_else(|| MonitorError::DeviceLost("VISA session is closed".to_string()))?;

            instr
                .write_all(line.as_bytes())
                .map_err(|e| classify_io("VISA write failed", e))?;
            if !expect_response {
                return Ok(String::new());
            }

            let mut response = String::new();
            BufReader::new(&*instr)
                .read_line(&mut response)
                .map_err(|e| classify_io("VISA read failed", e))?;
            Ok(response.trim().to_string())
        })
        .await
    }
}

#[async_trait]
impl InstrumentIo for VisaHandle {
    fn address(&self) -> &str {
        &self.address
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.exchange(command, false).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.exchange(command, true).await
    }

    async fn close(&mut self) -> AppResult<()> {
        let session = self
            .instrument
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if session.is_some() {
            debug!(address = %self.address, "VISA resource closed");
        }
        Ok(())
    }
}
