//! Instrument collaborator contract.
//!
//! The acquisition pipeline never talks to a bus directly. It consumes two
//! small traits:
//!
//! - [`ResourceManager`]: enumerates instrument addresses and opens them.
//! - [`InstrumentIo`]: an open handle with `write`/`query`/`close`.
//!
//! Backends map their failures onto the library taxonomy: timeouts and
//! garbled responses are [`MonitorError::Read`], a vanished device is
//! [`MonitorError::DeviceLost`]. `close()` is idempotent, and dropping a handle
//! releases it as well.
//!
//! [`session::InstrumentSession`] builds the power meter protocol on top of
//! these traits. [`mock`] provides a simulated meter; [`visa`] (feature
//! `instrument_visa`) talks to real hardware.
//!
//! [`MonitorError::Read`]: crate::error::MonitorError::Read
//! [`MonitorError::DeviceLost`]: crate::error::MonitorError::DeviceLost

pub mod mock;
pub mod session;
#[cfg(feature = "instrument_visa")]
pub mod visa;

use crate::error::AppResult;
use async_trait::async_trait;

pub use session::InstrumentSession;

/// Enumerates and opens instrument resources.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// All instrument addresses currently visible, in enumeration order.
    async fn list_resources(&self) -> AppResult<Vec<String>>;

    /// Open the resource at `address`.
    async fn open(&self, address: &str) -> AppResult<Box<dyn InstrumentIo>>;
}

/// An open instrument handle.
#[async_trait]
pub trait InstrumentIo: Send {
    /// Address this handle was opened with.
    fn address(&self) -> &str;

    /// Send a command that produces no response.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Send a command and read its response line.
    async fn query(&mut self, command: &str) -> AppResult<String>;

    /// Release the handle. Calling it again is a no-op.
    async fn close(&mut self) -> AppResult<()>;
}

/// Decides which enumerated addresses are probed as power meters.
///
/// An address is a candidate when it starts with the interface prefix (e.g.
/// `USB0`) and carries the vendor code at a fixed offset, e.g. `MY` at byte 22
/// of `USB0::0x2A8D::0x1E01::MY12345678::0::INSTR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFilter {
    interface_prefix: String,
    vendor_code: String,
    vendor_offset: usize,
}

impl ResourceFilter {
    /// Create a filter.
    pub fn new(interface_prefix: String, vendor_code: String, vendor_offset: usize) -> Self {
        Self {
            interface_prefix,
            vendor_code,
            vendor_offset,
        }
    }

    /// Whether `address` should be probed.
    pub fn matches(&self, address: &str) -> bool {
        let Some(end) = self.vendor_offset.checked_add(self.vendor_code.len()) else {
            return false;
        };
        address.starts_with(&self.interface_prefix)
            && address.get(self.vendor_offset..end) == Some(self.vendor_code.as_str())
    }
}
