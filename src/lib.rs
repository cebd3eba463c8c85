//! Background acquisition and running-average readout for USB power meters.
//!
//! The library discovers a power meter, configures it, samples it on a
//! background task at a fixed cadence, averages the samples over a sliding
//! window and hands the latest result to a presentation layer through a
//! single-slot channel. The presentation layer only talks to
//! [`controller::Controller`].
//!
//! ```text
//! Controller ─ start/stop/single_read
//!     │
//!     ├─ InstrumentSession ── connect / configure / read_power / close
//!     │
//!     └─ AcquisitionLoop ── SlidingWindowAverager ── ResultPublisher
//!                                                          │
//!                                                          └──> ResultReceiver
//! ```

pub mod acquisition;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod instrument;
pub mod tracing_setup;

pub use config::{AcquisitionConfig, Settings};
pub use controller::{Controller, SessionState};
pub use data::{Reading, ResultReceiver, Update};
pub use error::{AppResult, MonitorError};
