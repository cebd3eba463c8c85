//! Latest-value hand-off from the acquisition worker to the presentation layer.
//!
//! The channel is a single slot built on `tokio::sync::watch`. Publishing
//! replaces whatever the consumer has not read yet, never blocks and never
//! fails. The consumer polls with [`ResultReceiver::try_next`] on its own
//! refresh cadence or awaits [`ResultReceiver::next`].
//!
//! An error is never lost to a faster publisher: until a receiver observes
//! it, every later [`Reading`] carries it in `unseen_error`.
//!
//! # Example
//!
//! ```rust,ignore
//! let (publisher, mut receiver) = result_channel();
//! publisher.publish_reading(-7.5, 1, Instant::now());
//! if let Some(Update::Reading(reading)) = receiver.try_next() {
//!     println!("{}", reading.display());
//! }
//! ```

use crate::error::{ErrorKind, MonitorError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;

/// Unit of every published value.
pub const UNIT_DBM: &str = "dBm";

/// One offset-corrected measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Power in dBm
    pub value: f64,
    /// When the measurement was taken
    pub timestamp: Instant,
}

impl Sample {
    /// Sample taken now.
    pub fn now(value: f64) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
        }
    }
}

/// A published result: the windowed mean, or a single-shot value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Mean power in dBm
    pub value: f64,
    /// Always `dBm`
    pub unit: &'static str,
    /// Samples behind the mean
    pub sample_count: usize,
    /// Strictly increasing per publisher
    pub sequence: u64,
    /// Monotonic time of the newest sample
    #[serde(skip)]
    pub timestamp: Instant,
    /// Wall-clock time of publication
    pub captured_at: DateTime<Utc>,
    /// Error published since the last observed update and not yet seen
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unseen_error: Option<ErrorStatus>,
}

impl Reading {
    /// Readout text, two decimals.
    pub fn display(&self) -> String {
        format!("{:.2} {}", self.value, self.unit)
    }
}

/// Error shown by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorStatus {
    /// Error class
    pub kind: ErrorKind,
    /// Human-readable description
    pub message: String,
    /// Whether the run ended because of it
    pub terminal: bool,
    /// Position among everything this publisher sent
    pub sequence: u64,
}

/// Contents of the result slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Update {
    /// Nothing has been published yet
    Waiting,
    /// A new reading
    Reading(Reading),
    /// The latest error; stays visible until a reading or stop replaces it
    Error(ErrorStatus),
    /// Acquisition was stopped on request
    Stopped,
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::Waiting => write!(f, "Waiting for data..."),
            Update::Reading(reading) => match &reading.unseen_error {
                Some(status) => write!(f, "{} ({})", reading.display(), status.message),
                None => write!(f, "{}", reading.display()),
            },
            Update::Error(status) => write!(f, "{}", status.message),
            Update::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Create a connected publisher/receiver pair holding [`Update::Waiting`].
pub fn result_channel() -> (ResultPublisher, ResultReceiver) {
    let (tx, rx) = watch::channel(Update::Waiting);
    let unseen_error = Arc::new(Mutex::new(None));
    let publisher = ResultPublisher {
        tx: Arc::new(tx),
        sequence: Arc::new(AtomicU64::new(0)),
        unseen_error: unseen_error.clone(),
    };
    (publisher, ResultReceiver { rx, unseen_error })
}

type UnseenError = Arc<Mutex<Option<ErrorStatus>>>;

fn lock(slot: &UnseenError) -> MutexGuard<'_, Option<ErrorStatus>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Producer side. Cheap to clone; clones share the slot and the sequence.
#[derive(Debug, Clone)]
pub struct ResultPublisher {
    tx: Arc<watch::Sender<Update>>,
    sequence: Arc<AtomicU64>,
    unseen_error: UnseenError,
}

impl ResultPublisher {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish a mean over `sample_count` samples, the newest taken at `timestamp`.
    pub fn publish_reading(&self, value: f64, sample_count: usize, timestamp: Instant) -> Reading {
        let reading = Reading {
            value,
            unit: UNIT_DBM,
            sample_count,
            sequence: self.next_sequence(),
            timestamp,
            captured_at: Utc::now(),
            unseen_error: lock(&self.unseen_error).clone(),
        };
        self.tx.send_replace(Update::Reading(reading.clone()));
        reading
    }

    /// Publish an error status. It rides along with later readings until observed.
    pub fn publish_error(&self, error: &MonitorError, terminal: bool) {
        let status = ErrorStatus {
            kind: error.kind(),
            message: error.to_string(),
            terminal,
            sequence: self.next_sequence(),
        };
        *lock(&self.unseen_error) = Some(status.clone());
        self.tx.send_replace(Update::Error(status));
    }

    /// Publish that acquisition stopped. Drops any unseen error of the run.
    pub fn publish_stopped(&self) {
        lock(&self.unseen_error).take();
        self.tx.send_replace(Update::Stopped);
    }

    /// New receiver. The current contents count as already seen.
    pub fn subscribe(&self) -> ResultReceiver {
        ResultReceiver {
            rx: self.tx.subscribe(),
            unseen_error: self.unseen_error.clone(),
        }
    }
}

/// Consumer side.
#[derive(Debug, Clone)]
pub struct ResultReceiver {
    rx: watch::Receiver<Update>,
    unseen_error: UnseenError,
}

impl ResultReceiver {
    /// Current contents, seen or not.
    pub fn latest(&self) -> Update {
        self.rx.borrow().clone()
    }

    /// Contents if they changed since the last `try_next`/`next`. Never waits.
    pub fn try_next(&mut self) -> Option<Update> {
        match self.rx.has_changed() {
            Ok(true) => Some(self.observe()),
            _ => None,
        }
    }

    /// Wait for the next update. `None` once every publisher is gone.
    pub async fn next(&mut self) -> Option<Update> {
        self.rx.changed().await.ok()?;
        Some(self.observe())
    }

    fn observe(&mut self) -> Update {
        let update = self.rx.borrow_and_update().clone();
        let seen = match &update {
            Update::Error(status) => Some(status),
            Update::Reading(reading) => reading.unseen_error.as_ref(),
            _ => None,
        };
        if let Some(seen) = seen {
            let mut pending = lock(&self.unseen_error);
            // A newer error published meanwhile stays pending.
            if pending.as_ref().is_some_and(|p| p.sequence <= seen.sequence) {
                *pending = None;
            }
        }
        update
    }
}
