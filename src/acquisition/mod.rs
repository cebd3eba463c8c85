//! Background acquisition.
//!
//! [`AcquisitionLoop`] owns an open [`InstrumentSession`] for the duration of
//! one continuous run. Each iteration:
//!
//! 1. checks the cancellation signal
//! 2. waits until `delay` has elapsed since the previous sample, racing the
//!    cancellation signal so a stop during the wait is seen immediately
//! 3. reads the meter and adds the post-read offset
//! 4. pushes into the sliding window and publishes the mean
//!
//! Read errors are published as non-terminal statuses and the loop keeps
//! going; `max_consecutive_failures` of them in a row, or any other error,
//! end the run. The session is closed on every exit path.
//!
//! [`single_read`] is the window-less single-shot variant.

pub mod cancel;

pub use cancel::{cancellation, CancelHandle, CancellationSignal};

use crate::config::{AcquisitionConfig, InstrumentSettings};
use crate::data::{Reading, ResultPublisher, Sample, SlidingWindowAverager};
use crate::error::{AppResult, MonitorError};
use crate::instrument::InstrumentSession;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// How a continuous run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Cancelled on request.
    Stopped,
    /// Ended by an error.
    Failed(MonitorError),
}

/// One continuous acquisition run.
#[derive(Debug)]
pub struct AcquisitionLoop {
    session: InstrumentSession,
    window: SlidingWindowAverager,
    reading_offset: f64,
    delay: Duration,
    max_consecutive_failures: u32,
    publisher: ResultPublisher,
    cancel: CancellationSignal,
}

impl AcquisitionLoop {
    /// Prepare a run over an already configured session.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Configuration`] if `config` is invalid.
    pub fn new(
        session: InstrumentSession,
        config: &AcquisitionConfig,
        settings: &InstrumentSettings,
        publisher: ResultPublisher,
        cancel: CancellationSignal,
    ) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            session,
            window: SlidingWindowAverager::new(config.window_size)?,
            reading_offset: settings.offset_mode.reading_offset(config.offset_db),
            delay: config.delay()?,
            max_consecutive_failures: settings.max_consecutive_failures.max(1),
            publisher,
            cancel,
        })
    }

    /// Run until cancelled or failed. Always closes the session.
    pub async fn run(mut self) -> RunOutcome {
        let span = info_span!("acquisition", address = %self.session.address());
        async move {
            info!(
                window = self.window.capacity(),
                delay_ms = self.delay.as_millis() as u64,
                "Acquisition started"
            );

            let outcome = self.sample_until_done().await;
            self.session.close().await;

            match &outcome {
                RunOutcome::Stopped => info!("Acquisition stopped"),
                RunOutcome::Failed(e) => {
                    warn!(error = %e, "Acquisition failed");
                    self.publisher.publish_error(e, true);
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn sample_until_done(&mut self) -> RunOutcome {
        let mut last_sample: Option<Instant> = None;
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return RunOutcome::Stopped;
            }

            if let Some(last) = last_sample {
                let deadline = tokio::time::Instant::from_std(last + self.delay);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return RunOutcome::Stopped,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }

            let started = Instant::now();
            last_sample = Some(started);

            match self.session.read_power().await {
                Ok(raw) => {
                    consecutive_failures = 0;
                    let sample = Sample {
                        value: raw + self.reading_offset,
                        timestamp: started,
                    };
                    if let Err(e) = self.publish_sample(sample) {
                        return RunOutcome::Failed(e);
                    }
                }
                Err(e) if e.is_transient() => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.max_consecutive_failures {
                        return RunOutcome::Failed(MonitorError::DeviceLost(format!(
                            "{} consecutive read failures, last: {}",
                            consecutive_failures, e
                        )));
                    }
                    warn!(error = %e, consecutive_failures, "Transient read failure");
                    self.publisher.publish_error(&e, false);
                }
                Err(e) => return RunOutcome::Failed(e),
            }
        }
    }

    fn publish_sample(&mut self, sample: Sample) -> AppResult<Reading> {
        self.window.push(sample.value);
        let mean = self.window.average()?;
        let reading = self
            .publisher
            .publish_reading(mean, self.window.len(), sample.timestamp);
        debug!(
            value_dbm = sample.value,
            mean_dbm = mean,
            samples = reading.sample_count,
            "Published reading"
        );
        Ok(reading)
    }
}

/// Take one offset-corrected reading and publish it without windowing.
///
/// The session must already be configured and measuring.
///
/// # Errors
///
/// Propagates the read error; nothing is published in that case.
pub async fn single_read(
    session: &mut InstrumentSession,
    reading_offset: f64,
    publisher: &ResultPublisher,
) -> AppResult<Reading> {
    let started = Instant::now();
    let raw = session.read_power().await?;
    let reading = publisher.publish_reading(raw + reading_offset, 1, started);
    info!(address = %session.address(), value_dbm = reading.value, "Single reading");
    Ok(reading)
}
