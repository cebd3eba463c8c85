//! Acquisition controller
//!
//! The `Controller` is the only surface the presentation layer talks to. It
//! owns the session state, the cancellation handle of the active run and the
//! producer side of the result channel.
//!
//! ## State machine
//!
//! ```text
//! Idle -> Connected -> Acquiring -> { Stopped | Failed }
//! ```
//!
//! `Stopped` and `Failed` are terminal for one run; the next `start` or
//! `single_read` re-enters `Idle`. At most one acquisition (continuous or
//! single) is active at a time. A second request while one is active fails
//! with [`MonitorError::AlreadyAcquiring`] and leaves the active one alone.
//!
//! ## Resource guarantees
//!
//! Every path that opens an [`InstrumentSession`] closes it: failed
//! configuration, single reads, cancelled and failed runs. Single reads and
//! continuous runs both execute on a spawned worker, so `stop()` treats them
//! alike: it waits up to `stop_grace` for the worker to close the meter and
//! aborts it afterwards, which drops (and so releases) the handle.

use crate::acquisition::{
    self, cancellation, AcquisitionLoop, CancelHandle, CancellationSignal, RunOutcome,
};
use crate::config::{AcquisitionConfig, InstrumentSettings};
use crate::data::{result_channel, Reading, ResultPublisher, ResultReceiver};
use crate::error::{AppResult, MonitorError};
use crate::instrument::{InstrumentSession, ResourceManager};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of the current (or last) acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Nothing connected
    Idle,
    /// Meter open and being configured
    Connected,
    /// Continuous run or single read in progress
    Acquiring,
    /// Last run was stopped or completed
    Stopped,
    /// Last run ended with an error
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::Acquiring => "acquiring",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl From<&RunOutcome> for SessionState {
    fn from(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Stopped => SessionState::Stopped,
            RunOutcome::Failed(_) => SessionState::Failed,
        }
    }
}

struct ActiveRun {
    cancel: CancelHandle,
    task: JoinHandle<RunOutcome>,
}

/// Everything a worker needs from the controller.
struct Shared {
    manager: Arc<dyn ResourceManager>,
    settings: InstrumentSettings,
    publisher: ResultPublisher,
    state: watch::Sender<SessionState>,
}

/// Orchestrates connect, continuous acquisition, single reads and stop.
pub struct Controller {
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveRun>>,
}

impl Controller {
    /// Create an idle controller.
    pub fn new(manager: Arc<dyn ResourceManager>, settings: InstrumentSettings) -> Self {
        let (publisher, _receiver) = result_channel();
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                manager,
                settings,
                publisher,
                state,
            }),
            active: Mutex::new(None),
        }
    }

    /// Receiver for published readings and statuses.
    pub fn subscribe(&self) -> ResultReceiver {
        self.shared.publisher.subscribe()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Start continuous acquisition in the background.
    ///
    /// Returns once the meter is connected and configured and the worker is
    /// running.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::AlreadyAcquiring`] if an acquisition is active
    /// - [`MonitorError::Configuration`] for invalid input, before any I/O
    /// - [`MonitorError::NoDeviceFound`] / [`MonitorError::Connection`] from discovery
    pub async fn start(&self, config: AcquisitionConfig) -> AppResult<()> {
        let mut active = self.claim().await?;
        let shared = &self.shared;

        config.validate().map_err(|e| shared.reject(e))?;
        let session = shared.open_session(&config).await?;

        let (cancel, signal) = cancellation();
        let run = AcquisitionLoop::new(
            session,
            &config,
            &shared.settings,
            shared.publisher.clone(),
            signal,
        )
        .map_err(|e| shared.fail(e))?;

        shared.set_state(SessionState::Acquiring);
        let worker = shared.clone();
        let task = tokio::spawn(async move {
            let outcome = run.run().await;
            worker.state.send_replace(SessionState::from(&outcome));
            outcome
        });

        *active = Some(ActiveRun { cancel, task });
        info!(
            window = config.window_size,
            offset_db = config.offset_db,
            frequency_ghz = config.frequency_ghz,
            delay_s = config.delay_seconds,
            "Continuous acquisition started"
        );
        Ok(())
    }

    /// Connect, take one reading, publish it and close.
    ///
    /// The instrument I/O runs on a background worker that [`Controller::stop`]
    /// can cancel; the window is not involved.
    ///
    /// # Errors
    ///
    /// Same as [`Controller::start`], plus read errors and
    /// [`MonitorError::Cancelled`] when stopped first.
    pub async fn single_read(&self, config: AcquisitionConfig) -> AppResult<Reading> {
        let result = {
            let mut active = self.claim().await?;
            let shared = &self.shared;
            config.validate().map_err(|e| shared.reject(e))?;
            shared.set_state(SessionState::Idle);

            let (cancel, signal) = cancellation();
            let (result_tx, result_rx) = oneshot::channel();
            let worker = shared.clone();
            let task = tokio::spawn(async move {
                let result = worker.read_once(&config, signal).await;
                let outcome = match &result {
                    Ok(_) | Err(MonitorError::Cancelled) => RunOutcome::Stopped,
                    Err(e) => RunOutcome::Failed(e.clone()),
                };
                let _ = result_tx.send(result);
                outcome
            });
            *active = Some(ActiveRun { cancel, task });
            result_rx
        };

        result.await.unwrap_or(Err(MonitorError::Cancelled))
    }

    /// Stop the active run and wait for the meter to be closed.
    ///
    /// A no-op when nothing is running. Never fails.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(mut run) = active.take() else {
            debug!("Stop requested with no active acquisition");
            return;
        };

        if self.run_ended(&run) {
            Self::log_outcome(run.task.await);
            return;
        }

        let grace = self.shared.settings.stop_grace;
        run.cancel.cancel();
        match tokio::time::timeout(grace, &mut run.task).await {
            Ok(joined) => Self::log_outcome(joined),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Acquisition did not stop in time, aborting worker"
                );
                run.task.abort();
                let _ = run.task.await;
            }
        }

        self.shared.set_state(SessionState::Stopped);
        self.shared.publisher.publish_stopped();
        info!("Acquisition stopped");
    }

    /// Orderly stop for process exit.
    pub async fn shutdown(&self) {
        info!("Controller shutting down");
        self.stop().await;
    }

    /// Take the run slot, reaping a finished run first.
    async fn claim(&self) -> AppResult<MutexGuard<'_, Option<ActiveRun>>> {
        let mut active = self
            .active
            .try_lock()
            .map_err(|_| MonitorError::AlreadyAcquiring)?;
        self.reap_finished(&mut active).await;
        if active.is_some() {
            return Err(MonitorError::AlreadyAcquiring);
        }
        Ok(active)
    }

    /// A worker that reached a terminal state is done apart from returning.
    fn run_ended(&self, run: &ActiveRun) -> bool {
        run.task.is_finished()
            || matches!(self.state(), SessionState::Stopped | SessionState::Failed)
    }

    async fn reap_finished(&self, active: &mut Option<ActiveRun>) {
        if active.as_ref().is_some_and(|run| self.run_ended(run)) {
            if let Some(run) = active.take() {
                Self::log_outcome(run.task.await);
            }
        }
    }

    fn log_outcome(joined: Result<RunOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(RunOutcome::Stopped) => debug!("Acquisition worker finished"),
            Ok(RunOutcome::Failed(e)) => {
                debug!(error = %e, "Acquisition worker finished with error");
            }
            Err(e) => error!(error = %e, "Acquisition worker panicked or was aborted"),
        }
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn open_session(&self, config: &AcquisitionConfig) -> AppResult<InstrumentSession> {
        self.set_state(SessionState::Idle);

        let mut session = InstrumentSession::connect(
            self.manager.as_ref(),
            &self.settings.filter(),
            self.settings.io_timeout,
        )
        .await
        .map_err(|e| self.fail(e))?;
        self.set_state(SessionState::Connected);

        let prepared = match session
            .configure(config.offset_db, config.frequency_ghz, self.settings.offset_mode)
            .await
        {
            Ok(()) => session.start_measurement().await,
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            session.close().await;
            return Err(self.fail(e));
        }
        Ok(session)
    }

    /// Body of the single-read worker. Closes the meter before returning.
    async fn read_once(
        &self,
        config: &AcquisitionConfig,
        mut cancel: CancellationSignal,
    ) -> AppResult<Reading> {
        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MonitorError::Cancelled),
            opened = self.open_session(config) => opened?,
        };

        self.set_state(SessionState::Acquiring);
        let offset = self.settings.offset_mode.reading_offset(config.offset_db);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MonitorError::Cancelled),
            read = acquisition::single_read(&mut session, offset, &self.publisher) => read,
        };
        session.close().await;

        match result {
            Ok(reading) => {
                self.set_state(SessionState::Stopped);
                Ok(reading)
            }
            Err(MonitorError::Cancelled) => {
                debug!("Single read cancelled");
                Err(MonitorError::Cancelled)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    /// Publish an error that rejected a request before any I/O.
    fn reject(&self, e: MonitorError) -> MonitorError {
        warn!(error = %e, "Acquisition request rejected");
        self.publisher.publish_error(&e, true);
        e
    }

    /// Publish an error that ended the requested operation.
    fn fail(&self, e: MonitorError) -> MonitorError {
        error!(error = %e, "Acquisition failed");
        self.set_state(SessionState::Failed);
        self.publisher.publish_error(&e, true);
        e
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // Dropping the cancel handle stops the worker; it closes the meter on its own.
        if let Ok(active) = self.active.try_lock() {
            if active.is_some() {
                debug!("Controller dropped with an active acquisition");
            }
        }
    }
}
