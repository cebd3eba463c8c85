//! Console readout for the power meter monitor
//!
//! Collects the four acquisition inputs as text, starts continuous
//! acquisition (or a single read) and prints each new result on its own
//! refresh cadence. Ctrl-C stops the run and closes the meter.
//!
//! # Usage
//!
//! ```bash
//! pm_monitor --window 20 --offset 2.5 --frequency 5 --delay 0.25
//! pm_monitor --single --simulate
//! pm_monitor --simulate --json
//! pm_monitor --simulate --log-level debug --log-format compact --trace-spans
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use pm_monitor::config::{AcquisitionConfig, Backend, Settings, DEFAULT_CONFIG_PATH};
use pm_monitor::controller::{Controller, SessionState};
use pm_monitor::data::Update;
use pm_monitor::instrument::mock::{MockDevice, MockResourceManager, DEFAULT_ADDRESS};
use pm_monitor::instrument::ResourceManager;
use pm_monitor::tracing_setup::{self, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "pm_monitor")]
#[command(about = "Running-average readout for USB power meters", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Averaging window size (samples)
    #[arg(long)]
    window: Option<String>,

    /// Offset added to each reading (dB)
    #[arg(long, allow_hyphen_values = true)]
    offset: Option<String>,

    /// Measurement frequency (GHz)
    #[arg(long)]
    frequency: Option<String>,

    /// Delay between samples (s)
    #[arg(long)]
    delay: Option<String>,

    /// Take one reading and exit
    #[arg(long)]
    single: bool,

    /// Use the simulated power meter
    #[arg(long)]
    simulate: bool,

    /// Print updates as JSON lines
    #[arg(long)]
    json: bool,

    /// Log level, overriding the settings file (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format, overriding the settings file (pretty, compact, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Also log when each acquisition span opens and closes
    #[arg(long)]
    trace_spans: bool,

    /// Display refresh interval (ms)
    #[arg(long, default_value = "100")]
    refresh_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    let mut tracing_config = TracingConfig::from_settings(&settings)
        .and_then(|c| c.overridden(cli.log_level.as_deref(), cli.log_format.as_deref()))
        .map_err(|e| anyhow!(e))?;
    tracing_config.with_span_events = cli.trace_spans;
    tracing_setup::init(tracing_config);

    let defaults = &settings.acquisition;
    let window = cli.window.clone().unwrap_or_else(|| defaults.window_size.to_string());
    let offset = cli.offset.clone().unwrap_or_else(|| defaults.offset_db.to_string());
    let frequency = cli
        .frequency
        .clone()
        .unwrap_or_else(|| defaults.frequency_ghz.to_string());
    let delay = cli.delay.clone().unwrap_or_else(|| defaults.delay_seconds.to_string());
    let config = AcquisitionConfig::from_inputs(&window, &offset, &frequency, &delay)
        .context("Invalid acquisition input")?;

    let backend = if cli.simulate {
        Backend::Simulated
    } else {
        settings.instrument.backend
    };
    let controller = Controller::new(
        build_manager(backend, settings.instrument.io_timeout)?,
        settings.instrument.clone(),
    );
    let mut receiver = controller.subscribe();

    info!(name = %settings.application.name, ?backend, "Power meter monitor starting");

    if cli.single {
        let reading = controller
            .single_read(config)
            .await
            .context("Single read failed")?;
        render(&Update::Reading(reading), cli.json)?;
        return Ok(());
    }

    controller
        .start(config)
        .await
        .context("Failed to start acquisition")?;

    let mut refresh = tokio::time::interval(Duration::from_millis(cli.refresh_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received");
                break;
            }
            _ = refresh.tick() => {
                if let Some(update) = receiver.try_next() {
                    render(&update, cli.json)?;
                }
                if controller.state() == SessionState::Failed {
                    if let Some(update) = receiver.try_next() {
                        render(&update, cli.json)?;
                    }
                    controller.shutdown().await;
                    bail!("Acquisition failed: {}", receiver.latest());
                }
            }
        }
    }

    controller.shutdown().await;
    if let Some(update) = receiver.try_next() {
        render(&update, cli.json)?;
    }
    Ok(())
}

#[cfg_attr(not(feature = "instrument_visa"), allow(unused_variables))]
fn build_manager(backend: Backend, io_timeout: Duration) -> Result<Arc<dyn ResourceManager>> {
    match backend {
        Backend::Simulated => Ok(Arc::new(MockResourceManager::new().with_device(
            MockDevice::new(DEFAULT_ADDRESS)
                .with_readings(vec![-10.0, -10.2, -9.9, -10.1])
                .with_jitter(0.05),
        ))),
        #[cfg(feature = "instrument_visa")]
        Backend::Visa => Ok(Arc::new(
            pm_monitor::instrument::visa::VisaResourceManager::new(io_timeout)
                .context("VISA backend unavailable")?,
        )),
        #[cfg(not(feature = "instrument_visa"))]
        Backend::Visa => bail!(
            "VISA support not enabled. Rebuild with --features instrument_visa or pass --simulate"
        ),
    }
}

fn render(update: &Update, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(update)?);
    } else {
        println!("{}", update);
    }
    Ok(())
}
