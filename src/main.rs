//! CLI entry point for the testbed controller.
//!
//! # Usage
//!
//! Run an experiment until the setpoint range is exhausted or Ctrl+C:
//! ```bash
//! testbed run --config config/testbed.toml
//! ```
//!
//! Inspect or delete a telemetry log:
//! ```bash
//! testbed tail --log data/telemetry_000.csv -n 20
//! testbed clear --log data/telemetry_000.csv
//! ```
//!
//! Check the link to the device-under-test:
//! ```bash
//! testbed probe --config config/testbed.toml
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use testbed_daq::device::DeviceClient;
use testbed_daq::protocol::CommandChannel;
use testbed_daq::scheduler::{FixedInterval, RunExit};
use testbed_daq::stats::WindowStats;
use testbed_daq::telemetry::{ClearOutcome, TelemetryLog};
use testbed_daq::{tracing_init, SerialSessionFactory, Testbed, TestbedConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "testbed")]
#[command(about = "Thermal testbed controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tick loop against the configured hardware
    Run {
        #[arg(long, default_value = "config/testbed.toml")]
        config: PathBuf,
    },

    /// Print the last records of a telemetry log
    Tail {
        #[arg(long)]
        log: PathBuf,

        #[arg(short, long, default_value = "10")]
        n: usize,

        /// Field to summarise
        #[arg(long, default_value = "0")]
        field: usize,
    },

    /// Delete a telemetry log
    Clear {
        #[arg(long)]
        log: PathBuf,
    },

    /// Query the device-under-test once and read its channels
    Probe {
        #[arg(long, default_value = "config/testbed.toml")]
        config: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Tail { log, n, field } => tail(&log, n, field),
        Commands::Clear { log } => clear(&log),
        Commands::Probe { config } => probe(&config),
    }
}

fn load_config(path: &Path) -> Result<TestbedConfig> {
    let config = TestbedConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    tracing_init::init_from_config(&config).map_err(|e| anyhow!(e))?;
    Ok(config)
}

async fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let mut testbed = Testbed::new(&config, SerialSessionFactory::new(config.clone()))
        .context("Failed to set up testbed")?;

    testbed
        .start(Instant::now())
        .context("Failed to start session")?;
    println!("Session running, logging to {}", testbed.current_log_path().display());
    println!("Press Ctrl+C to stop");

    let exit = FixedInterval::run(&mut testbed, config.control.tick_interval()).await;

    if let Some(status) = testbed.status() {
        println!(
            "Stopped at step {} (setpoint {:.3}): {} exchanges, {} failed, {} samples",
            status.step,
            status.setpoint,
            status.exchanges,
            status.exchange_failures,
            status.samples_published
        );
    }
    if testbed.is_running() {
        testbed.stop()?;
    }

    match exit {
        RunExit::Completed => println!("Experiment finished"),
        RunExit::Interrupted => println!("Interrupted"),
    }
    info!(log = %testbed.current_log_path().display(), "Shutdown complete");
    Ok(())
}

fn tail(log_path: &Path, n: usize, field: usize) -> Result<()> {
    let log = TelemetryLog::new(log_path, 4);
    let window = log
        .tail(n)
        .with_context(|| format!("Failed to read {}", log_path.display()))?;

    if window.has_more {
        println!("...");
    }
    for record in &window.records {
        let line = record.to_line(log.precision())?;
        print!("{}", String::from_utf8_lossy(&line));
    }

    match WindowStats::compute(&window.records, field) {
        Some(stats) => println!(
            "field {}: n={} mean={:.4} rms={:.4}",
            field, stats.count, stats.mean, stats.rms_deviation
        ),
        None => println!("field {}: no data", field),
    }
    Ok(())
}

fn clear(log_path: &Path) -> Result<()> {
    match TelemetryLog::new(log_path, 4).clear()? {
        ClearOutcome::Removed => println!("Removed {}", log_path.display()),
        ClearOutcome::NotFound => println!("{} does not exist", log_path.display()),
    }
    Ok(())
}

fn probe(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let channel = CommandChannel::open_serial(&config.device)
        .with_context(|| format!("Failed to open {}", config.device.port))?;
    let mut device = DeviceClient::new(channel, config.device.exchange_timeout());

    let identity = device.query_config([0; 4]).context("Configuration query failed")?;
    println!("Device configuration: {:02X?}", identity);

    let readings = device
        .read_channels(&config.device.channels)
        .context("Channel read failed")?;
    for (channel, value) in config.device.channels.iter().zip(&readings) {
        println!("  channel {}: {:.4}", channel, value);
    }
    Ok(())
}
