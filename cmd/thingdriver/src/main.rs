//! thingdriver - runs sample device drivers against an in-memory gateway.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use thingaccess::conn_pipe::PipeGateway;
use thingaccess::{Supervisor, ThingDriver};
use tracing_subscriber::EnvFilter;

mod config;
mod console;
mod drivers;

use config::DriverConfig;
use drivers::{HelloThing, LightSensor};

/// thingdriver - runs sample device drivers against an in-memory gateway.
///
/// Devices come from the FC_DRIVER_CONFIG environment variable (JSON with a
/// `deviceList` array) or from --config (JSON or YAML). Each device is
/// registered, brought online and reports periodically until Ctrl-C.
#[derive(Parser)]
#[command(name = "thingdriver")]
#[command(about = "Sample thing access drivers")]
#[command(version)]
pub struct Cli {
    /// Config file (JSON or YAML); overrides FC_DRIVER_CONFIG
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Thermometer at 41 degrees raising high_temperature events
    HelloThing(RunArgs),
    /// Read-only light sensor sweeping MeasuredIlluminance
    LightSensor(RunArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Seconds between reports
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,
}

impl RunArgs {
    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = DriverConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::HelloThing(args) => {
            run(
                HelloThing {
                    interval: args.interval(),
                },
                config,
            )
            .await
        }
        Commands::LightSensor(args) => {
            run(
                LightSensor {
                    interval: args.interval(),
                },
                config,
            )
            .await
        }
    }
}

async fn run<D: ThingDriver>(driver: D, config: DriverConfig) -> anyhow::Result<()> {
    let (gateway, feed) = PipeGateway::with_feed();
    let console = console::spawn(feed);

    let mut supervisor = Supervisor::new(driver, Arc::new(gateway));
    let started = supervisor.start(config.devices);
    tracing::info!("{} device(s) starting, press Ctrl-C to stop", started);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("shutting down");
    supervisor.shutdown_all().await;
    for (identity, state) in supervisor.states() {
        tracing::info!("{}: {}", identity, state);
    }
    console.abort();
    Ok(())
}
