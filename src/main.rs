//! NetSIO hub: bridges an Atari 8-bit emulator's custom-device TCP channel to
//! NetSIO peripherals over UDP, or to a single peripheral over a serial line.
//!
//! See `DESIGN.md` for the grounding ledger and `SPEC_FULL.md` for the full
//! requirements this binary implements.

mod backend;
mod cli;
mod coalesce;
mod codec;
mod config;
mod constants;
mod host;
mod hub;
mod queue;
mod registry;
mod serial;
mod udp;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use mimalloc::MiMalloc;

use backend::{HostBackend, PeripheralBackend};
use cli::{Action, Cli, ConfigAction};
use config::Config;
use constants::{DEFAULT_SERIAL_BAUD, HOST_QUEUE_CAPACITY, HUB_VERSION};
use hub::Hub;
use queue::BoundedQueue;
use serial::SerialBackend;
use udp::UdpBackend;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn init_logging(verbose: bool, debug: bool) {
    let default_level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

/// Merge CLI flags over a loaded config file: CLI wins, file/env wins over
/// built-in defaults (already applied inside `Config::load`).
fn resolve_config(cli: &Cli, mut config: Config) -> Config {
    if let Some(netsio_port) = cli.netsio_port {
        config.netsio_port = netsio_port;
    }
    if let Some(port) = cli.port {
        config.atdev_port = port;
    }
    if let Some(serial) = &cli.serial {
        config.serial_port = Some(serial.clone());
    }
    if let Some(command_line) = cli.command_line {
        config.command_line = command_line.into();
    }
    if let Some(proceed_line) = cli.proceed_line {
        config.proceed_line = proceed_line.into();
    }
    if cli.verbose {
        config.verbose = true;
    }
    if cli.debug {
        config.debug = true;
    }
    config
}

fn run(config: Config) -> Result<()> {
    info!("netsio-hub {HUB_VERSION} starting");

    let host_channel = host::HostChannel::bind(config.atdev_port)
        .with_context(|| format!("failed to bind custom-device TCP channel on port {}", config.atdev_port))?;
    let host_backend: Arc<dyn HostBackend> = Arc::new(host_channel);

    let peripheral: Arc<dyn PeripheralBackend> = match &config.serial_port {
        Some(path) => {
            info!("using serial backend on {path}");
            SerialBackend::open(path, DEFAULT_SERIAL_BAUD, config.command_line, config.proceed_line)
                .with_context(|| format!("failed to open serial port {path}"))?
        }
        None => {
            info!("using NetSIO/UDP backend on port {}", config.netsio_port);
            UdpBackend::bind(config.netsio_port)
                .with_context(|| format!("failed to bind NetSIO UDP socket on port {}", config.netsio_port))?
        }
    };

    let host_queue = Arc::new(BoundedQueue::new(HOST_QUEUE_CAPACITY));
    let hub = Hub::new(Arc::clone(&peripheral), host_queue);

    Arc::clone(&peripheral).start(Arc::clone(&hub)).context("starting peripheral backend")?;

    let stop_host = Arc::clone(&host_backend);
    let stop_peripheral = Arc::clone(&peripheral);
    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        stop_host.stop();
        stop_peripheral.stop();
    })
    .context("installing interrupt handler")?;

    let result = host_backend.run(hub);
    peripheral.stop();
    result
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Action::Config { action: ConfigAction::Show }) = &cli.action {
        let config = resolve_config(&cli, Config::load(cli.config.as_ref())?);
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let config = resolve_config(&cli, Config::load(cli.config.as_ref())?);
    init_logging(config.verbose, config.debug);

    if let Err(err) = run(config) {
        log::error!("fatal error: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}
