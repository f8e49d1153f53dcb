//! Command-line surface: `clap::Parser` derive mirroring the original hub's
//! argument parser, plus the ambient `--config` override and `config show`
//! subcommand used to inspect the resolved configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::constants::HUB_VERSION;
use crate::serial::{CommandLine, ProceedLine};

#[derive(Parser, Debug)]
#[command(name = "netsio-hub")]
#[command(version = HUB_VERSION)]
#[command(about = "Bridges an Atari 8-bit emulator's custom-device channel to NetSIO peripherals")]
pub struct Cli {
    /// UDP port NetSIO peripherals connect to.
    #[arg(long)]
    pub netsio_port: Option<u16>,

    /// TCP port the emulator's custom-device channel connects to.
    #[arg(long)]
    pub port: Option<u16>,

    /// Use a serial port instead of UDP/NetSIO for the peripheral side.
    #[arg(long)]
    pub serial: Option<String>,

    /// Which UART line carries the SIO COMMAND signal (serial backend only).
    #[arg(long = "command", value_enum)]
    pub command_line: Option<CommandLineArg>,

    /// Which UART line carries the SIO PROCEED signal (serial backend only).
    #[arg(long = "proceed", value_enum)]
    pub proceed_line: Option<ProceedLineArg>,

    /// Info-level logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Debug-level logging.
    #[arg(short, long)]
    pub debug: bool,

    /// Load/save configuration at this path instead of the platform default.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Inspect the resolved configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the resolved configuration (file + env + CLI) as JSON.
    Show,
}

/// `clap::ValueEnum` mirror of [`CommandLine`] (clap needs its own trait on
/// the CLI-facing type; `From` converts to the domain type used everywhere
/// else).
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandLineArg {
    Rts,
    Dtr,
}

impl From<CommandLineArg> for CommandLine {
    fn from(value: CommandLineArg) -> Self {
        match value {
            CommandLineArg::Rts => CommandLine::Rts,
            CommandLineArg::Dtr => CommandLine::Dtr,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProceedLineArg {
    Cts,
    Dsr,
}

impl From<ProceedLineArg> for ProceedLine {
    fn from(value: ProceedLineArg) -> Self {
        match value {
            ProceedLineArg::Cts => ProceedLine::Cts,
            ProceedLineArg::Dsr => ProceedLine::Dsr,
        }
    }
}
