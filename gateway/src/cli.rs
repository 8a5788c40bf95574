//! CLI argument definitions for the keypool gateway.
//!
//! This file should remain minimal, containing only CLI argument struct definitions.

use std::path::PathBuf;

use clap::{Args, Parser};
use keypool_core::observability::LogFormat;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct GatewayArgs {
    /// Path to the TOML config file. Incompatible with `--default-config`
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Use the built-in defaults. Incompatible with `--config-file`
    #[arg(long)]
    pub default_config: bool,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    pub log_format: LogFormat,

    /// These commands trigger some workflow then exit without launching the gateway.
    #[command(flatten)]
    pub early_exit_commands: EarlyExitCommands,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
pub struct EarlyExitCommands {
    /// Load and validate the config file, then exit.
    #[arg(long)]
    pub check_config: bool,
}
