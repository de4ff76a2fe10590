//! Command-line interface definitions for the console bridge.
//!
//! The bridge is configured primarily through a TOML config file; the CLI
//! offers the file path plus a few overrides that are convenient in
//! development and integration tests.

use std::env;

use clap::{Parser, Subcommand, ValueEnum};

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands for the bridge.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Launch the console backend (auth endpoints, cluster proxies, static assets).
    Serve(ServeArgs),
}

/// Arguments for the serve command.
#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Path to the configuration file
    #[arg(short, long, default_value = "console_bridge.toml", env = "BRIDGE_CONFIG")]
    pub config: String,

    /// Optional override for the listen address, e.g. `http://0.0.0.0:9000`
    #[arg(long)]
    pub listen: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

/// Supported log output formats.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
    Pretty,
}
