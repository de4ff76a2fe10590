//! CLI entrypoint for the `bridge` binary.

use clap::Parser as _;

use console_bridge::cli::Cli;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    console_bridge::inner_main(Cli::parse()).await
}
