//! zoneflow CLI: run the zone processing engine over a file of classified
//! zones and stream the results to disk.

mod commands;
mod sink;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
