use anyhow::Error;
use clap::Parser;

use crate::cli::Cli;

mod api;
mod cli;
mod core;
mod endpoints;
mod errors;
mod events;
mod exporters;
mod families;
mod fetch;
mod http;
mod log;
mod metrics;
mod routes;
mod scrape;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    log::setup_logging(&cli)?;
    core::main(cli).await
}
