use anyhow::{anyhow, Error};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

pub fn setup_logging(cli: &Cli) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.monitoring.max_logging_level.to_string()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if cli.monitoring.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|err| anyhow!("unable to init logging: {err}"))
}
