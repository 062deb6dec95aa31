use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser};

use crate::core::{AUTHOR_NAME, SERVICE_NAME};

#[derive(Parser)]
#[clap(name = SERVICE_NAME)]
#[clap(author = AUTHOR_NAME)]
pub struct Cli {
    #[command(flatten, next_help_heading = "listen")]
    pub listen: ListenConfig,

    #[command(flatten, next_help_heading = "fetch")]
    pub fetch: FetchConfig,

    #[command(flatten, next_help_heading = "events")]
    pub events: EventsConfig,

    #[command(flatten, next_help_heading = "monitoring")]
    pub monitoring: MonitoringConfig,
}

#[derive(Args)]
pub struct ListenConfig {
    /// Address to serve the fetch API on
    #[clap(long, default_value = "0.0.0.0:8085")]
    pub http_addr: SocketAddr,
}

#[derive(Args)]
pub struct FetchConfig {
    /// Metrics path used when neither the route nor the caller provides one
    #[clap(long, default_value = "/metrics")]
    pub default_metrics_path: String,

    /// Number of scrapes running in parallel during one aggregation
    #[clap(long, default_value = "5", value_parser = clap::value_parser!(u16).range(1..))]
    pub scrape_concurrency: u16,

    /// Timeout for the whole scrape request in seconds
    #[clap(long, default_value = "30")]
    pub scrape_timeout: u64,

    /// Timeout for the HTTP connect phase in seconds
    #[clap(long, default_value = "30")]
    pub connect_timeout: u64,

    /// For how long to keep idle backend connections in the pool, in seconds
    #[clap(long, default_value = "90")]
    pub pool_idle_timeout: u64,

    /// How many idle connections to keep per backend host
    #[clap(long)]
    pub pool_max_idle_per_host: Option<usize>,

    /// Follow upstream redirects instead of restricting them to same-host hops
    #[clap(long)]
    pub follow_redirects: bool,

    /// Skip backend TLS certificate verification. DANGER: to be used only for testing
    #[clap(long)]
    pub skip_tls_verification: bool,

    /// Path to a YAML list of external exporters scraped alongside app instances
    #[clap(long)]
    pub external_exporters: Option<PathBuf>,

    /// Path to a YAML map of per-application metrics endpoint overrides
    #[clap(long)]
    pub app_endpoints: Option<PathBuf>,
}

#[derive(Args)]
pub struct EventsConfig {
    /// Capacity of the route event channel between the bus adapter and the registry
    #[clap(long, default_value = "16384")]
    pub event_buffer: usize,

    /// Path to a YAML list of register payloads applied at startup.
    /// To be used for testing without a message bus.
    #[clap(long)]
    pub static_routes: Option<PathBuf>,
}

#[derive(Args)]
pub struct MonitoringConfig {
    /// The socket used to export the process' own metrics
    #[clap(long, default_value = "127.0.0.1:9090")]
    pub metrics_addr: SocketAddr,

    /// Maximum logging level
    #[clap(long, default_value = "info")]
    pub max_logging_level: tracing::Level,

    /// Log in JSON format
    #[clap(long)]
    pub log_json: bool,
}
