use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Error};
use axum::{routing::get, Router};
use prometheus::Registry;
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    api::{self, ApiState},
    cli::Cli,
    endpoints::{EndpointStore, StaticEndpointStore},
    events::{self, RoutesUpdater},
    exporters,
    fetch::MetricsFetcher,
    http::BackendFactory,
    metrics::{self, FetchMetrics},
    routes::Routes,
    scrape::Scraper,
};

pub const SERVICE_NAME: &str = "promfetcher";
pub const AUTHOR_NAME: &str = "Promfetcher Maintainers";

pub async fn main(cli: Cli) -> Result<(), Error> {
    let metrics_registry: Registry = Registry::new_custom(Some(SERVICE_NAME.into()), None)?;

    info!(
        msg = format!("Starting {SERVICE_NAME}"),
        http_addr = cli.listen.http_addr.to_string().as_str(),
        metrics_addr = cli.monitoring.metrics_addr.to_string().as_str(),
    );

    let fetch_metrics = Arc::new(FetchMetrics::new(&metrics_registry));

    // Route index, owned here and mutated only through the updater for the
    // lifetime of the process.
    let routes = Arc::new(Routes::new());

    let (event_tx, event_rx) = mpsc::channel(cli.events.event_buffer);
    let updater = RoutesUpdater::new(
        Arc::clone(&routes),
        event_rx,
        Arc::clone(&fetch_metrics),
    );
    tokio::spawn(updater.run());

    // Seed the index before serving if a static route set was given. Live
    // events go through the same channel; the bus adapter owns the sender.
    if let Some(path) = &cli.events.static_routes {
        let seed = events::load_seed(path).context("unable to load static routes")?;
        info!(count = seed.len(), "seeding static routes");
        for event in seed {
            event_tx
                .send(event)
                .await
                .map_err(|_| anyhow!("route event channel closed"))?;
        }
    }

    let external_exporters = match &cli.fetch.external_exporters {
        Some(path) => {
            exporters::load_external_exporters(path).context("unable to load external exporters")?
        }
        None => Vec::new(),
    };

    let endpoint_store: Arc<dyn EndpointStore> = match &cli.fetch.app_endpoints {
        Some(path) => Arc::new(
            StaticEndpointStore::from_file(path).context("unable to load app endpoint overrides")?,
        ),
        None => Arc::new(StaticEndpointStore::default()),
    };

    let backend = Arc::new(BackendFactory::new(&cli.fetch)?);
    let scraper = Arc::new(Scraper::new(
        backend,
        endpoint_store,
        Duration::from_secs(cli.fetch.scrape_timeout),
    ));

    let fetcher = Arc::new(MetricsFetcher::new(
        scraper,
        Arc::clone(&routes),
        external_exporters,
        Arc::clone(&fetch_metrics),
        cli.fetch.scrape_concurrency as usize,
    ));

    let app = api::setup_router(ApiState {
        fetcher,
        routes: Arc::clone(&routes),
        default_metrics_path: cli.fetch.default_metrics_path.clone(),
    });

    let metrics_router = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(metrics_registry.clone());

    let api_listener = tokio::net::TcpListener::bind(cli.listen.http_addr)
        .await
        .context("failed to bind API listener")?;
    let metrics_listener = tokio::net::TcpListener::bind(cli.monitoring.metrics_addr)
        .await
        .context("failed to bind metrics listener")?;

    let api_server = async {
        axum::serve(api_listener, app)
            .await
            .context("API server failed")
    };
    let metrics_server = async {
        axum::serve(metrics_listener, metrics_router)
            .await
            .context("metrics server failed")
    };

    tokio::try_join!(api_server, metrics_server)?;

    Ok(())
}
