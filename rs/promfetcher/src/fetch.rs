use std::{collections::BTreeMap, sync::Arc};

use futures::{stream, StreamExt};
use http::HeaderMap;
use tracing::{debug, warn};

use crate::{
    errors::FetchError,
    exporters::ExternalExporter,
    families::{self, MetricFamilies},
    metrics::FetchMetrics,
    routes::{Route, Routes, Tags},
    scrape::Scraper,
};

/// Process type stamped on synthesized external-exporter targets. Such
/// routes carry no instance id and never receive caller headers.
pub const PROCESS_EXTERNAL_EXPORTER: &str = "external_exporter";

/// Fans one metrics query out across every resolved instance, relabels and
/// merges the results.
pub struct MetricsFetcher {
    scraper: Arc<Scraper>,
    routes: Arc<Routes>,
    external_exporters: Vec<ExternalExporter>,
    metrics: Arc<FetchMetrics>,
    concurrency: usize,
}

impl MetricsFetcher {
    pub fn new(
        scraper: Arc<Scraper>,
        routes: Arc<Routes>,
        external_exporters: Vec<ExternalExporter>,
        metrics: Arc<FetchMetrics>,
        concurrency: usize,
    ) -> Self {
        Self {
            scraper,
            routes,
            external_exporters,
            metrics,
            concurrency,
        }
    }

    /// Resolve `identifier`, scrape every candidate with bounded
    /// concurrency and merge the relabeled families.
    ///
    /// Per-candidate failure policy: with no external exporters configured
    /// a failure fails the whole call; otherwise it is downgraded to a
    /// synthetic scrape-error sample and partial results are returned.
    pub async fn metrics(
        &self,
        identifier: &str,
        metrics_path_default: &str,
        only_app_metrics: bool,
        headers: Option<HeaderMap>,
    ) -> Result<MetricFamilies, FetchError> {
        let mut routes = self.routes.find(identifier);
        if routes.is_empty() {
            return Err(FetchError::NoAppFound(identifier.to_string()));
        }

        let mut unmerged: Vec<MetricFamilies> = Vec::new();

        if !only_app_metrics && !self.external_exporters.is_empty() {
            self.synthesize_exporter_targets(&mut routes, &mut unmerged);
        }

        let single_target = self.external_exporters.is_empty();

        let results: Vec<(Route, Result<MetricFamilies, FetchError>)> = stream::iter(routes)
            .map(|route| {
                let headers = if route.tags.process_type == PROCESS_EXTERNAL_EXPORTER {
                    None
                } else {
                    headers.clone()
                };
                async move {
                    let result = self
                        .fetch_one(&route, metrics_path_default, headers.as_ref())
                        .await;
                    (route, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut first_error: Option<FetchError> = None;
        for (route, result) in results {
            match result {
                Ok(found) => {
                    self.metrics.observe_fetch_success(&route);
                    unmerged.push(found);
                }
                Err(err) => {
                    if single_target {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        continue;
                    }

                    debug!(
                        address = %route.address,
                        instance_id = %route.tags.instance_id,
                        app = %format!(
                            "{}/{}/{}",
                            route.tags.organization_name,
                            route.tags.space_name,
                            route.tags.app_name,
                        ),
                        "cannot get metrics for instance: {err}"
                    );
                    self.metrics.observe_fetch_failure(&route);
                    unmerged.push(families::scrape_error_family(&route, &err.to_string()));
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let mut merged = MetricFamilies::new();
        for found in unmerged {
            families::merge(&mut merged, found);
        }
        Ok(merged)
    }

    /// Add one synthetic target per distinct matched application per
    /// configured exporter. A template failure for one exporter is
    /// recorded as a synthetic sample and never aborts the batch.
    fn synthesize_exporter_targets(
        &self,
        routes: &mut Vec<Route>,
        unmerged: &mut Vec<MetricFamilies>,
    ) {
        let mut tags_by_app: BTreeMap<String, Tags> = BTreeMap::new();
        for route in routes.iter() {
            tags_by_app.insert(route.tags.app_id.clone(), route.tags.clone());
        }

        for app_tags in tags_by_app.values() {
            let tags = Tags {
                process_type: PROCESS_EXTERNAL_EXPORTER.to_string(),
                component: "promfetcher".to_string(),
                space_name: app_tags.space_name.clone(),
                organization_id: app_tags.organization_id.clone(),
                organization_name: app_tags.organization_name.clone(),
                source_id: app_tags.source_id.clone(),
                app_id: app_tags.app_id.clone(),
                app_name: app_tags.app_name.clone(),
                space_id: app_tags.space_id.clone(),
                ..Default::default()
            };

            for exporter in &self.external_exporters {
                match exporter.to_route(tags.clone()) {
                    Ok(route) => routes.push(route),
                    Err(err) => {
                        let err = format!("error when setting external exporter routes: {err}");
                        warn!(
                            external_exporter = %exporter.name,
                            app = %format!(
                                "{}/{}/{}",
                                tags.organization_name, tags.space_name, tags.app_name,
                            ),
                            "{err}"
                        );
                        unmerged.push(families::exporter_error_family(&tags, exporter, &err));
                    }
                }
            }
        }
    }

    /// Scrape one route, parse the exposition text and relabel every
    /// returned family.
    async fn fetch_one(
        &self,
        route: &Route,
        metrics_path_default: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<MetricFamilies, FetchError> {
        let body = self
            .scraper
            .scrape(route, metrics_path_default, headers)
            .await?;

        let mut found = families::parse_families(&body).map_err(|err| {
            FetchError::Transport(format!("unable to parse scraped metrics: {err}"))
        })?;
        families::relabel(&mut found, route);
        Ok(found)
    }
}

#[cfg(test)]
pub mod test;
