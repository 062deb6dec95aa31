use axum::{
    body::Body,
    extract::State,
    http::{Response, StatusCode},
};
use prometheus::{
    opts, register_gauge_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, Gauge, IntCounter, IntCounterVec, Registry,
    TextEncoder,
};

use crate::routes::Route;

/// The process' own counters and gauges, registered on the service
/// registry and exported by the metrics listener.
pub struct FetchMetrics {
    /// Scrapes that failed per instance.
    pub fetch_failed: IntCounterVec,
    /// Scrapes that succeeded, per application.
    pub fetch_success: IntCounterVec,
    /// Route events that could not be decoded or validated.
    pub route_update_failed: IntCounter,
    /// Unix time of the last successful registry update.
    pub route_update_last: Gauge,
}

impl FetchMetrics {
    pub fn new(registry: &Registry) -> Self {
        let fetch_failed = register_int_counter_vec_with_registry!(
            opts!(
                "metric_fetch_failed_total",
                "Number of instance scrapes that failed."
            ),
            &[
                "organization_id",
                "space_id",
                "app_id",
                "organization_name",
                "space_name",
                "app_name",
                "index",
                "instance_id",
            ],
            registry
        )
        .unwrap();

        let fetch_success = register_int_counter_vec_with_registry!(
            opts!(
                "metric_fetch_success_total",
                "Number of instance scrapes that succeeded."
            ),
            &[
                "organization_id",
                "space_id",
                "app_id",
                "organization_name",
                "space_name",
                "app_name",
            ],
            registry
        )
        .unwrap();

        let route_update_failed = register_int_counter_with_registry!(
            opts!(
                "scrape_route_failed_total",
                "Number of route events dropped as malformed."
            ),
            registry
        )
        .unwrap();

        let route_update_last = register_gauge_with_registry!(
            opts!(
                "latest_route_update_time_seconds",
                "Unix time of the last successful route registry update."
            ),
            registry
        )
        .unwrap();

        Self {
            fetch_failed,
            fetch_success,
            route_update_failed,
            route_update_last,
        }
    }

    pub fn observe_fetch_failure(&self, route: &Route) {
        let tags = &route.tags;
        self.fetch_failed
            .with_label_values(&[
                tags.organization_id.as_str(),
                tags.space_id.as_str(),
                tags.app_id.as_str(),
                tags.organization_name.as_str(),
                tags.space_name.as_str(),
                tags.app_name.as_str(),
                tags.instance_id.as_str(),
                tags.instance_id.as_str(),
            ])
            .inc();
    }

    pub fn observe_fetch_success(&self, route: &Route) {
        let tags = &route.tags;
        self.fetch_success
            .with_label_values(&[
                tags.organization_id.as_str(),
                tags.space_id.as_str(),
                tags.app_id.as_str(),
                tags.organization_name.as_str(),
                tags.space_name.as_str(),
                tags.app_name.as_str(),
            ])
            .inc();
    }

    pub fn mark_route_update(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.route_update_last.set(now);
    }
}

/// Serve the process' own metrics in text exposition format.
pub async fn metrics_handler(State(registry): State<Registry>) -> Response<Body> {
    let metric_families = registry.gather();

    let encoder = TextEncoder::new();

    let mut metrics_text = Vec::new();
    if encoder.encode(&metric_families, &mut metrics_text).is_err() {
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body("Internal Server Error".into())
            .unwrap();
    }

    Response::builder()
        .status(StatusCode::OK)
        .body(metrics_text.into())
        .unwrap()
}
