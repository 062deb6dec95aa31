use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::{errors::FetchError, families, fetch::MetricsFetcher, routes::Routes};

#[derive(Clone)]
pub struct ApiState {
    pub fetcher: Arc<MetricsFetcher>,
    pub routes: Arc<Routes>,
    pub default_metrics_path: String,
}

impl IntoResponse for FetchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, format!("{} {}\n", status.as_u16(), self)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    app: Option<String>,
    route_url: Option<String>,
    metric_path: Option<String>,
    only_from_app: Option<String>,
}

pub fn setup_router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/apps/{target}/metrics", get(app_metrics))
        .route("/v1/apps/metrics", get(app_metrics_query))
        .route("/v1/apps/{target}/only-app-metrics", get(only_app_metrics))
        .route("/v1/apps/only-app-metrics", get(only_app_metrics_query))
        .route("/routes", get(routes_dump))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn app_metrics(
    State(state): State<ApiState>,
    Path(target): Path<String>,
    Query(query): Query<MetricsQuery>,
    headers: HeaderMap,
) -> Response {
    serve_metrics(state, Some(target), query, headers, false).await
}

async fn app_metrics_query(
    State(state): State<ApiState>,
    Query(query): Query<MetricsQuery>,
    headers: HeaderMap,
) -> Response {
    serve_metrics(state, None, query, headers, false).await
}

async fn only_app_metrics(
    State(state): State<ApiState>,
    Path(target): Path<String>,
    Query(query): Query<MetricsQuery>,
    headers: HeaderMap,
) -> Response {
    serve_metrics(state, Some(target), query, headers, true).await
}

async fn only_app_metrics_query(
    State(state): State<ApiState>,
    Query(query): Query<MetricsQuery>,
    headers: HeaderMap,
) -> Response {
    serve_metrics(state, None, query, headers, true).await
}

/// Shared handler body: pick the identifier from the path or query, run the
/// aggregation and render the merged families as exposition text.
async fn serve_metrics(
    state: ApiState,
    target: Option<String>,
    query: MetricsQuery,
    headers: HeaderMap,
    force_only_app: bool,
) -> Response {
    let target = target
        .or(query.app)
        .or(query.route_url)
        .filter(|target| !target.is_empty());
    let Some(target) = target else {
        return (
            StatusCode::BAD_REQUEST,
            "400 Bad Request: You must set app id or path\n",
        )
            .into_response();
    };

    let mut metric_path = query
        .metric_path
        .map(|path| path.trim().to_string())
        .unwrap_or_default();
    if metric_path.is_empty() {
        metric_path = state.default_metrics_path.clone();
    }
    if !metric_path.starts_with('/') {
        metric_path = format!("/{metric_path}");
    }

    let only_app = force_only_app || query.only_from_app.is_some();

    // Only the inbound Authorization header is forwarded to backends.
    let mut forwarded = HeaderMap::new();
    if let Some(auth) = headers.get(header::AUTHORIZATION) {
        forwarded.insert(header::AUTHORIZATION, auth.clone());
    }

    match state
        .fetcher
        .metrics(&target, &metric_path, only_app, Some(forwarded))
        .await
    {
        Ok(found) => (
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            families::encode_families(&found),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

/// Diagnostic dump of the whole route index.
async fn routes_dump(State(state): State<ApiState>) -> Response {
    match serde_json::to_string(&state.routes.snapshot()) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to serialize route table: {err}"),
        )
            .into_response(),
    }
}

async fn healthz() -> &'static str {
    "OK"
}
