use std::{io::Read, sync::Arc, time::Duration};

use flate2::read::GzDecoder;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use reqwest::Request;
use url::Url;

use crate::{
    endpoints::EndpointStore,
    errors::FetchError,
    http::{san_pin, ScrapeBackend},
    routes::Route,
};

/// Content negotiation: OpenMetrics preferred, legacy Prometheus text
/// accepted at reduced priority.
const ACCEPT_HEADER: &str =
    "application/openmetrics-text; version=0.0.1,text/plain;version=0.0.4;q=0.5,*/*;q=0.1";

/// Fetches one instance's metrics endpoint.
pub struct Scraper {
    backend: Arc<dyn ScrapeBackend>,
    endpoints: Arc<dyn EndpointStore>,
    scrape_timeout: Duration,
}

impl Scraper {
    pub fn new(
        backend: Arc<dyn ScrapeBackend>,
        endpoints: Arc<dyn EndpointStore>,
        scrape_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            endpoints,
            scrape_timeout,
        }
    }

    /// Perform one GET against the route's metrics endpoint and return the
    /// (decompressed) exposition text.
    ///
    /// Endpoint precedence: the route's own override, then a persisted
    /// per-application override, then the caller-supplied default.
    pub async fn scrape(
        &self,
        route: &Route,
        metrics_path_default: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<String, FetchError> {
        let scheme = if route.tls { "https" } else { "http" };

        let endpoint = match &route.metrics_path {
            Some(path) => path.clone(),
            None => match self.endpoints.endpoint_for_app(&route.tags.app_id).await {
                Some(path) => path,
                None => metrics_path_default.to_string(),
            },
        };

        // Scrape under the pinned SAN when there is one, the registered
        // address otherwise. The Host header below carries the virtual
        // host either way.
        let authority = match san_pin(route) {
            Some(addr) => format!("{}:{}", route.server_cert_domain_san, addr.port()),
            None => route.address.clone(),
        };

        let mut url = Url::parse(&format!("{scheme}://{authority}{endpoint}"))
            .map_err(|err| FetchError::Transport(format!("invalid scrape url: {err}")))?;
        if !route.url_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &route.url_params {
                pairs.append_pair(key, value);
            }
        }

        let mut req = Request::new(Method::GET, url);
        if let Some(headers) = headers {
            for (name, value) in headers {
                req.headers_mut().insert(name.clone(), value.clone());
            }
        }

        let hdrs = req.headers_mut();
        hdrs.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT_HEADER));
        hdrs.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        if let Ok(value) = HeaderValue::from_str(&self.scrape_timeout.as_secs().to_string()) {
            hdrs.insert("x-prometheus-scrape-timeout-seconds", value);
        }
        hdrs.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(if route.tls { "https" } else { "http" }),
        );
        hdrs.insert("x-promfetcher-scrapping", HeaderValue::from_static("true"));
        // Virtual host for name-based routing through an intermediary,
        // independent of the network address.
        if let Ok(host) = HeaderValue::from_str(&route.host) {
            hdrs.insert(header::HOST, host);
        }

        let resp = self
            .backend
            .execute(route, req)
            .await
            .map_err(|err| FetchError::Transport(format!("scrape request failed: {err}")))?;

        let status = resp.status();
        if status != StatusCode::OK {
            if status.is_client_error() {
                return Err(FetchError::NoEndpointFound {
                    app: format!(
                        "{}/{}/{} (status code {})",
                        route.tags.organization_name,
                        route.tags.space_name,
                        route.tags.app_name,
                        status.as_u16(),
                    ),
                    endpoint,
                });
            }
            return Err(FetchError::Transport(format!(
                "server returned HTTP status {status}"
            )));
        }

        let gzipped = resp
            .headers()
            .get(header::CONTENT_ENCODING)
            .map(|value| value.as_bytes() == b"gzip")
            .unwrap_or(false);

        let body = resp
            .bytes()
            .await
            .map_err(|err| FetchError::Transport(format!("unable to read scrape body: {err}")))?;

        if !gzipped {
            return String::from_utf8(body.to_vec()).map_err(|err| {
                FetchError::Transport(format!("scrape body is not valid utf-8: {err}"))
            });
        }

        let mut text = String::new();
        GzDecoder::new(body.as_ref())
            .read_to_string(&mut text)
            .map_err(|err| {
                FetchError::Transport(format!("unable to decompress scrape body: {err}"))
            })?;
        Ok(text)
    }
}
