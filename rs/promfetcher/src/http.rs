use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Error};
use async_trait::async_trait;
use reqwest::{redirect, Error as ReqwestError, Request, Response};
use tracing::warn;

use crate::{cli::FetchConfig, core::SERVICE_NAME, routes::Route};

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> Result<Response, ReqwestError>;
}

pub struct ReqwestClient(pub reqwest::Client);

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, req: Request) -> Result<Response, ReqwestError> {
        self.0.execute(req).await
    }
}

/// Route-aware transport seam used by the scraper. Tests stub this to
/// fabricate upstream responses.
#[async_trait]
pub trait ScrapeBackend: Send + Sync {
    async fn execute(&self, route: &Route, req: Request) -> Result<Response, ReqwestError>;
}

/// A TLS route carrying a certificate SAN is scraped under that name, with
/// the name pinned to the registered address, so verification runs against
/// the advertised SAN. Only possible when the address is a socket address
/// the client can be told to resolve.
pub fn san_pin(route: &Route) -> Option<SocketAddr> {
    if !route.tls || route.server_cert_domain_san.is_empty() {
        return None;
    }
    route.address.parse().ok()
}

/// Redirect policy for scrapes when the operator has not opted into
/// following upstream redirects: same-host hops (relative redirects) are
/// allowed, anything pointing at another host is refused.
fn same_host_redirect_policy() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        let previous = attempt.previous();
        let Some(first) = previous.first().cloned() else {
            return attempt.error("redirect with no previous request, should not happen");
        };
        let hops = previous.len();

        if hops > 1 {
            return attempt.error(
                "too many redirects, pass a metric_path parameter with the direct endpoint",
            );
        }

        if attempt.url().host_str() == first.host_str() {
            attempt.follow()
        } else {
            attempt.error(
                "external redirect detected, pass a metric_path parameter with the direct endpoint",
            )
        }
    })
}

#[derive(Clone)]
struct BackendOptions {
    timeout: Duration,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: Option<usize>,
    follow_redirects: bool,
    skip_tls_verification: bool,
}

impl BackendOptions {
    fn builder(&self) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(Some(self.pool_idle_timeout))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .user_agent(SERVICE_NAME)
            .redirect(if self.follow_redirects {
                redirect::Policy::limited(10)
            } else {
                same_host_redirect_policy()
            });

        if let Some(limit) = self.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(limit);
        }
        if self.skip_tls_verification {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder
    }
}

/// Builds and pools the outbound clients used to reach backends: one shared
/// client for plaintext and unpinned targets, one per pinned (SAN, address)
/// pair.
pub struct BackendFactory {
    options: BackendOptions,
    default_client: Arc<ReqwestClient>,
    san_clients: Mutex<HashMap<String, Arc<ReqwestClient>>>,
}

impl BackendFactory {
    pub fn new(fetch: &FetchConfig) -> Result<Self, Error> {
        let options = BackendOptions {
            timeout: Duration::from_secs(fetch.scrape_timeout),
            connect_timeout: Duration::from_secs(fetch.connect_timeout),
            pool_idle_timeout: Duration::from_secs(fetch.pool_idle_timeout),
            pool_max_idle_per_host: fetch.pool_max_idle_per_host,
            follow_redirects: fetch.follow_redirects,
            skip_tls_verification: fetch.skip_tls_verification,
        };

        let default_client = Arc::new(ReqwestClient(
            options
                .builder()
                .build()
                .context("unable to build backend HTTP client")?,
        ));

        Ok(Self {
            options,
            default_client,
            san_clients: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, route: &Route) -> Arc<ReqwestClient> {
        let Some(addr) = san_pin(route) else {
            return self.default_client.clone();
        };

        let key = format!("{}|{}", route.server_cert_domain_san, route.address);
        let mut cache = self.san_clients.lock().unwrap();
        if let Some(client) = cache.get(&key) {
            return client.clone();
        }

        match self
            .options
            .builder()
            .resolve(&route.server_cert_domain_san, addr)
            .build()
        {
            Ok(client) => {
                let client = Arc::new(ReqwestClient(client));
                cache.insert(key, client.clone());
                client
            }
            Err(err) => {
                warn!(
                    error = %err,
                    san = %route.server_cert_domain_san,
                    "unable to build SAN-pinned client, falling back to default"
                );
                self.default_client.clone()
            }
        }
    }
}

#[async_trait]
impl ScrapeBackend for BackendFactory {
    async fn execute(&self, route: &Route, req: Request) -> Result<Response, ReqwestError> {
        self.client_for(route).execute(req).await
    }
}
