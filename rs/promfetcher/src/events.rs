use std::{path::Path, sync::Arc};

use anyhow::{bail, Context, Error};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    metrics::FetchMetrics,
    routes::{Route, Routes, Tags},
};

/// Lifecycle stage carried alongside a raw payload by the message-bus
/// adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Register,
    Unregister,
}

/// One event as delivered by the transport, before decoding.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: EventKind,
    pub payload: Bytes,
}

/// Decoded route lifecycle event. The field set mirrors the envelope the
/// router publishes on the message bus.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteEvent {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls_port: u16,
    #[serde(default)]
    pub private_instance_id: String,
    #[serde(default)]
    pub private_instance_index: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub route_service_url: String,
    #[serde(default)]
    pub server_cert_domain_san: String,
    #[serde(default)]
    pub stale_threshold_in_seconds: u64,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub uris: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("undecodable event payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("route_service_url must be https")]
    InsecureRouteService,
}

impl RouteEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        let event: RouteEvent = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), EventError> {
        if !self.route_service_url.is_empty() && !self.route_service_url.starts_with("https") {
            return Err(EventError::InsecureRouteService);
        }
        Ok(())
    }

    /// Prefer the TLS port over the plaintext one when both are advertised.
    fn port(&self) -> (u16, bool) {
        if self.tls_port != 0 {
            (self.tls_port, true)
        } else {
            (self.port, false)
        }
    }

    pub fn to_route(&self) -> Route {
        let (port, tls) = self.port();
        Route {
            private_instance_id: self.private_instance_id.clone(),
            tags: self.tags.clone(),
            server_cert_domain_san: self.server_cert_domain_san.clone(),
            address: format!("{}:{}", self.host, port),
            tls,
            ttl: self.stale_threshold_in_seconds,
            host: self.host.clone(),
            metrics_path: None,
            url_params: Vec::new(),
        }
    }
}

/// Applies the route event stream to the index.
///
/// Tolerates an unbounded, unordered, possibly-duplicated stream: duplicate
/// registers are idempotent and unregisters without a prior register are
/// no-ops. Malformed events are counted and dropped, never fatal.
pub struct RoutesUpdater {
    routes: Arc<Routes>,
    rx: mpsc::Receiver<RawEvent>,
    metrics: Arc<FetchMetrics>,
}

impl RoutesUpdater {
    pub fn new(routes: Arc<Routes>, rx: mpsc::Receiver<RawEvent>, metrics: Arc<FetchMetrics>) -> Self {
        Self {
            routes,
            rx,
            metrics,
        }
    }

    /// Drain the event stream for the lifetime of the process, concurrently
    /// with all lookup and aggregation activity.
    pub async fn run(mut self) {
        info!("route updater started");
        while let Some(event) = self.rx.recv().await {
            self.apply(event);
        }
        warn!("route event stream closed, updater exiting");
    }

    pub fn apply(&self, raw: RawEvent) {
        let event = match RouteEvent::decode(&raw.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "dropping malformed route event");
                self.metrics.route_update_failed.inc();
                return;
            }
        };

        // Routes without an application id are not user-facing scrape
        // targets (platform components, route services).
        if event.tags.app_id.is_empty() {
            debug!(app = %event.app, "dropping non-app route event");
            return;
        }

        let route = event.to_route();
        for uri in &event.uris {
            match raw.kind {
                EventKind::Register => self.routes.register(uri, route.clone()),
                EventKind::Unregister => self.routes.unregister(uri, &route),
            }
        }
        self.metrics.mark_route_update();
    }
}

/// Load a static route seed: a YAML list of register payloads pushed
/// through the same decode/validate path as live events.
pub fn load_seed(path: &Path) -> Result<Vec<RawEvent>, Error> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    let docs: Vec<serde_yaml::Value> =
        serde_yaml::from_str(&raw).context("unable to parse static routes")?;

    if docs.is_empty() {
        bail!("static routes file is empty");
    }

    docs.into_iter()
        .map(|doc| {
            let payload = serde_json::to_vec(&doc).context("unable to encode static route")?;
            Ok(RawEvent {
                kind: EventKind::Register,
                payload: payload.into(),
            })
        })
        .collect()
}

#[cfg(test)]
pub mod test;
