use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Process type of routes that are user-facing scrape targets.
/// Other process types (workers, tasks) never serve metrics.
pub const PROCESS_WEB: &str = "web";

/// Ownership metadata attached to a route by the platform.
/// Used both as a lookup predicate and as metric-label material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    #[serde(default)]
    pub process_type: String,
    #[serde(default)]
    pub process_instance_id: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub space_name: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub process_id: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub space_id: String,
}

/// One network-reachable backend instance eligible for scraping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub private_instance_id: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub server_cert_domain_san: String,
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    /// Advertised staleness threshold. Carried for diagnostics only, the
    /// index never expires entries by it.
    #[serde(default)]
    pub ttl: u64,
    pub host: String,
    /// Metrics path override, set on external-exporter routes.
    #[serde(skip)]
    pub metrics_path: Option<String>,
    /// Query parameters attached to every scrape of this route.
    #[serde(skip)]
    pub url_params: Vec<(String, String)>,
}

impl Route {
    /// Identity of an entry within a key's collection. Ownership metadata
    /// may change without changing identity.
    pub fn is_same_instance(&self, other: &Route) -> bool {
        self.private_instance_id == other.private_instance_id
            && self.server_cert_domain_san == other.server_cert_domain_san
            && self.address == other.address
            && self.host == other.host
            && self.tags.instance_id == other.tags.instance_id
            && self.tags.process_instance_id == other.tags.process_instance_id
    }

    /// Whether `self` carries ownership metadata differing from `other`,
    /// in which case the stored entry must be replaced in place.
    pub fn needs_update(&self, other: &Route) -> bool {
        self.tags.app_id != other.tags.app_id
            || self.tags.app_name != other.tags.app_name
            || self.tags.organization_id != other.tags.organization_id
            || self.tags.organization_name != other.tags.organization_name
            || self.tags.space_id != other.tags.space_id
            || self.tags.space_name != other.tags.space_name
    }
}

/// Canonical lookup key derived from a routable URI: the routing segment
/// only, lowercased, path suffix stripped. Distinct URIs sharing a host
/// canonicalize to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn from_uri(uri: &str) -> Self {
        let key = uri.to_lowercase();
        let key = match key.find('/') {
            Some(idx) => key[..idx].to_string(),
            None => key,
        };
        Self(key)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-memory route index: route key -> horizontal replicas of one routable
/// name. Fed by the registry event stream, queried by every fetch.
///
/// A single reader/writer lock covers the map and the per-key vectors:
/// lookups iterate the nested collections while registration may be
/// reshaping them.
#[derive(Default)]
pub struct Routes {
    inner: RwLock<HashMap<RouteKey, Vec<Route>>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a route under the canonical key of `uri`.
    ///
    /// An identity-matching entry is replaced in place when its ownership
    /// metadata changed and left alone otherwise, so duplicate register
    /// events are idempotent. Never removes entries.
    pub fn register(&self, uri: &str, route: Route) {
        let key = RouteKey::from_uri(uri);

        let mut inner = self.inner.write().unwrap();
        let entries = inner.entry(key).or_default();

        match entries.iter().position(|r| route.is_same_instance(r)) {
            Some(idx) => {
                if route.needs_update(&entries[idx]) {
                    debug!(uri, instance_id = %route.tags.instance_id, "updating route");
                    entries[idx] = route;
                }
            }
            None => {
                debug!(uri, instance_id = %route.tags.instance_id, "registering route");
                entries.push(route);
            }
        }
    }

    /// Remove the identity-matching entry under the canonical key of `uri`.
    /// Unknown keys and unmatched routes are log-only no-ops, the registry
    /// stays available under stray unregister events.
    pub fn unregister(&self, uri: &str, route: &Route) {
        let key = RouteKey::from_uri(uri);

        let mut inner = self.inner.write().unwrap();
        let Some(entries) = inner.get_mut(&key) else {
            info!(uri, "no route to unregister");
            return;
        };

        if let Some(idx) = entries.iter().position(|r| route.is_same_instance(r)) {
            debug!(uri, instance_id = %route.tags.instance_id, "unregistering route");
            // Order within a key's collection is not meaningful.
            entries.swap_remove(idx);
        }
    }

    /// Resolve a user-supplied identifier to candidate routes.
    ///
    /// Three `/`-separated segments are an org/space/app-name triple, a
    /// UUID is an application id, anything else is a route name. The
    /// identifier is expected percent-decoded by the HTTP layer.
    pub fn find(&self, identifier: &str) -> Vec<Route> {
        let segments: Vec<&str> = identifier.split('/').collect();
        if segments.len() == 3 {
            return self.find_by_org_space_name(segments[0], segments[1], segments[2]);
        }

        if Uuid::parse_str(identifier).is_ok() {
            return self.find_by_app_id(identifier);
        }

        self.find_by_route_name(identifier)
    }

    pub fn find_by_org_space_name(&self, org: &str, space: &str, name: &str) -> Vec<Route> {
        self.scan(|tags| {
            tags.organization_name == org && tags.space_name == space && tags.app_name == name
        })
    }

    pub fn find_by_app_id(&self, app_id: &str) -> Vec<Route> {
        self.scan(|tags| tags.app_id == app_id)
    }

    /// Direct key lookup, no web-process filtering or deduplication.
    pub fn find_by_route_name(&self, name: &str) -> Vec<Route> {
        let key = RouteKey::from_uri(name);
        self.inner
            .read()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Full-index scan keeping web-process routes matching `pred`,
    /// deduplicated by network address (first occurrence wins) so one
    /// physical instance reachable via several keys is scraped once.
    fn scan(&self, pred: impl Fn(&Tags) -> bool) -> Vec<Route> {
        let inner = self.inner.read().unwrap();

        let mut seen: HashSet<String> = HashSet::new();
        let mut found = Vec::new();
        for entries in inner.values() {
            for route in entries {
                if route.tags.process_type != PROCESS_WEB {
                    continue;
                }
                if seen.contains(route.address.as_str()) {
                    continue;
                }
                if !pred(&route.tags) {
                    continue;
                }
                seen.insert(route.address.clone());
                found.push(route.clone());
            }
        }
        found
    }

    /// Replace the whole index wholesale, for a resync from scratch. The
    /// swap happens under the same exclusive lock as every other write.
    pub fn reset(&self, entries: HashMap<RouteKey, Vec<Route>>) {
        let mut inner = self.inner.write().unwrap();
        *inner = entries;
    }

    /// Deterministic snapshot of the whole index for diagnostic rendering.
    /// Takes the read lock for the full traversal.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<Route>> {
        let inner = self.inner.read().unwrap();
        inner
            .iter()
            .map(|(key, entries)| (key.to_string(), entries.clone()))
            .collect()
    }
}
