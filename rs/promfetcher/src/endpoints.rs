use std::{collections::HashMap, path::Path};

use anyhow::{Context, Error};
use async_trait::async_trait;

/// Store of per-application metrics endpoint overrides, consulted ahead of
/// the caller-supplied default. The persistence behind it (service broker
/// bindings) lives outside this crate.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn endpoint_for_app(&self, app_id: &str) -> Option<String>;
}

/// Overrides loaded once at startup from a YAML map of app id to path.
#[derive(Debug, Default)]
pub struct StaticEndpointStore {
    endpoints: HashMap<String, String>,
}

impl StaticEndpointStore {
    pub fn new(endpoints: HashMap<String, String>) -> Self {
        Self { endpoints }
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        let endpoints: HashMap<String, String> =
            serde_yaml::from_str(&raw).context("unable to parse app endpoint overrides")?;
        Ok(Self::new(endpoints))
    }
}

#[async_trait]
impl EndpointStore for StaticEndpointStore {
    async fn endpoint_for_app(&self, app_id: &str) -> Option<String> {
        self.endpoints.get(app_id).cloned()
    }
}
