use std::{collections::BTreeMap, path::Path};

use anyhow::{bail, Context, Error};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Deserialize;

use crate::routes::{Route, Tags};

lazy_static! {
    static ref PARAM_TEMPLATE: Regex = Regex::new(r"\{([a-z_]+)\}").unwrap();
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// A statically configured, non-instance scrape target merged into
/// aggregation results once per matched application.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalExporter {
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Query parameters with `{field}` placeholders resolved against the
    /// matched application's tags.
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("external exporter `{name}`: unknown template field `{field}`")]
pub struct TemplateError {
    pub name: String,
    pub field: String,
}

impl ExternalExporter {
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Build the synthetic scrape target for one matched application.
    /// The route carries no instance id so instance labels are never
    /// injected for it.
    pub fn to_route(&self, tags: Tags) -> Result<Route, TemplateError> {
        let url_params = self.params_for(&tags)?;
        Ok(Route {
            private_instance_id: self.name.clone(),
            tags,
            server_cert_domain_san: String::new(),
            address: self.host.clone(),
            tls: self.is_tls(),
            ttl: 0,
            host: self.host.clone(),
            metrics_path: Some(self.metrics_path.clone()),
            url_params,
        })
    }

    fn params_for(&self, tags: &Tags) -> Result<Vec<(String, String)>, TemplateError> {
        let mut out = Vec::new();
        for (key, values) in &self.params {
            for value in values {
                let resolved = resolve_template(value, tags).map_err(|field| TemplateError {
                    name: self.name.clone(),
                    field,
                })?;
                out.push((key.clone(), resolved));
            }
        }
        Ok(out)
    }
}

/// Resolve `{field}` placeholders against a route's tags. An unknown field
/// name fails the whole value.
fn resolve_template(raw: &str, tags: &Tags) -> Result<String, String> {
    let mut unknown: Option<String> = None;
    let out = PARAM_TEMPLATE
        .replace_all(raw, |caps: &Captures| match tag_field(tags, &caps[1]) {
            Some(value) => value.to_string(),
            None => {
                unknown = Some(caps[1].to_string());
                String::new()
            }
        })
        .into_owned();

    match unknown {
        Some(field) => Err(field),
        None => Ok(out),
    }
}

fn tag_field<'a>(tags: &'a Tags, name: &str) -> Option<&'a str> {
    Some(match name {
        "process_type" => &tags.process_type,
        "process_instance_id" => &tags.process_instance_id,
        "component" => &tags.component,
        "instance_id" => &tags.instance_id,
        "space_name" => &tags.space_name,
        "organization_id" => &tags.organization_id,
        "process_id" => &tags.process_id,
        "organization_name" => &tags.organization_name,
        "source_id" => &tags.source_id,
        "app_id" => &tags.app_id,
        "app_name" => &tags.app_name,
        "space_id" => &tags.space_id,
        _ => return None,
    })
}

/// Load the exporter list from a YAML file, applying the scheme and
/// metrics-path defaults.
pub fn load_external_exporters(path: &Path) -> Result<Vec<ExternalExporter>, Error> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    let mut exporters: Vec<ExternalExporter> =
        serde_yaml::from_str(&raw).context("unable to parse external exporters")?;

    for exporter in &mut exporters {
        if exporter.host.is_empty() {
            bail!("host must be provided on external exporter");
        }
        if exporter.name.is_empty() {
            exporter.name = format!("{}{}", exporter.host, exporter.metrics_path);
        }
    }

    Ok(exporters)
}
