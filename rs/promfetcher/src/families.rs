use std::{collections::BTreeMap, fmt::Write, io};

use prometheus_parse::{Scrape, Value};

use crate::{
    exporters::ExternalExporter,
    routes::{Route, Tags},
};

/// Labels upstream samples may not carry into the merged output. Stripped
/// before the trusted ownership labels are injected.
const RESERVED_LABELS: &[&str] = &[
    "organization_id",
    "space_id",
    "app_id",
    "organization_name",
    "space_name",
    "app_name",
    "index",
    "instance_id",
    "instance",
];

pub const SCRAPE_ERROR_FAMILY: &str = "promfetcher_scrape_error";
pub const EXPORTER_ERROR_FAMILY: &str = "promfetcher_scrape_external_exporter_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl FamilyKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
            Self::Untyped => "untyped",
        }
    }
}

/// One sample line: full wire name (`foo`, `foo_bucket`, ...), label pairs
/// and value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// A named group of samples sharing a metric definition.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub kind: FamilyKind,
    pub metrics: Vec<MetricPoint>,
}

pub type MetricFamilies = BTreeMap<String, MetricFamily>;

/// Parse exposition text into families. Histogram and summary series come
/// back folded from the parser and are expanded to flat `_bucket` /
/// quantile points so relabeling and merging treat every sample uniformly.
pub fn parse_families(text: &str) -> io::Result<MetricFamilies> {
    let scrape = Scrape::parse(text.lines().map(|line| Ok(line.to_string())))?;

    let mut families = MetricFamilies::new();
    for sample in scrape.samples {
        let mut labels: Vec<(String, String)> = sample
            .labels
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        labels.sort();

        let (kind, points) = match sample.value {
            Value::Counter(value) => (
                FamilyKind::Counter,
                vec![MetricPoint {
                    name: sample.metric.clone(),
                    labels,
                    value,
                }],
            ),
            Value::Gauge(value) => (
                FamilyKind::Gauge,
                vec![MetricPoint {
                    name: sample.metric.clone(),
                    labels,
                    value,
                }],
            ),
            Value::Untyped(value) => (
                FamilyKind::Untyped,
                vec![MetricPoint {
                    name: sample.metric.clone(),
                    labels,
                    value,
                }],
            ),
            Value::Histogram(counts) => {
                let name = format!("{}_bucket", sample.metric);
                let points = counts
                    .into_iter()
                    .map(|count| {
                        let mut labels = labels.clone();
                        labels.push(("le".to_string(), fmt_value(count.less_than)));
                        MetricPoint {
                            name: name.clone(),
                            labels,
                            value: count.count,
                        }
                    })
                    .collect();
                (FamilyKind::Histogram, points)
            }
            Value::Summary(counts) => {
                let points = counts
                    .into_iter()
                    .map(|count| {
                        let mut labels = labels.clone();
                        labels.push(("quantile".to_string(), fmt_value(count.quantile)));
                        MetricPoint {
                            name: sample.metric.clone(),
                            labels,
                            value: count.count,
                        }
                    })
                    .collect();
                (FamilyKind::Summary, points)
            }
        };

        let family = families
            .entry(sample.metric.clone())
            .or_insert_with(|| MetricFamily {
                name: sample.metric.clone(),
                help: scrape.docs.get(&sample.metric).cloned(),
                kind,
                metrics: Vec::new(),
            });
        family.metrics.extend(points);
    }

    Ok(families)
}

/// Strip untrusted ownership labels from every sample and inject the
/// route's identity. Instance labels are only injected for routes carrying
/// an instance id, which synthesized exporter targets never do.
pub fn relabel(families: &mut MetricFamilies, route: &Route) {
    let tags = &route.tags;
    for family in families.values_mut() {
        for point in &mut family.metrics {
            point
                .labels
                .retain(|(name, _)| !RESERVED_LABELS.contains(&name.as_str()));

            point.labels.extend([
                ("organization_id".to_string(), tags.organization_id.clone()),
                ("space_id".to_string(), tags.space_id.clone()),
                ("app_id".to_string(), tags.app_id.clone()),
                (
                    "organization_name".to_string(),
                    tags.organization_name.clone(),
                ),
                ("space_name".to_string(), tags.space_name.clone()),
                ("app_name".to_string(), tags.app_name.clone()),
            ]);

            if !tags.instance_id.is_empty() {
                point.labels.extend([
                    ("index".to_string(), tags.instance_id.clone()),
                    ("instance_id".to_string(), tags.instance_id.clone()),
                    ("instance".to_string(), route.address.clone()),
                ]);
            }
        }
    }
}

/// Merge `other` into `base`: families present in both concatenate their
/// sample lists, new families are added wholesale. Identical samples from
/// different instances are expected and kept.
pub fn merge(base: &mut MetricFamilies, other: MetricFamilies) {
    for (name, family) in other {
        match base.get_mut(&name) {
            Some(existing) => existing.metrics.extend(family.metrics),
            None => {
                base.insert(name, family);
            }
        }
    }
}

/// Synthetic counter emitted in place of a failed instance scrape so the
/// failure is visible in the merged output.
pub fn scrape_error_family(route: &Route, error: &str) -> MetricFamilies {
    let tags = &route.tags;
    let labels = vec![
        ("organization_id".to_string(), tags.organization_id.clone()),
        ("space_id".to_string(), tags.space_id.clone()),
        ("app_id".to_string(), tags.app_id.clone()),
        (
            "organization_name".to_string(),
            tags.organization_name.clone(),
        ),
        ("space_name".to_string(), tags.space_name.clone()),
        ("app_name".to_string(), tags.app_name.clone()),
        ("index".to_string(), tags.instance_id.clone()),
        ("instance_id".to_string(), tags.instance_id.clone()),
        ("instance".to_string(), route.address.clone()),
        ("error".to_string(), error.to_string()),
    ];

    singleton_counter_family(
        SCRAPE_ERROR_FAMILY,
        "Promfetcher scrape error on your instance",
        labels,
    )
}

/// Synthetic counter emitted when an exporter definition cannot be turned
/// into a scrape target for one application.
pub fn exporter_error_family(
    tags: &Tags,
    exporter: &ExternalExporter,
    error: &str,
) -> MetricFamilies {
    let labels = vec![
        ("organization_id".to_string(), tags.organization_id.clone()),
        ("space_id".to_string(), tags.space_id.clone()),
        ("app_id".to_string(), tags.app_id.clone()),
        (
            "organization_name".to_string(),
            tags.organization_name.clone(),
        ),
        ("space_name".to_string(), tags.space_name.clone()),
        ("app_name".to_string(), tags.app_name.clone()),
        ("index".to_string(), tags.instance_id.clone()),
        ("instance_id".to_string(), tags.instance_id.clone()),
        ("instance".to_string(), exporter.host.clone()),
        ("name".to_string(), exporter.name.clone()),
        ("error".to_string(), error.to_string()),
    ];

    singleton_counter_family(
        EXPORTER_ERROR_FAMILY,
        "Promfetcher scrape external exporter error on your instance",
        labels,
    )
}

fn singleton_counter_family(
    name: &str,
    help: &str,
    labels: Vec<(String, String)>,
) -> MetricFamilies {
    let mut families = MetricFamilies::new();
    families.insert(
        name.to_string(),
        MetricFamily {
            name: name.to_string(),
            help: Some(help.to_string()),
            kind: FamilyKind::Counter,
            metrics: vec![MetricPoint {
                name: name.to_string(),
                labels,
                value: 1.0,
            }],
        },
    );
    families
}

/// Render families in text exposition format.
pub fn encode_families(families: &MetricFamilies) -> String {
    let mut out = String::new();
    for family in families.values() {
        if let Some(help) = &family.help {
            let _ = writeln!(out, "# HELP {} {}", family.name, help);
        }
        let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind.as_str());
        for point in &family.metrics {
            if point.labels.is_empty() {
                let _ = writeln!(out, "{} {}", point.name, fmt_value(point.value));
            } else {
                let labels = point
                    .labels
                    .iter()
                    .map(|(name, value)| format!("{name}=\"{}\"", escape_label(value)))
                    .collect::<Vec<_>>()
                    .join(",");
                let _ = writeln!(out, "{}{{{labels}}} {}", point.name, fmt_value(point.value));
            }
        }
    }
    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn fmt_value(value: f64) -> String {
    if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{value}")
    }
}
