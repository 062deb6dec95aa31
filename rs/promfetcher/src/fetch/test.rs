use super::*;

use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use prometheus::Registry;

use crate::{
    endpoints::StaticEndpointStore,
    families::{EXPORTER_ERROR_FAMILY, SCRAPE_ERROR_FAMILY},
    http::ScrapeBackend,
    routes::PROCESS_WEB,
};

const APP1: &str = "a758f25d-2d01-419e-b63b-de3aabcd9e15";

/// Serves canned responses keyed by route address and records the headers
/// each address was scraped with.
#[derive(Default)]
struct RoutedBackend {
    responses: HashMap<String, (u16, String)>,
    seen_headers: Mutex<HashMap<String, Vec<String>>>,
}

impl RoutedBackend {
    fn with(mut self, address: &str, status: u16, body: &str) -> Self {
        self.responses
            .insert(address.to_string(), (status, body.to_string()));
        self
    }

    fn header_names(&self, address: &str) -> Vec<String> {
        self.seen_headers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ScrapeBackend for RoutedBackend {
    async fn execute(
        &self,
        route: &Route,
        req: reqwest::Request,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.seen_headers.lock().unwrap().insert(
            route.address.clone(),
            req.headers().keys().map(|name| name.to_string()).collect(),
        );

        let (status, body) = self
            .responses
            .get(&route.address)
            .cloned()
            .unwrap_or((500, String::new()));

        Ok(reqwest::Response::from(
            ::http::Response::builder()
                .status(status)
                .body(body.into_bytes())
                .unwrap(),
        ))
    }
}

fn web_route(address: &str, instance_id: &str) -> Route {
    Route {
        address: address.to_string(),
        host: "myapp.example.com".to_string(),
        tags: Tags {
            process_type: PROCESS_WEB.to_string(),
            organization_id: "org-guid".to_string(),
            organization_name: "myorg".to_string(),
            space_id: "space-guid".to_string(),
            space_name: "myspace".to_string(),
            app_id: APP1.to_string(),
            app_name: "myapp".to_string(),
            instance_id: instance_id.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn exporter(name: &str, host: &str) -> ExternalExporter {
    serde_yaml::from_str(&format!("name: {name}\nhost: {host}\n")).unwrap()
}

fn fetcher(
    routes: Arc<Routes>,
    backend: Arc<RoutedBackend>,
    external_exporters: Vec<ExternalExporter>,
) -> (MetricsFetcher, Arc<FetchMetrics>) {
    let metrics = Arc::new(FetchMetrics::new(&Registry::new()));
    let scraper = Arc::new(Scraper::new(
        backend,
        Arc::new(StaticEndpointStore::default()),
        Duration::from_secs(30),
    ));
    let fetcher = MetricsFetcher::new(
        scraper,
        routes,
        external_exporters,
        Arc::clone(&metrics),
        5,
    );
    (fetcher, metrics)
}

fn label<'a>(point: &'a crate::families::MetricPoint, name: &str) -> Option<&'a str> {
    point
        .labels
        .iter()
        .find(|(label_name, _)| label_name == name)
        .map(|(_, value)| value.as_str())
}

#[tokio::test]
async fn test_single_instance_success_is_relabeled() {
    let routes = Arc::new(Routes::new());
    routes.register("myapp.example.com", web_route("10.0.1.2:8080", "0"));

    let backend = Arc::new(RoutedBackend::default().with(
        "10.0.1.2:8080",
        200,
        "# TYPE foo counter\nfoo 1\n",
    ));
    let (fetcher, metrics) = fetcher(Arc::clone(&routes), backend, vec![]);

    let found = fetcher.metrics(APP1, "/metrics", false, None).await.unwrap();

    assert!(!found.contains_key(SCRAPE_ERROR_FAMILY));
    let foo = &found["foo"];
    assert_eq!(foo.metrics.len(), 1);

    let point = &foo.metrics[0];
    assert_eq!(point.value, 1.0);
    assert_eq!(label(point, "organization_name"), Some("myorg"));
    assert_eq!(label(point, "space_name"), Some("myspace"));
    assert_eq!(label(point, "app_name"), Some("myapp"));
    assert_eq!(label(point, "app_id"), Some(APP1));
    assert_eq!(label(point, "index"), Some("0"));
    assert_eq!(label(point, "instance_id"), Some("0"));
    assert_eq!(label(point, "instance"), Some("10.0.1.2:8080"));

    assert_eq!(
        metrics
            .fetch_success
            .with_label_values(&["org-guid", "space-guid", APP1, "myorg", "myspace", "myapp"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_unknown_identifier_is_no_app_found() {
    let routes = Arc::new(Routes::new());
    let backend = Arc::new(RoutedBackend::default());
    let (fetcher, _metrics) = fetcher(routes, backend, vec![]);

    let err = fetcher
        .metrics("unknown", "/metrics", false, None)
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::NoAppFound(_)));
    assert_eq!(err.status_code().as_u16(), 404);
}

#[tokio::test]
async fn test_single_target_failure_surfaces_whole_call() {
    let routes = Arc::new(Routes::new());
    routes.register("myapp.example.com", web_route("10.0.1.2:8080", "0"));

    let backend = Arc::new(RoutedBackend::default().with("10.0.1.2:8080", 503, ""));
    let (fetcher, _metrics) = fetcher(Arc::clone(&routes), backend, vec![]);

    let err = fetcher
        .metrics(APP1, "/metrics", false, None)
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Transport(_)));
}

#[tokio::test]
async fn test_partial_failure_downgrades_with_exporters_configured() {
    let routes = Arc::new(Routes::new());
    routes.register("myapp.example.com", web_route("10.0.1.2:8080", "0"));
    routes.register("myapp.example.com", web_route("10.0.1.3:8080", "1"));

    let backend = Arc::new(
        RoutedBackend::default()
            .with("10.0.1.2:8080", 200, "# TYPE foo counter\nfoo 1\n")
            .with("10.0.1.3:8080", 500, "")
            .with("exporter.internal:9117", 200, "# TYPE bar gauge\nbar 2\n"),
    );
    let (fetcher, metrics) = fetcher(
        Arc::clone(&routes),
        backend,
        vec![exporter("node", "exporter.internal:9117")],
    );

    let found = fetcher.metrics(APP1, "/metrics", false, None).await.unwrap();

    // The healthy instance and the exporter both contribute.
    assert_eq!(found["foo"].metrics.len(), 1);
    assert_eq!(found["bar"].metrics.len(), 1);

    // The failed instance is reported as a synthetic sample.
    let errors = &found[SCRAPE_ERROR_FAMILY];
    assert_eq!(errors.metrics.len(), 1);
    assert_eq!(label(&errors.metrics[0], "instance"), Some("10.0.1.3:8080"));
    assert!(label(&errors.metrics[0], "error")
        .unwrap()
        .contains("server returned HTTP status 500"));

    assert_eq!(
        metrics
            .fetch_failed
            .with_label_values(&[
                "org-guid",
                "space-guid",
                APP1,
                "myorg",
                "myspace",
                "myapp",
                "1",
                "1",
            ])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_exporter_scrape_has_no_instance_labels_and_no_headers() {
    let routes = Arc::new(Routes::new());
    routes.register("myapp.example.com", web_route("10.0.1.2:8080", "0"));

    let backend = Arc::new(
        RoutedBackend::default()
            .with("10.0.1.2:8080", 200, "foo 1\n")
            .with("exporter.internal:9117", 200, "bar 2\n"),
    );
    let (fetcher, _metrics) = fetcher(
        Arc::clone(&routes),
        Arc::clone(&backend),
        vec![exporter("node", "exporter.internal:9117")],
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        ::http::header::AUTHORIZATION,
        ::http::HeaderValue::from_static("bearer token"),
    );

    let found = fetcher
        .metrics(APP1, "/metrics", false, Some(headers))
        .await
        .unwrap();

    let bar = &found["bar"].metrics[0];
    assert_eq!(label(bar, "app_name"), Some("myapp"));
    assert_eq!(label(bar, "instance"), None);
    assert_eq!(label(bar, "instance_id"), None);

    assert!(backend
        .header_names("10.0.1.2:8080")
        .contains(&"authorization".to_string()));
    assert!(!backend
        .header_names("exporter.internal:9117")
        .contains(&"authorization".to_string()));
}

#[tokio::test]
async fn test_only_app_metrics_skips_exporters() {
    let routes = Arc::new(Routes::new());
    routes.register("myapp.example.com", web_route("10.0.1.2:8080", "0"));

    let backend = Arc::new(RoutedBackend::default().with("10.0.1.2:8080", 200, "foo 1\n"));
    let (fetcher, _metrics) = fetcher(
        Arc::clone(&routes),
        backend,
        vec![exporter("node", "exporter.internal:9117")],
    );

    let found = fetcher.metrics(APP1, "/metrics", true, None).await.unwrap();

    assert!(found.contains_key("foo"));
    assert!(!found.contains_key("bar"));
    assert!(!found.contains_key(SCRAPE_ERROR_FAMILY));
}

#[tokio::test]
async fn test_exporter_template_failure_is_downgraded() {
    let routes = Arc::new(Routes::new());
    routes.register("myapp.example.com", web_route("10.0.1.2:8080", "0"));

    let broken: ExternalExporter = serde_yaml::from_str(
        "name: broken\nhost: exporter.internal:9117\nparams:\n  target:\n    - \"{nope}\"\n",
    )
    .unwrap();

    let backend = Arc::new(RoutedBackend::default().with("10.0.1.2:8080", 200, "foo 1\n"));
    let (fetcher, _metrics) = fetcher(Arc::clone(&routes), backend, vec![broken]);

    let found = fetcher.metrics(APP1, "/metrics", false, None).await.unwrap();

    assert!(found.contains_key("foo"));

    let errors = &found[EXPORTER_ERROR_FAMILY];
    assert_eq!(errors.metrics.len(), 1);
    assert_eq!(label(&errors.metrics[0], "name"), Some("broken"));
    assert!(label(&errors.metrics[0], "error")
        .unwrap()
        .contains("unknown template field"));
}

#[tokio::test]
async fn test_duplicate_samples_across_instances_are_kept() {
    let routes = Arc::new(Routes::new());
    routes.register("myapp.example.com", web_route("10.0.1.2:8080", "0"));
    routes.register("myapp.example.com", web_route("10.0.1.3:8080", "1"));

    let backend = Arc::new(
        RoutedBackend::default()
            .with("10.0.1.2:8080", 200, "foo 1\n")
            .with("10.0.1.3:8080", 200, "foo 1\n"),
    );
    let (fetcher, _metrics) = fetcher(Arc::clone(&routes), backend, vec![]);

    let found = fetcher.metrics(APP1, "/metrics", false, None).await.unwrap();

    let foo = &found["foo"];
    assert_eq!(foo.metrics.len(), 2);

    let mut instances: Vec<_> = foo
        .metrics
        .iter()
        .filter_map(|point| label(point, "instance"))
        .collect();
    instances.sort();
    assert_eq!(instances, vec!["10.0.1.2:8080", "10.0.1.3:8080"]);
}
