use super::*;

use prometheus::Registry;
use serde_json::json;

fn register_payload(host: &str, app_id: &str, uris: &[&str]) -> Bytes {
    serde_json::to_vec(&json!({
        "app": app_id,
        "host": host,
        "port": 8080,
        "tls_port": 0,
        "private_instance_id": format!("{host}-instance"),
        "server_cert_domain_san": "",
        "route_service_url": "",
        "stale_threshold_in_seconds": 120,
        "tags": {
            "process_type": "web",
            "instance_id": "0",
            "organization_name": "myorg",
            "space_name": "myspace",
            "app_name": "myapp",
            "app_id": app_id,
        },
        "uris": uris,
    }))
    .unwrap()
    .into()
}

fn updater(routes: Arc<Routes>) -> (RoutesUpdater, mpsc::Sender<RawEvent>, Arc<FetchMetrics>) {
    let metrics = Arc::new(FetchMetrics::new(&Registry::new()));
    let (tx, rx) = mpsc::channel(16);
    let updater = RoutesUpdater::new(routes, rx, Arc::clone(&metrics));
    (updater, tx, metrics)
}

#[test]
fn test_decode_register_event() {
    let payload = register_payload("app.example.com", "some-app-guid", &["app.example.com"]);
    let event = RouteEvent::decode(&payload).unwrap();

    assert_eq!(event.host, "app.example.com");
    assert_eq!(event.tags.app_id, "some-app-guid");
    assert_eq!(event.uris, vec!["app.example.com"]);

    let route = event.to_route();
    assert_eq!(route.address, "app.example.com:8080");
    assert!(!route.tls);
    assert_eq!(route.ttl, 120);
}

#[test]
fn test_to_route_prefers_tls_port() {
    let payload = serde_json::to_vec(&json!({
        "host": "app.example.com",
        "port": 8080,
        "tls_port": 8443,
        "tags": {"app_id": "some-app-guid"},
        "uris": ["app.example.com"],
    }))
    .unwrap();

    let route = RouteEvent::decode(&payload).unwrap().to_route();
    assert_eq!(route.address, "app.example.com:8443");
    assert!(route.tls);
}

#[test]
fn test_insecure_route_service_url_is_rejected() {
    let payload = serde_json::to_vec(&json!({
        "host": "app.example.com",
        "port": 8080,
        "route_service_url": "http://route-service.example.com",
        "tags": {"app_id": "some-app-guid"},
        "uris": ["app.example.com"],
    }))
    .unwrap();

    assert!(matches!(
        RouteEvent::decode(&payload),
        Err(EventError::InsecureRouteService)
    ));

    let secure = serde_json::to_vec(&json!({
        "host": "app.example.com",
        "port": 8080,
        "route_service_url": "https://route-service.example.com",
        "tags": {"app_id": "some-app-guid"},
        "uris": ["app.example.com"],
    }))
    .unwrap();
    assert!(RouteEvent::decode(&secure).is_ok());
}

#[test]
fn test_undecodable_payload_is_rejected() {
    assert!(matches!(
        RouteEvent::decode(b"not json"),
        Err(EventError::Decode(_))
    ));
}

#[test]
fn test_apply_register_and_unregister() {
    let routes = Arc::new(Routes::new());
    let (updater, _tx, _metrics) = updater(Arc::clone(&routes));

    let payload = register_payload("app.example.com", "some-app-guid", &["app.example.com"]);
    updater.apply(RawEvent {
        kind: EventKind::Register,
        payload: payload.clone(),
    });
    assert_eq!(routes.find_by_route_name("app.example.com").len(), 1);

    // Duplicate register is idempotent.
    updater.apply(RawEvent {
        kind: EventKind::Register,
        payload: payload.clone(),
    });
    assert_eq!(routes.find_by_route_name("app.example.com").len(), 1);

    updater.apply(RawEvent {
        kind: EventKind::Unregister,
        payload,
    });
    assert!(routes.find_by_route_name("app.example.com").is_empty());
}

#[test]
fn test_apply_registers_every_uri() {
    let routes = Arc::new(Routes::new());
    let (updater, _tx, _metrics) = updater(Arc::clone(&routes));

    updater.apply(RawEvent {
        kind: EventKind::Register,
        payload: register_payload(
            "app.example.com",
            "some-app-guid",
            &["app.example.com", "alias.example.com/path"],
        ),
    });

    assert_eq!(routes.find_by_route_name("app.example.com").len(), 1);
    assert_eq!(routes.find_by_route_name("alias.example.com").len(), 1);
}

#[test]
fn test_apply_drops_malformed_event() {
    let routes = Arc::new(Routes::new());
    let (updater, _tx, metrics) = updater(Arc::clone(&routes));

    updater.apply(RawEvent {
        kind: EventKind::Register,
        payload: Bytes::from_static(b"{broken"),
    });

    assert!(routes.snapshot().is_empty());
    assert_eq!(metrics.route_update_failed.get(), 1);
}

#[test]
fn test_apply_drops_non_app_event() {
    let routes = Arc::new(Routes::new());
    let (updater, _tx, _metrics) = updater(Arc::clone(&routes));

    updater.apply(RawEvent {
        kind: EventKind::Register,
        payload: serde_json::to_vec(&json!({
            "host": "router.internal",
            "port": 8080,
            "tags": {"component": "gorouter"},
            "uris": ["router.internal"],
        }))
        .unwrap()
        .into(),
    });

    assert!(routes.snapshot().is_empty());
}

#[tokio::test]
async fn test_updater_consumes_channel() {
    let routes = Arc::new(Routes::new());
    let (updater, tx, _metrics) = updater(Arc::clone(&routes));
    tokio::spawn(updater.run());

    tx.send(RawEvent {
        kind: EventKind::Register,
        payload: register_payload("app.example.com", "some-app-guid", &["app.example.com"]),
    })
    .await
    .unwrap();

    for _ in 0..100 {
        if !routes.find_by_route_name("app.example.com").is_empty() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("route never registered from the event stream");
}

#[test]
fn test_load_seed() {
    let path = std::env::temp_dir().join("promfetcher-seed-test.yml");
    std::fs::write(
        &path,
        r#"
- host: app.example.com
  port: 8080
  tags:
    process_type: web
    app_id: some-app-guid
  uris:
    - app.example.com
"#,
    )
    .unwrap();

    let seed = load_seed(&path).unwrap();
    assert_eq!(seed.len(), 1);
    assert_eq!(seed[0].kind, EventKind::Register);

    let event = RouteEvent::decode(&seed[0].payload).unwrap();
    assert_eq!(event.host, "app.example.com");

    std::fs::remove_file(&path).ok();
}
