use axum_test::TestServer;
use ferry_core::config::model::{
    AffinityConfig, ClusterConfig, Config, EndpointConfig, FailMode, GlobalSettings,
    HealthCheckConfig, PoolConfig, PoolKind, ProbeKind, RoutingStrategy, ServiceRoute,
};
use ferry_gateway::{create_app, AppState};
use ferry_routing::RoutingService;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn create_test_config() -> Config {
    let mut services = HashMap::new();
    services.insert(
        "orders".to_string(),
        ServiceRoute {
            name: "orders".to_string(),
            enabled: true,
            strategy: RoutingStrategy::RoundRobin,
            canary: None,
            affinity: AffinityConfig::default(),
            fail_mode: FailMode::FailClosed,
            clusters: vec![ClusterConfig {
                name: "local".to_string(),
                priority: 0,
                weight: 1,
                health: HealthCheckConfig {
                    probe: ProbeKind::Passive,
                    ..HealthCheckConfig::default()
                },
                pools: vec![PoolConfig {
                    kind: PoolKind::Stable,
                    strategy: None,
                    endpoints: vec![
                        EndpointConfig {
                            address: "10.0.0.1:80".to_string(),
                            weight: 1,
                            priority: 0,
                            enabled: true,
                        },
                        EndpointConfig {
                            address: "10.0.0.2:80".to_string(),
                            weight: 1,
                            priority: 0,
                            enabled: true,
                        },
                    ],
                }],
            }],
        },
    );

    Config {
        services,
        settings: GlobalSettings::default(),
    }
}

fn test_server() -> TestServer {
    let router =
        Arc::new(RoutingService::new(create_test_config()).expect("service construction"));
    let app = create_app(AppState { router });
    TestServer::new(app).expect("test server")
}

#[tokio::test]
async fn test_select_returns_endpoint() {
    let server = test_server();

    let response = server
        .post("/v1/select")
        .json(&json!({
            "service": "orders",
            "client_ip": "203.0.113.10",
        }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["cluster"], "local");
    assert!(body["address"]
        .as_str()
        .expect("address is a string")
        .starts_with("10.0.0."));
    assert_eq!(body["pool"], "stable");
}

#[tokio::test]
async fn test_select_unknown_service_is_404() {
    let server = test_server();

    let response = server
        .post("/v1/select")
        .json(&json!({ "service": "ghost" }))
        .await;

    response.assert_status_not_found();
    let body: Value = response.json();
    assert!(body["error"]
        .as_str()
        .expect("error is a string")
        .contains("not found"));
}

#[tokio::test]
async fn test_outcome_feedback_drives_selection() {
    let server = test_server();

    // 把10.0.0.1:80打到Unhealthy（N=4）
    for _ in 0..4 {
        let response = server
            .post("/v1/outcome")
            .json(&json!({
                "endpoint": "local:10.0.0.1:80",
                "success": false,
                "error": "connection refused",
            }))
            .await;
        response.assert_status_ok();
    }

    // 之后的选择只会落在另一个端点上
    for _ in 0..5 {
        let response = server
            .post("/v1/select")
            .json(&json!({ "service": "orders" }))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["address"], "10.0.0.2:80");
    }
}

#[tokio::test]
async fn test_exhausted_service_is_503() {
    let server = test_server();

    for endpoint in ["local:10.0.0.1:80", "local:10.0.0.2:80"] {
        for _ in 0..4 {
            server
                .post("/v1/outcome")
                .json(&json!({
                    "endpoint": endpoint,
                    "success": false,
                    "error": "connection refused",
                }))
                .await;
        }
    }

    let response = server
        .post("/v1/select")
        .json(&json!({ "service": "orders" }))
        .await;
    response.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_and_monitoring_endpoints() {
    let server = test_server();

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");

    let response = server.get("/monitoring").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert!(body["services"]
        .as_array()
        .expect("services is an array")
        .iter()
        .any(|entry| entry["service"] == "orders"));

    let response = server.get("/monitoring/affinity").await;
    response.assert_status_ok();
}
