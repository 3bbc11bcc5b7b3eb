//! End-to-end tests driving the HTTP facade over a mock device.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;

use pdubridge::auth::SessionStore;
use pdubridge::http::{AppState, create_router};
use pdubridge_common::{BridgeSettings, DeviceConfig};
use pdubridge_core::history::{BankSample, HistoryStore, Sample};
use pdubridge_core::manager::BridgeManager;
use pdubridge_core::mqtt::{MqttLink, MqttSettings};
use pdubridge_core::persist::DataDir;

struct TestBridge {
    router: Router,
    manager: Arc<BridgeManager>,
    _dir: tempfile::TempDir,
}

async fn bridge_with(settings: BridgeSettings) -> TestBridge {
    let dir = tempfile::tempdir().unwrap();
    let data = DataDir::new(dir.path()).unwrap();
    let history = Arc::new(HistoryStore::open(dir.path().join("history.db")).unwrap());
    let mqtt = MqttLink::new(&MqttSettings::default());

    let manager = BridgeManager::start(
        vec![DeviceConfig::mock("pdu44001")],
        settings,
        mqtt,
        history,
        data,
        None,
    )
    .await
    .unwrap();

    let router = create_router(AppState {
        manager: manager.clone(),
        sessions: Arc::new(SessionStore::new()),
    });

    TestBridge {
        router,
        manager,
        _dir: dir,
    }
}

async fn bridge() -> TestBridge {
    bridge_with(BridgeSettings::default()).await
}

async fn wait_for_snapshot(manager: &Arc<BridgeManager>) {
    for _ in 0..300 {
        if manager
            .status(Some("pdu44001"))
            .map(|s| !s["outlets"].as_object().map(|o| o.is_empty()).unwrap_or(true))
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("mock device never produced a snapshot");
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_outlet_command_roundtrip() {
    let bridge = bridge().await;
    wait_for_snapshot(&bridge.manager).await;

    let (status, body) = send(
        &bridge.router,
        json_request(
            "POST",
            "/api/outlets/3/command",
            serde_json::json!({ "action": "off" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    // Within one poll cycle the status endpoint reflects the new state.
    let mut state = serde_json::Value::Null;
    for _ in 0..300 {
        let (_, body) = send(&bridge.router, get("/api/status")).await;
        state = body["outlets"]["3"]["state"].clone();
        if state == "off" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, "off");

    bridge.manager.shutdown().await;
}

#[tokio::test]
async fn test_outlet_command_validation() {
    let bridge = bridge().await;
    wait_for_snapshot(&bridge.manager).await;

    let (status, _) = send(
        &bridge.router,
        json_request(
            "POST",
            "/api/outlets/3/command",
            serde_json::json!({ "action": "bounce" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Out-of-range outlet executes the command path and reports failure.
    let (status, body) = send(
        &bridge.router,
        json_request(
            "POST",
            "/api/outlets/99/command",
            serde_json::json!({ "action": "off" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);

    bridge.manager.shutdown().await;
}

#[tokio::test]
async fn test_health_endpoint_reports_issues() {
    let bridge = bridge().await;
    wait_for_snapshot(&bridge.manager).await;

    // No broker is running in tests, so the bridge is degraded.
    let (status, body) = send(&bridge.router, get("/api/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert!(
        body["issues"]
            .as_array()
            .unwrap()
            .iter()
            .any(|i| i == "MQTT disconnected")
    );

    bridge.manager.shutdown().await;
}

#[tokio::test]
async fn test_rule_lifecycle_over_http() {
    let bridge = bridge().await;
    wait_for_snapshot(&bridge.manager).await;

    let rule = serde_json::json!({
        "name": "low",
        "input": 1,
        "condition": "voltage_below",
        "threshold": 100,
        "outlet": 5,
        "action": "off",
        "restore": true,
        "delay": 5,
    });

    let (status, _) = send(&bridge.router, json_request("POST", "/api/rules", rule.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    // Duplicate name conflicts.
    let (status, _) = send(&bridge.router, json_request("POST", "/api/rules", rule)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&bridge.router, get("/api/rules")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["name"], "low");

    let (status, body) = send(
        &bridge.router,
        json_request("PUT", "/api/rules/low/toggle", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);

    let (status, _) = send(
        &bridge.router,
        Request::delete("/api/rules/low").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&bridge.router, get("/api/rules")).await;
    assert!(body.as_array().unwrap().is_empty());

    // The events trail recorded the lifecycle.
    let (_, body) = send(&bridge.router, get("/api/events")).await;
    let events = body["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e["type"] == "created"));
    assert!(events.iter().any(|e| e["type"] == "deleted"));

    bridge.manager.shutdown().await;
}

#[tokio::test]
async fn test_rule_bad_outlet_spec_rejected() {
    let bridge = bridge().await;
    wait_for_snapshot(&bridge.manager).await;

    let rule = serde_json::json!({
        "name": "bad",
        "condition": "voltage_below",
        "threshold": 100,
        "outlet": "0",
        "action": "off",
    });

    let (status, _) = send(&bridge.router, json_request("POST", "/api/rules", rule)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    bridge.manager.shutdown().await;
}

#[tokio::test]
async fn test_history_downsampling_over_http() {
    let bridge = bridge().await;
    wait_for_snapshot(&bridge.manager).await;

    // An hour of 1 Hz bank samples, ending now.
    let now = pdubridge_common::model::current_timestamp_millis();
    let base = now - 3600 * 1000;
    let mut samples = Vec::new();
    for i in 0..3600 {
        samples.push(Sample::Bank(BankSample {
            ts: base + i * 1000,
            device_id: "pdu44001".to_string(),
            bank: 1,
            voltage: Some(230.0),
            current: 5.0,
            power: Some(1150.0),
            apparent: None,
            pf: Some(0.98),
        }));
    }
    bridge.manager.history().append(samples);
    bridge.manager.history().flush().unwrap();

    // 1 h range: raw resolution. The live poller keeps appending and the
    // query window slides between insert and request, so allow a skew of a
    // few seconds around the 3600 inserted samples.
    let (status, body) = send(&bridge.router, get("/api/history/banks?range=1h")).await;
    assert_eq!(status, StatusCode::OK);
    let raw_points = body["points"].as_array().unwrap().len();
    assert!(raw_points >= 3590, "expected raw resolution, got {}", raw_points);

    // 24 h range: 60 s buckets, at most 1440 points.
    let (status, body) = send(&bridge.router, get("/api/history/banks?range=24h")).await;
    assert_eq!(status, StatusCode::OK);
    let points = body["points"].as_array().unwrap();
    assert!(points.len() <= 1440);
    let spans: Vec<i64> = points
        .windows(2)
        .map(|w| w[1]["bucket"].as_i64().unwrap() - w[0]["bucket"].as_i64().unwrap())
        .collect();
    assert!(spans.iter().all(|s| *s == 60_000));

    // CSV variant.
    let response = bridge
        .router
        .clone()
        .oneshot(get("/api/history/banks.csv?range=24h"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("text/csv")
    );

    // Missing window parameters are a client error.
    let (status, _) = send(&bridge.router, get("/api/history/banks")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    bridge.manager.shutdown().await;
}

#[tokio::test]
async fn test_hot_add_and_remove_over_http() {
    let bridge = bridge().await;
    wait_for_snapshot(&bridge.manager).await;

    let (status, body) = send(
        &bridge.router,
        json_request(
            "POST",
            "/api/pdus",
            serde_json::json!({ "device_id": "second", "transport": "mock" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["device_id"], "second");
    assert_eq!(bridge.manager.device_ids(), vec!["pdu44001", "second"]);

    // Forbidden characters in the id are rejected.
    let (status, _) = send(
        &bridge.router,
        json_request(
            "POST",
            "/api/pdus",
            serde_json::json!({ "device_id": "bad/id", "transport": "mock" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &bridge.router,
        Request::delete("/api/pdus/second").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bridge.manager.device_ids(), vec!["pdu44001"]);

    let (status, _) = send(
        &bridge.router,
        Request::delete("/api/pdus/second").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    bridge.manager.shutdown().await;
}

#[tokio::test]
async fn test_auth_gates_mutations_only() {
    let settings = BridgeSettings {
        web_password: Some("hunter2".to_string()),
        ..BridgeSettings::default()
    };
    let bridge = bridge_with(settings).await;
    wait_for_snapshot(&bridge.manager).await;

    // Mutations are gated.
    let (status, _) = send(
        &bridge.router,
        json_request(
            "POST",
            "/api/outlets/1/command",
            serde_json::json!({ "action": "off" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Health and status never are.
    let response = bridge.router.clone().oneshot(get("/api/health")).await.unwrap();
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    let (status, _) = send(&bridge.router, get("/api/status")).await;
    assert_eq!(status, StatusCode::OK);

    // Wrong password is refused.
    let (status, _) = send(
        &bridge.router,
        json_request(
            "POST",
            "/api/auth/login",
            serde_json::json!({ "password": "nope" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Login, then replay the mutation with the session cookie.
    let response = bridge
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            serde_json::json!({ "password": "hunter2" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let request = Request::builder()
        .method("POST")
        .uri("/api/outlets/1/command")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, cookie)
        .body(Body::from(
            serde_json::json!({ "action": "off" }).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&bridge.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    bridge.manager.shutdown().await;
}

#[tokio::test]
async fn test_management_endpoints_on_mock() {
    let bridge = bridge().await;
    wait_for_snapshot(&bridge.manager).await;

    let (status, body) = send(&bridge.router, get("/api/management/thresholds")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["bank"], 1);

    let (status, body) = send(&bridge.router, get("/api/management/security/check")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["default_credentials"], true);

    let (status, body) = send(&bridge.router, get("/api/management/users")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["username"], "cyber");

    bridge.manager.shutdown().await;
}

#[tokio::test]
async fn test_reports_empty_and_config_roundtrip() {
    let bridge = bridge().await;
    wait_for_snapshot(&bridge.manager).await;

    let (status, body) = send(&bridge.router, get("/api/reports")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["reports"].as_array().unwrap().is_empty());

    let (status, _) = send(&bridge.router, get("/api/reports/latest")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&bridge.router, get("/api/config")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["poll_interval_ms"], 1000);

    // Poll interval below 1 s is rejected.
    let (status, _) = send(
        &bridge.router,
        json_request(
            "PUT",
            "/api/config",
            serde_json::json!({ "poll_interval_ms": 200 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &bridge.router,
        json_request(
            "PUT",
            "/api/config",
            serde_json::json!({ "poll_interval_ms": 2000 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bridge.manager.settings().poll_interval_ms, 2000);

    bridge.manager.shutdown().await;
}
