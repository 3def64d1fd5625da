//! Admin API integration tests
//!
//! Runs the router on an ephemeral port and drives it with reqwest.

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use minifw::api::{self, AppState};
use minifw::control::ControlHandler;
use minifw::store::RuleStore;

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    rules: usize,
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    verdict: String,
    rule_index: Option<usize>,
}

/// Test fixture serving the admin API on 127.0.0.1
struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    handler: Arc<ControlHandler>,
    base_url: String,
}

impl TestServer {
    async fn start(capacity: Option<usize>, allowed_ips: &[&str]) -> Self {
        let store = Arc::new(RuleStore::new(capacity));
        let handler = Arc::new(ControlHandler::new(store));
        let allowed: Vec<String> = allowed_ips.iter().map(|s| s.to_string()).collect();
        let app = api::router(Arc::new(AppState::new(handler.clone())), &allowed);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            let _ = axum::serve(listener, service).await;
        });

        Self {
            handle,
            handler,
            base_url: format!("http://{}", addr),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn ssh_block() -> serde_json::Value {
    json!({
        "direction": "inbound",
        "dst_addr": "10.0.0.5",
        "dst_mask": "255.255.255.255",
        "dst_port": 22,
        "protocol": 6
    })
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start(Some(8), &[]).await;
    let resp = reqwest::get(server.url("/api/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let health: HealthResponse = resp.json().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.rules, 0);
    assert_eq!(health.capacity, Some(8));
}

#[tokio::test]
async fn test_add_list_remove_rules() {
    let server = TestServer::start(None, &[]).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/api/rules"))
        .json(&ssh_block())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(server.handler.store().len(), 1);

    let rules: Vec<serde_json::Value> = reqwest::get(server.url("/api/rules"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0]["dst_addr"], "10.0.0.5");
    assert_eq!(rules[0]["src_addr"], "0.0.0.0");
    assert_eq!(rules[0]["dst_port"], 22);

    let resp = client
        .delete(server.url("/api/rules"))
        .json(&ssh_block())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = client
        .delete(server.url("/api/rules"))
        .json(&ssh_block())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(server.handler.store().is_empty());
}

#[tokio::test]
async fn test_rule_errors() {
    let server = TestServer::start(Some(1), &[]).await;
    let client = reqwest::Client::new();

    let mut bad = ssh_block();
    bad["protocol"] = json!(1);
    let resp = client.post(server.url("/api/rules")).json(&bad).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client.post(server.url("/api/rules")).json(&ssh_block()).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = client.post(server.url("/api/rules")).json(&ssh_block()).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(server.handler.store().len(), 1);
}

#[tokio::test]
async fn test_check_verdicts() {
    let server = TestServer::start(None, &[]).await;
    let client = reqwest::Client::new();
    client.post(server.url("/api/rules")).json(&ssh_block()).send().await.unwrap();

    let packet = json!({
        "hook": "ingress",
        "src_addr": "192.0.2.7",
        "dst_addr": "10.0.0.5",
        "src_port": 40000,
        "dst_port": 22,
        "protocol": 6
    });
    let check: CheckResponse = client
        .post(server.url("/api/check"))
        .json(&packet)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(check.verdict, "drop");
    assert_eq!(check.rule_index, Some(0));

    // Same packet leaving the host is not covered by an inbound rule.
    let mut outbound = packet.clone();
    outbound["hook"] = json!("egress");
    let check: CheckResponse = client
        .post(server.url("/api/check"))
        .json(&outbound)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(check.verdict, "accept");
    assert_eq!(check.rule_index, None);
}

#[tokio::test]
async fn test_metrics_track_control_requests() {
    let server = TestServer::start(Some(1), &[]).await;
    let client = reqwest::Client::new();
    client.post(server.url("/api/rules")).json(&ssh_block()).send().await.unwrap();
    client.post(server.url("/api/rules")).json(&ssh_block()).send().await.unwrap();

    let body = reqwest::get(server.url("/metrics")).await.unwrap().text().await.unwrap();
    assert!(body.contains("minifw_rules 1"));
    assert!(body.contains("minifw_control_requests_total 2"));
    assert!(body.contains("minifw_control_errors_total 1"));
}

#[tokio::test]
async fn test_allowlist_refuses_other_peers() {
    let server = TestServer::start(None, &["10.0.0.0/8"]).await;
    let resp = reqwest::get(server.url("/api/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let server = TestServer::start(None, &["127.0.0.0/8"]).await;
    let resp = reqwest::get(server.url("/api/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
