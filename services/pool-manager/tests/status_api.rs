//! Status API integration tests.
//!
//! Serves the router on an ephemeral port and drives it over real HTTP.

use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use vpnpool_manager::{
    api,
    directory::{Directory, StaticDirectory},
    orchestrator::{OrchestratorConfig, PoolOrchestrator},
    runtime::MockRuntime,
    state::AppState,
};
use vpnpool_reconcile::PoolLayout;

struct StatusTestHarness {
    base_url: String,
    client: reqwest::Client,
    orchestrator: Arc<PoolOrchestrator>,
}

impl StatusTestHarness {
    async fn new(capacity: usize, directory: Arc<dyn Directory>) -> Self {
        let layout = PoolLayout::new(capacity, 8881, "nord-vpn-").unwrap();
        let runtime = Arc::new(MockRuntime::new(layout.clone()));
        let orchestrator = Arc::new(PoolOrchestrator::new(
            runtime,
            Arc::clone(&directory),
            OrchestratorConfig {
                layout,
                ..OrchestratorConfig::default()
            },
        ));

        let app = api::create_router(AppState::new(Arc::clone(&orchestrator), directory));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            orchestrator,
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }
}

#[tokio::test]
async fn test_index_reports_running() {
    let h = StatusTestHarness::new(2, Arc::new(StaticDirectory::default())).await;

    let (status, body) = h.get("/").await;

    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["message"], "VPN pool manager is running");
}

#[tokio::test]
async fn test_ports_follow_active_pool() {
    let directory = Arc::new(StaticDirectory::new(["de1", "de2", "de3"]));
    let h = StatusTestHarness::new(3, directory).await;

    let (_, before) = h.get("/ports").await;
    assert_eq!(before, serde_json::json!([]));

    h.orchestrator.rotate().await;

    let (status, after) = h.get("/ports").await;
    assert_eq!(status, 200);
    assert_eq!(after, serde_json::json!([8881, 8882, 8883]));
}

#[tokio::test]
async fn test_slots_expose_endpoints() {
    let directory = Arc::new(StaticDirectory::new(["de1", "de2"]));
    let h = StatusTestHarness::new(2, directory).await;
    h.orchestrator.rotate().await;

    let (status, body) = h.get("/slots").await;

    assert_eq!(status, 200);
    let slots = body.as_array().unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["name"], "nord-vpn-0");
    assert_eq!(slots[1]["port"], 8882);
    assert!(slots[0]["container_id"].as_str().unwrap().starts_with("ctr_"));
    let endpoint = slots[0]["endpoint"].as_str().unwrap();
    assert!(endpoint == "de1" || endpoint == "de2");
}

#[tokio::test]
async fn test_test_servers_passthrough() {
    let directory = Arc::new(StaticDirectory::new(["de1", "fr2"]));
    let h = StatusTestHarness::new(1, directory.clone()).await;

    let (status, body) = h.get("/test-servers").await;

    assert_eq!(status, 200);
    assert_eq!(body["count"], 2);
    assert_eq!(body["servers"], serde_json::json!(["de1", "fr2"]));
    assert_eq!(directory.calls(), 1);
}

#[tokio::test]
async fn test_test_servers_surfaces_directory_failure() {
    let h = StatusTestHarness::new(1, Arc::new(StaticDirectory::failing())).await;

    let (status, body) = h.get("/test-servers").await;

    assert_eq!(status, 502);
    assert_eq!(body["code"], "directory_unavailable");
    assert!(body["error"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn test_healthz_reports_pool_fill() {
    let directory = Arc::new(StaticDirectory::new(["de1"]));
    let h = StatusTestHarness::new(2, directory).await;
    h.orchestrator.rotate().await;

    let (status, body) = h.get("/healthz").await;

    assert_eq!(status, 200);
    assert_eq!(body["service"], "pool-manager");
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["pool"]["active"], 1);
    assert_eq!(body["pool"]["capacity"], 2);
    assert_eq!(body["pool"]["cycle_in_progress"], false);
}
