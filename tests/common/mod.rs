#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use homescript::{config, start_server_with_config};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub const UI_TOKEN: &str = "test-ui-token";

/// Stand-in for the Home Assistant REST API.
#[derive(Clone, Default)]
pub struct MockHomeAssistant {
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
    pub states: Arc<Mutex<HashMap<String, String>>>,
}

pub struct MockHomeAssistantServer {
    pub port: u16,
    pub ha: MockHomeAssistant,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockHomeAssistantServer {
    pub async fn start() -> anyhow::Result<Self> {
        let ha = MockHomeAssistant::default();
        let app = Router::new()
            .route("/api/services/{domain}/{service}", post(handle_call_service))
            .route("/api/states/{entity_id}", get(handle_get_state).post(handle_set_state))
            .with_state(ha.clone());

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let port = listener.local_addr()?.port();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Mock Home Assistant failed");
        });

        Ok(Self {
            port,
            ha,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.ha.calls.lock().unwrap().clone()
    }

    pub fn set(&self, entity_id: &str, state: &str) {
        self.ha
            .states
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), state.to_string());
    }

    pub fn state(&self, entity_id: &str) -> Option<String> {
        self.ha.states.lock().unwrap().get(entity_id).cloned()
    }
}

impl Drop for MockHomeAssistantServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_call_service(
    State(ha): State<MockHomeAssistant>,
    Path((domain, service)): Path<(String, String)>,
    Json(data): Json<Value>,
) -> impl IntoResponse {
    if domain == "broken" {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"message": "boom"})));
    }
    ha.calls
        .lock()
        .unwrap()
        .push((format!("{}.{}", domain, service), data));
    (StatusCode::OK, Json(json!([])))
}

async fn handle_get_state(
    State(ha): State<MockHomeAssistant>,
    Path(entity_id): Path<String>,
) -> impl IntoResponse {
    match ha.states.lock().unwrap().get(&entity_id) {
        Some(state) => (
            StatusCode::OK,
            Json(json!({"entity_id": entity_id, "state": state, "attributes": {}})),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Entity not found."})),
        ),
    }
}

async fn handle_set_state(
    State(ha): State<MockHomeAssistant>,
    Path(entity_id): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let state = body["state"].as_str().unwrap_or_default().to_string();
    ha.states
        .lock()
        .unwrap()
        .insert(entity_id.clone(), state.clone());
    Json(json!({"entity_id": entity_id, "state": state, "attributes": {}}))
}

/// Test server with proper shutdown support, backed by a mock Home Assistant.
pub struct TestServer {
    port: u16,
    pub home_assistant: MockHomeAssistantServer,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(|_| {}).await
    }

    /// Starts with automatic port selection after `customize` adjusts the config.
    pub async fn start_with(customize: impl FnOnce(&mut config::Config)) -> anyhow::Result<Self> {
        let home_assistant = MockHomeAssistantServer::start().await?;

        let mut test_config = config::Config::test_config_with_port(0);
        test_config.home_assistant.base_url = home_assistant.base_url();
        test_config.home_assistant.timeout_ms = 2000;
        test_config.bootstrap.ui_session_token = Some(UI_TOKEN.to_string());
        test_config.bootstrap.ui_user_id = Some("admin".to_string());
        customize(&mut test_config);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let port = start_server_with_config(test_config, shutdown_rx).await?;

        Ok(Self {
            port,
            home_assistant,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}{}", self.port, path)
    }

    /// Creates a script through the management API.
    pub async fn create_script(&self, client: &reqwest::Client, script: Value) -> Value {
        let response = client
            .post(self.url("/api/scripts"))
            .bearer_auth(UI_TOKEN)
            .json(&script)
            .send()
            .await
            .expect("create script request");
        assert_eq!(response.status(), 201, "script creation failed");
        response.json().await.expect("script body")
    }

    /// Creates a service account and returns `(id, secret)`.
    pub async fn create_service_account(
        &self,
        client: &reqwest::Client,
        name: &str,
    ) -> (String, String) {
        let response = client
            .post(self.url("/api/service-accounts"))
            .bearer_auth(UI_TOKEN)
            .json(&json!({ "name": name }))
            .send()
            .await
            .expect("create service account request");
        assert_eq!(response.status(), 201, "service account creation failed");
        let body: Value = response.json().await.expect("service account body");
        (
            body["id"].as_str().unwrap().to_string(),
            body["secret"].as_str().unwrap().to_string(),
        )
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("reqwest client")
}

/// Wait for server to be ready with retries
pub async fn wait_for_server(port: u16, max_attempts: u32) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()?;

    for attempt in 1..=max_attempts {
        if let Ok(response) = client
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            && response.status().is_success()
        {
            return Ok(());
        }

        if attempt < max_attempts {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    Err(anyhow::anyhow!(
        "Server not ready after {} attempts",
        max_attempts
    ))
}

pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().compact())
        .try_init();
}
