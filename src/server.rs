//! HTTP surface: shared state, routes and server startup.

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{
    Authenticator, ClientIp, Identity, client_ip_middleware, required_auth_middleware,
};
use crate::config::Config;
use crate::debug::{
    DebugController, DebugRunRequest, DebugRunResponse, DebugSettingsUpdate, LiveSessionStore,
    check_public_access, read_settings, require_ui_user, update_settings, validate_settings,
};
use crate::error::{AppError, AppResult};
use crate::home_assistant::{HomeAssistantClient, RestClient};
use crate::homescript::{OptionalDecl, RequiredDecl, effective_code, parse_declarations};
use crate::live::{LiveServices, live_socket};
use crate::repository::{NewScript, Repository, Script, ScriptUpdate, ServiceAccount};
use crate::runner::{WebhookRequest, WebhookResponse, WebhookRunner};
use crate::security::{
    AuthFailureTracker, CredentialStore, RateLimitDecision, RateLimitKey, RateLimiter,
    SecurityAuditor, Sweepable, spawn_sweeper,
};

/// Everything the handlers share.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repository: Arc<Repository>,
    pub credentials: CredentialStore,
    pub authenticator: Authenticator,
    pub auditor: SecurityAuditor,
    pub home_assistant: Arc<dyn HomeAssistantClient>,
    pub debug: Arc<DebugController>,
    pub webhook_runner: Arc<WebhookRunner>,
    pub webhook_limiter: Arc<RateLimiter>,
    pub public_debug_limiter: Arc<RateLimiter>,
    pub live_auth_failures: Arc<AuthFailureTracker>,
}

impl AppState {
    pub fn new(config: Arc<Config>, home_assistant: Arc<dyn HomeAssistantClient>) -> Self {
        let repository = Arc::new(Repository::new());
        let auditor = SecurityAuditor::new();
        let credentials = CredentialStore::new(repository.clone(), auditor.clone());
        let authenticator =
            Authenticator::new(repository.clone(), credentials.clone(), auditor.clone());

        let webhook_limiter = Arc::new(
            RateLimiter::new(config.rate_limit.webhook).with_security_auditor(auditor.clone()),
        );
        let public_debug_limiter = Arc::new(
            RateLimiter::new(config.rate_limit.public_debug)
                .with_security_auditor(auditor.clone()),
        );
        let live_auth_failures = Arc::new(AuthFailureTracker::new(
            config.live.auth_failure_max,
            config.live.auth_failure_window_ms,
        ));

        let debug = Arc::new(DebugController::new(
            repository.clone(),
            Arc::new(LiveSessionStore::new()),
        ));
        let webhook_runner = Arc::new(WebhookRunner::new(
            repository.clone(),
            home_assistant.clone(),
            webhook_limiter.clone(),
        ));

        Self {
            config,
            repository,
            credentials,
            authenticator,
            auditor,
            home_assistant,
            debug,
            webhook_runner,
            webhook_limiter,
            public_debug_limiter,
            live_auth_failures,
        }
    }

    /// Applies the `bootstrap` config section: a UI session and initial debug access.
    pub fn bootstrap(&self) -> AppResult<()> {
        let bootstrap = &self.config.bootstrap;
        if let Some(token) = bootstrap.ui_session_token.as_deref() {
            let user_id = bootstrap.ui_user_id.as_deref().unwrap_or("admin");
            self.repository.register_ui_session(token, user_id);
            info!(user_id = %user_id, "Registered bootstrap UI session");
        }

        if bootstrap.debug_enabled || !bootstrap.debug_whitelist.is_empty() {
            let whitelist = validate_settings(&DebugSettingsUpdate {
                enabled: bootstrap.debug_enabled,
                whitelist: bootstrap.debug_whitelist.clone(),
            })?;
            let settings = self
                .repository
                .store_debug_settings(bootstrap.debug_enabled, whitelist);
            info!(
                enabled = settings.enabled,
                entries = settings.whitelist.len(),
                "Applied bootstrap debug access settings"
            );
        }
        Ok(())
    }

    pub fn live_services(&self) -> LiveServices {
        LiveServices {
            repository: self.repository.clone(),
            home_assistant: self.home_assistant.clone(),
            authenticator: self.authenticator.clone(),
            auth_failures: self.live_auth_failures.clone(),
        }
    }

    fn sweep_targets(&self) -> Vec<Arc<dyn Sweepable>> {
        vec![
            self.webhook_limiter.clone() as Arc<dyn Sweepable>,
            self.public_debug_limiter.clone() as Arc<dyn Sweepable>,
            self.live_auth_failures.clone() as Arc<dyn Sweepable>,
        ]
    }

    fn check_public_rate(&self, key: RateLimitKey) -> AppResult<()> {
        match self.public_debug_limiter.check(&key) {
            RateLimitDecision::Allowed { .. } => Ok(()),
            RateLimitDecision::Limited { retry_after_secs } => {
                Err(AppError::RateLimitExceeded { retry_after_secs })
            }
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/webhook/{endpoint}", get(webhook).post(webhook))
        .route("/api/debug/settings", get(get_debug_settings).put(put_debug_settings))
        .route("/api/debug/sessions/{endpoint}", get(get_live_session))
        .route("/api/debug/{endpoint}/run", post(ui_debug_run))
        .route("/api/scripts", get(list_scripts).post(create_script))
        .route(
            "/api/scripts/{id}",
            get(get_script).put(update_script).delete(delete_script),
        )
        .route(
            "/api/service-accounts",
            get(list_service_accounts).post(create_service_account),
        )
        .route(
            "/api/service-accounts/{id}",
            axum::routing::delete(delete_service_account),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            required_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/debug/public", get(public_catalogue))
        .route("/debug/public/{endpoint}/run", post(public_debug_run))
        .route("/ws/live", get(live_socket))
        .merge(authenticated)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            client_ip_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves in the background; returns the bound port. Sending on
/// (or dropping) `shutdown_rx`'s sender stops the server gracefully.
pub async fn serve(
    state: AppState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<u16> {
    state.bootstrap()?;

    let addr: SocketAddr = state
        .config
        .server_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;
    let sweep_interval = Duration::from_secs(state.config.sweep_interval_secs.max(1));
    let sweeper = spawn_sweeper(state.sweep_targets(), sweep_interval);

    let app = build_router(state);
    let handle: axum_server::Handle<SocketAddr> = axum_server::Handle::new();
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown_rx.await;
        info!("Shutdown requested, draining connections");
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    tokio::spawn(async move {
        if let Err(e) = server.await {
            warn!("Server error: {}", e);
        }
        sweeper.abort();
    });

    let bound = handle
        .listening()
        .await
        .ok_or_else(|| anyhow::anyhow!("Server failed to bind {}", addr))?;
    info!("listening on {}", bound);
    Ok(bound.port())
}

/// Serves with the REST smart-home client built from `config`.
pub async fn serve_with_config(
    config: Config,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<u16> {
    let client = RestClient::new(&config.home_assistant)?;
    debug!(base_url = %config.home_assistant.base_url, "Configured Home Assistant client");
    serve(AppState::new(Arc::new(config), Arc::new(client)), shutdown_rx).await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// Webhooks

async fn webhook(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<IndexMap<String, String>>,
    body: Bytes,
) -> AppResult<Json<WebhookResponse>> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::validation("body", format!("invalid JSON: {}", e)))?
    };

    debug!(endpoint = %endpoint, principal = %identity.principal(), "Webhook triggered");
    let response = state
        .webhook_runner
        .run(WebhookRequest {
            endpoint,
            client_ip,
            query,
            body,
        })
        .await?;
    Ok(Json(response))
}

// Public debug surface

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogueEntry {
    pub endpoint: String,
    pub name: String,
    pub required: Vec<RequiredDecl>,
    pub optional: Vec<OptionalDecl>,
    pub test_params: serde_json::Value,
}

impl CatalogueEntry {
    fn from_script(script: &Script) -> Self {
        let effective = effective_code(&script.code, script.debug_code.as_deref());
        let declarations = parse_declarations(&effective.code);
        Self {
            endpoint: script.endpoint.clone(),
            name: script.name.clone(),
            required: declarations.required().cloned().collect(),
            optional: declarations.optional().cloned().collect(),
            test_params: script.test_params.clone(),
        }
    }
}

async fn public_catalogue(
    State(state): State<AppState>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
) -> AppResult<Json<Vec<CatalogueEntry>>> {
    check_public_access(&state.repository, &state.auditor, &client_ip, "debug_catalogue")?;
    state.check_public_rate(RateLimitKey::Catalogue(client_ip))?;

    let entries = state
        .repository
        .list_scripts()
        .iter()
        .filter(|script| script.debug_enabled)
        .map(CatalogueEntry::from_script)
        .collect();
    Ok(Json(entries))
}

async fn public_debug_run(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    Json(request): Json<DebugRunRequest>,
) -> AppResult<Json<DebugRunResponse>> {
    check_public_access(&state.repository, &state.auditor, &client_ip, &endpoint)?;
    state.check_public_rate(RateLimitKey::PublicDebug {
        endpoint: endpoint.clone(),
        ip: client_ip,
    })?;

    let script = state
        .repository
        .get_script_by_endpoint(&endpoint)
        .filter(|script| script.debug_enabled)
        .ok_or(AppError::ScriptNotFound { endpoint })?;
    Ok(Json(state.debug.run(&script, request).await))
}

// UI debug surface

async fn ui_debug_run(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<DebugRunRequest>,
) -> AppResult<Json<DebugRunResponse>> {
    require_ui_user(&identity)?;
    let script = state
        .repository
        .get_script_by_endpoint(&endpoint)
        .ok_or(AppError::ScriptNotFound { endpoint })?;
    Ok(Json(state.debug.run(&script, request).await))
}

async fn get_debug_settings(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(read_settings(&state.repository, &identity)?))
}

async fn put_debug_settings(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(update): Json<DebugSettingsUpdate>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(update_settings(
        &state.repository,
        &state.auditor,
        &identity,
        update,
    )?))
}

async fn get_live_session(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Extension(identity): Extension<Identity>,
) -> AppResult<impl IntoResponse> {
    require_ui_user(&identity)?;
    let session = state
        .debug
        .sessions()
        .get(&endpoint)
        .ok_or_else(|| AppError::NotFound {
            what: format!("debug session for {}", endpoint),
        })?;
    Ok(Json(session))
}

// Script management

async fn list_scripts(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<Vec<Script>>> {
    require_ui_user(&identity)?;
    Ok(Json(state.repository.list_scripts()))
}

async fn get_script(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<Script>> {
    require_ui_user(&identity)?;
    state
        .repository
        .get_script(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound {
            what: format!("script {}", id),
        })
}

async fn create_script(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(input): Json<NewScript>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_ui_user(&identity)?;
    let script = state.repository.create_script(input)?;
    info!(endpoint = %script.endpoint, user_id = %user_id, "Script created");
    Ok((StatusCode::CREATED, Json(script)))
}

async fn update_script(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(identity): Extension<Identity>,
    Json(update): Json<ScriptUpdate>,
) -> AppResult<Json<Script>> {
    let user_id = require_ui_user(&identity)?;
    let script = state.repository.update_script(&id, update)?;
    info!(endpoint = %script.endpoint, user_id = %user_id, "Script updated");
    Ok(Json(script))
}

async fn delete_script(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> AppResult<StatusCode> {
    require_ui_user(&identity)?;
    let script = state.repository.delete_script(&id)?;
    state.debug.sessions().remove(&script.endpoint);
    Ok(StatusCode::NO_CONTENT)
}

// Service accounts

#[derive(Debug, Deserialize)]
pub struct NewServiceAccount {
    pub name: String,
}

/// The plaintext secret is only ever returned here.
#[derive(Debug, Serialize)]
pub struct CreatedServiceAccount {
    #[serde(flatten)]
    pub account: ServiceAccount,
    pub secret: String,
}

async fn list_service_accounts(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<Vec<ServiceAccount>>> {
    require_ui_user(&identity)?;
    Ok(Json(state.repository.list_service_accounts()))
}

async fn create_service_account(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(input): Json<NewServiceAccount>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_ui_user(&identity)?;
    if input.name.trim().is_empty() {
        return Err(AppError::validation("name", "must not be empty"));
    }
    let (account, secret) = state
        .credentials
        .create_service_account(input.name.trim())
        .await?;
    info!(service_id = %account.id, user_id = %user_id, "Service account created");
    Ok((
        StatusCode::CREATED,
        Json(CreatedServiceAccount { account, secret }),
    ))
}

async fn delete_service_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> AppResult<StatusCode> {
    require_ui_user(&identity)?;
    state.repository.delete_service_account(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::home_assistant::MockHomeAssistantClient;

    fn state_with(config: Config) -> AppState {
        AppState::new(Arc::new(config), Arc::new(MockHomeAssistantClient::new()))
    }

    #[test]
    fn test_bootstrap_registers_session_and_settings() {
        let mut config = Config::test_config_with_port(0);
        config.bootstrap.ui_session_token = Some("token-1".to_string());
        config.bootstrap.ui_user_id = Some("alice".to_string());
        config.bootstrap.debug_enabled = true;
        config.bootstrap.debug_whitelist = vec!["10.0.0.0/8".to_string()];

        let state = state_with(config);
        state.bootstrap().unwrap();

        assert_eq!(
            state.repository.resolve_ui_session("token-1"),
            Some("alice".to_string())
        );
        let settings = state.repository.debug_settings();
        assert!(settings.enabled);
        assert_eq!(settings.whitelist, vec!["10.0.0.0/8".to_string()]);
    }

    #[test]
    fn test_bootstrap_rejects_enabled_without_whitelist() {
        let mut config = Config::test_config_with_port(0);
        config.bootstrap.debug_enabled = true;

        assert!(state_with(config).bootstrap().is_err());
    }

    #[test]
    fn test_catalogue_entry_uses_effective_code() {
        let state = state_with(Config::test_config_with_port(0));
        let script = state
            .repository
            .create_script(NewScript {
                name: "Lights".to_string(),
                code: "REQUIRED $room\nPRINT $room".to_string(),
                endpoint: "lights".to_string(),
                debug_code: Some("OPTIONAL $room = \"hall\"\nPRINT $room".to_string()),
                debug_enabled: true,
                ..Default::default()
            })
            .unwrap();

        let entry = CatalogueEntry::from_script(&script);
        assert!(entry.required.is_empty());
        assert_eq!(entry.optional.len(), 1);
        assert_eq!(entry.optional[0].name, "room");
    }

    #[test]
    fn test_public_rate_limit() {
        let mut config = Config::test_config_with_port(0);
        config.rate_limit.public_debug = crate::security::RateLimitConfig::new(1, 60_000);
        let state = state_with(config);

        let key = || RateLimitKey::Catalogue("10.0.0.1".to_string());
        assert!(state.check_public_rate(key()).is_ok());
        assert!(matches!(
            state.check_public_rate(key()),
            Err(AppError::RateLimitExceeded { .. })
        ));
    }
}
