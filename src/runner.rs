//! Webhook execution against the real smart-home system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::home_assistant::{HomeAssistantClient, split_service};
use crate::homescript::value::variables_from_json;
use crate::homescript::{Engine, HookError, ScriptHooks, ScriptValue, TraceEvent};
use crate::repository::Repository;
use crate::security::{RateLimitDecision, RateLimitKey, RateLimiter};

/// One external interaction performed by a run.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StateActivity {
    Call {
        service: String,
        args: serde_json::Value,
        result: serde_json::Value,
    },
    Read {
        #[serde(rename = "entityId")]
        entity_id: String,
        value: serde_json::Value,
    },
    Write {
        #[serde(rename = "entityId")]
        entity_id: String,
        value: serde_json::Value,
    },
}

/// Receives trace and state activity from a run as it happens.
pub trait RunObserver: Send + Sync {
    fn on_trace(&self, event: TraceEvent);
    fn on_activity(&self, activity: StateActivity);
}

/// Hooks wired to Home Assistant. Imports resolve to the main code of the
/// script registered under the imported endpoint.
pub struct HomeAssistantHooks {
    client: Arc<dyn HomeAssistantClient>,
    repository: Arc<Repository>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl HomeAssistantHooks {
    pub fn new(client: Arc<dyn HomeAssistantClient>, repository: Arc<Repository>) -> Self {
        Self {
            client,
            repository,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn report(&self, activity: StateActivity) {
        if let Some(observer) = &self.observer {
            observer.on_activity(activity);
        }
    }
}

#[async_trait]
impl ScriptHooks for HomeAssistantHooks {
    async fn on_call(&self, service: &str, args: ScriptValue) -> Result<ScriptValue, HookError> {
        let (domain, name) =
            split_service(service).map_err(|e| HookError::Failed {
                message: e.to_string(),
                status: 400,
            })?;
        let payload = args.to_json();
        let result = self
            .client
            .call_service(domain, name, payload.clone())
            .await
            .map_err(|e| HookError::upstream(format!("{} failed: {}", service, e)))?;

        self.report(StateActivity::Call {
            service: service.to_string(),
            args: payload,
            result: result.clone(),
        });
        Ok(ScriptValue::from(result))
    }

    async fn on_get(&self, entity_id: &str) -> Result<ScriptValue, HookError> {
        let value = match self
            .client
            .get_state(entity_id)
            .await
            .map_err(|e| HookError::upstream(format!("Reading {} failed: {}", entity_id, e)))?
        {
            Some(state) => ScriptValue::String(state.state),
            None => ScriptValue::string("unknown"),
        };

        self.report(StateActivity::Read {
            entity_id: entity_id.to_string(),
            value: value.to_json(),
        });
        Ok(value)
    }

    async fn on_set(&self, entity_id: &str, value: ScriptValue) -> Result<ScriptValue, HookError> {
        let stored = self
            .client
            .set_state(entity_id, &value.to_string())
            .await
            .map_err(|e| HookError::upstream(format!("Writing {} failed: {}", entity_id, e)))?;
        let stored = ScriptValue::String(stored.state);

        self.report(StateActivity::Write {
            entity_id: entity_id.to_string(),
            value: stored.to_json(),
        });
        Ok(stored)
    }

    async fn import_script(&self, name: &str) -> Result<String, HookError> {
        self.repository
            .get_script_by_endpoint(name)
            .map(|script| script.code)
            .ok_or_else(|| HookError::NotFound(name.to_string()))
    }

    fn on_event(&self, event: TraceEvent) {
        if let Some(observer) = &self.observer {
            observer.on_trace(event);
        }
    }
}

/// Successful webhook result.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WebhookResponse {
    pub output: String,
    pub variables: IndexMap<String, ScriptValue>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

/// Inputs of one webhook invocation.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub endpoint: String,
    pub client_ip: String,
    pub query: IndexMap<String, String>,
    pub body: serde_json::Value,
}

/// Runs scripts on behalf of webhook callers.
pub struct WebhookRunner {
    repository: Arc<Repository>,
    client: Arc<dyn HomeAssistantClient>,
    limiter: Arc<RateLimiter>,
}

impl WebhookRunner {
    pub fn new(
        repository: Arc<Repository>,
        client: Arc<dyn HomeAssistantClient>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            repository,
            client,
            limiter,
        }
    }

    /// Query parameters become string inputs; body fields override them.
    pub fn inputs(request: &WebhookRequest) -> IndexMap<String, ScriptValue> {
        let mut variables: IndexMap<String, ScriptValue> = request
            .query
            .iter()
            .map(|(k, v)| (k.clone(), ScriptValue::String(v.clone())))
            .collect();
        variables.extend(variables_from_json(&request.body));
        variables
    }

    pub async fn run(&self, request: WebhookRequest) -> AppResult<WebhookResponse> {
        let key = RateLimitKey::Webhook {
            endpoint: request.endpoint.clone(),
            ip: request.client_ip.clone(),
        };
        if let RateLimitDecision::Limited { retry_after_secs } = self.limiter.check(&key) {
            return Err(AppError::RateLimitExceeded { retry_after_secs });
        }

        let script = self
            .repository
            .get_script_by_endpoint(&request.endpoint)
            .ok_or_else(|| AppError::ScriptNotFound {
                endpoint: request.endpoint.clone(),
            })?;

        let hooks = HomeAssistantHooks::new(self.client.clone(), self.repository.clone());
        let started: DateTime<Utc> = Utc::now();
        let result = Engine::new(Arc::new(hooks))
            .with_variables(Self::inputs(&request))
            .with_query(request.query)
            .with_script_name(request.endpoint.clone())
            .execute(&script.code)
            .await;
        let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;

        match result {
            Ok(outcome) => {
                info!(endpoint = %request.endpoint, duration_ms, "Webhook run completed");
                Ok(WebhookResponse {
                    output: outcome.output,
                    variables: outcome.variables,
                    duration_ms,
                })
            }
            Err(err) => {
                warn!(
                    endpoint = %request.endpoint,
                    line = ?err.line,
                    "Webhook run failed: {}", err
                );
                Err(AppError::Script(err))
            }
        }
    }
}
