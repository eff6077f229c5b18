//! Per-connection state of the live run protocol, independent of the socket.

use chrono::Utc;
use indexmap::IndexSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, Outbound, RATE_LIMIT_CLOSE_CODE, ServerMessage};
use crate::auth::{Authenticator, Identity, parse_api_key};
use crate::home_assistant::HomeAssistantClient;
use crate::homescript::Engine;
use crate::homescript::TraceEvent;
use crate::homescript::value::variables_from_json;
use crate::repository::Repository;
use crate::runner::{HomeAssistantHooks, RunObserver, StateActivity};
use crate::security::AuthFailureTracker;

/// Request ids remembered per connection for duplicate detection; the oldest
/// is forgotten first.
pub const MAX_TRACKED_REQUEST_IDS: usize = 256;

/// Shared services a live connection needs.
#[derive(Clone)]
pub struct LiveServices {
    pub repository: Arc<Repository>,
    pub home_assistant: Arc<dyn HomeAssistantClient>,
    pub authenticator: Authenticator,
    pub auth_failures: Arc<AuthFailureTracker>,
}

/// Whether the read loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Close,
}

/// Forwards run activity to the socket, tagged with the request id.
struct LiveObserver {
    request_id: String,
    tx: UnboundedSender<Outbound>,
}

impl RunObserver for LiveObserver {
    fn on_trace(&self, event: TraceEvent) {
        let _ = self.tx.send(Outbound::Message(ServerMessage::RunEvent {
            request_id: self.request_id.clone(),
            event,
            timestamp: Utc::now(),
        }));
    }

    fn on_activity(&self, activity: StateActivity) {
        let _ = self.tx.send(Outbound::Message(ServerMessage::HaState {
            request_id: self.request_id.clone(),
            activity,
            timestamp: Utc::now(),
        }));
    }
}

/// Clears the busy flag when a run ends, even if its task panics.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LiveConnection {
    services: LiveServices,
    client_ip: String,
    identity: Option<Identity>,
    busy: Arc<AtomicBool>,
    seen_requests: IndexSet<String>,
    tx: UnboundedSender<Outbound>,
}

impl LiveConnection {
    pub fn new(services: LiveServices, client_ip: String, tx: UnboundedSender<Outbound>) -> Self {
        Self {
            services,
            client_ip,
            identity: None,
            busy: Arc::new(AtomicBool::new(false)),
            seen_requests: IndexSet::new(),
            tx,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Records `request_id`; false when it is still remembered from an earlier run.
    fn track_request(&mut self, request_id: &str) -> bool {
        if !self.seen_requests.insert(request_id.to_string()) {
            return false;
        }
        if self.seen_requests.len() > MAX_TRACKED_REQUEST_IDS {
            self.seen_requests.shift_remove_index(0);
        }
        true
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.tx.send(Outbound::Message(message));
    }

    fn close_rate_limited(&self) -> Control {
        warn!(client_ip = %self.client_ip, "Closing live connection after repeated auth failures");
        let _ = self.tx.send(Outbound::Close {
            code: RATE_LIMIT_CLOSE_CODE,
            reason: "Too many authentication failures".to_string(),
        });
        Control::Close
    }

    /// Called once before reading; refuses addresses already over the limit.
    pub fn open(&self) -> Control {
        if self.services.auth_failures.is_blocked(&self.client_ip) {
            return self.close_rate_limited();
        }
        Control::Continue
    }

    pub async fn handle_text(&mut self, text: &str) -> Control {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Invalid live message: {}", e);
                self.send(ServerMessage::error(format!("Invalid message: {}", e), None));
                return Control::Continue;
            }
        };

        match message {
            ClientMessage::Ping => {
                self.send(ServerMessage::Pong);
                Control::Continue
            }
            ClientMessage::Auth {
                service_id,
                service_secret,
                api_key,
            } => self.authenticate(service_id, service_secret, api_key).await,
            ClientMessage::Run {
                endpoint,
                variables,
                request_id,
            } => {
                self.start_run(endpoint, variables, request_id);
                Control::Continue
            }
        }
    }

    async fn authenticate(
        &mut self,
        service_id: Option<String>,
        service_secret: Option<String>,
        api_key: Option<String>,
    ) -> Control {
        if self.identity.is_some() {
            self.send(ServerMessage::error("Already authenticated", None));
            return Control::Continue;
        }

        let credentials = match (&service_id, &service_secret, &api_key) {
            (Some(id), Some(secret), _) => Some((id.as_str(), secret.as_str())),
            (_, _, Some(key)) => parse_api_key(key),
            _ => None,
        };

        let result = match credentials {
            Some((id, secret)) => {
                self.services
                    .authenticator
                    .authenticate_service(id, secret)
                    .await
            }
            None => Err(crate::error::AppError::AuthenticationRequired),
        };

        match result {
            Ok(Identity::ServiceAccount { id, name }) => {
                info!(
                    service_id = %id,
                    client_ip = %self.client_ip,
                    "Live connection authenticated"
                );
                self.send(ServerMessage::AuthOk {
                    service_id: id.clone(),
                    name: name.clone(),
                });
                self.identity = Some(Identity::ServiceAccount { id, name });
                Control::Continue
            }
            _ => {
                if self.services.auth_failures.record_failure(&self.client_ip) {
                    return self.close_rate_limited();
                }
                self.send(ServerMessage::AuthError {
                    message: "Invalid credentials".to_string(),
                });
                Control::Continue
            }
        }
    }

    fn start_run(
        &mut self,
        endpoint: String,
        variables: serde_json::Value,
        request_id: Option<String>,
    ) {
        if self.identity.is_none() {
            self.send(ServerMessage::AuthError {
                message: "Authentication required".to_string(),
            });
            return;
        }

        let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !self.track_request(&request_id) {
            self.send(ServerMessage::error(
                "Duplicate requestId",
                Some(request_id),
            ));
            return;
        }

        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.send(ServerMessage::rejected(
                &request_id,
                "A run is already in progress on this connection",
            ));
            return;
        }
        let guard = BusyGuard(self.busy.clone());

        let Some(script) = self.services.repository.get_script_by_endpoint(&endpoint) else {
            drop(guard);
            self.send(ServerMessage::rejected(
                &request_id,
                format!("Script not found: {}", endpoint),
            ));
            return;
        };

        let services = self.services.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let _ = tx.send(Outbound::Message(ServerMessage::RunStarted {
                request_id: request_id.clone(),
                endpoint: endpoint.clone(),
                timestamp: Utc::now(),
            }));

            let observer = Arc::new(LiveObserver {
                request_id: request_id.clone(),
                tx: tx.clone(),
            });
            let hooks = HomeAssistantHooks::new(services.home_assistant, services.repository)
                .with_observer(observer);
            let result = Engine::new(Arc::new(hooks))
                .with_variables(variables_from_json(&variables))
                .with_debug(true)
                .with_script_name(endpoint.clone())
                .execute(&script.code)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let complete = match result {
                Ok(outcome) => ServerMessage::RunComplete {
                    request_id,
                    success: true,
                    output: Some(outcome.output),
                    variables: Some(outcome.variables),
                    error: None,
                    line: None,
                    status: None,
                    duration_ms,
                },
                Err(err) => ServerMessage::RunComplete {
                    request_id,
                    success: false,
                    output: None,
                    variables: None,
                    error: Some(err.message),
                    line: err.line,
                    status: Some(err.status),
                    duration_ms,
                },
            };
            drop(guard);
            let _ = tx.send(Outbound::Message(complete));
        });
    }
}
