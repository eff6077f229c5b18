//! Caller identification.
//!
//! Accepted credentials, in order: a bearer UI session token, an
//! `x-service-id` + `x-service-secret` pair, or a legacy `x-service-key`
//! of the form `serviceId:secret`. A lone `x-service-id` is accepted only
//! through the debug bypass: debug access enabled and the caller's address
//! on the whitelist.

pub mod middleware;

use axum::http::{HeaderMap, header};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::debug::public_access_allowed;
use crate::error::{AppError, AppResult};
use crate::repository::Repository;
use crate::security::{CredentialStore, SecurityAuditor};

pub use middleware::{ClientIp, client_ip_middleware, required_auth_middleware};

pub const SERVICE_ID_HEADER: &str = "x-service-id";
pub const SERVICE_SECRET_HEADER: &str = "x-service-secret";
pub const SERVICE_KEY_HEADER: &str = "x-service-key";
pub const SESSION_COOKIE: &str = "homescript_session";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    UiUser { user_id: String },
    ServiceAccount { id: String, name: String },
    /// Service id accepted without a secret through the debug bypass
    Bypass { service_id: String },
}

impl Identity {
    pub fn principal(&self) -> &str {
        match self {
            Identity::UiUser { user_id } => user_id.as_str(),
            Identity::ServiceAccount { id, .. } => id.as_str(),
            Identity::Bypass { service_id } => service_id.as_str(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Bearer token from `Authorization`, else the session cookie.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = header_str(headers, header::AUTHORIZATION.as_str())
        && let Some(token) = auth.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_string());
    }

    let cookies = header_str(headers, header::COOKIE.as_str())?;
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Splits a legacy `serviceId:secret` key.
pub fn parse_api_key(key: &str) -> Option<(&str, &str)> {
    let (id, secret) = key.split_once(':')?;
    (!id.is_empty() && !secret.is_empty()).then_some((id, secret))
}

#[derive(Clone)]
pub struct Authenticator {
    repository: Arc<Repository>,
    credentials: CredentialStore,
    auditor: SecurityAuditor,
}

impl Authenticator {
    pub fn new(
        repository: Arc<Repository>,
        credentials: CredentialStore,
        auditor: SecurityAuditor,
    ) -> Self {
        Self {
            repository,
            credentials,
            auditor,
        }
    }

    /// Verifies a service id and secret.
    pub async fn authenticate_service(&self, id: &str, secret: &str) -> AppResult<Identity> {
        match self.credentials.verify(id, secret).await {
            Some(account) => {
                self.auditor.log_auth_success(&account.id, "service_account");
                Ok(Identity::ServiceAccount {
                    id: account.id,
                    name: account.name,
                })
            }
            None => Err(AppError::AuthenticationFailed {
                message: "invalid service credentials".to_string(),
            }),
        }
    }

    pub async fn authenticate(&self, headers: &HeaderMap, client_ip: &str) -> AppResult<Identity> {
        if let Some(token) = extract_session_token(headers) {
            return match self.repository.resolve_ui_session(&token) {
                Some(user_id) => Ok(Identity::UiUser { user_id }),
                None => {
                    self.auditor
                        .log_auth_failure(None, "unknown session token", Some(client_ip));
                    Err(AppError::AuthenticationFailed {
                        message: "invalid or expired session".to_string(),
                    })
                }
            };
        }

        let service_id = header_str(headers, SERVICE_ID_HEADER);
        let service_secret = header_str(headers, SERVICE_SECRET_HEADER);

        if let (Some(id), Some(secret)) = (service_id, service_secret) {
            return self.authenticate_service(id, secret).await.inspect_err(|_| {
                self.auditor.log_auth_failure(
                    Some(id.to_string()),
                    "service secret mismatch",
                    Some(client_ip),
                );
            });
        }

        if let Some(key) = header_str(headers, SERVICE_KEY_HEADER) {
            let Some((id, secret)) = parse_api_key(key) else {
                return Err(AppError::AuthenticationFailed {
                    message: "malformed service key".to_string(),
                });
            };
            return self.authenticate_service(id, secret).await.inspect_err(|_| {
                self.auditor.log_auth_failure(
                    Some(id.to_string()),
                    "legacy service key mismatch",
                    Some(client_ip),
                );
            });
        }

        if let Some(id) = service_id {
            return self.bypass(id, client_ip);
        }

        Err(AppError::AuthenticationRequired)
    }

    fn bypass(&self, service_id: &str, client_ip: &str) -> AppResult<Identity> {
        let settings = self.repository.debug_settings();
        if !public_access_allowed(&settings, client_ip) {
            self.auditor.log_auth_failure(
                Some(service_id.to_string()),
                "service id without secret outside debug whitelist",
                Some(client_ip),
            );
            return Err(AppError::AuthenticationRequired);
        }
        if self.repository.get_service_account(service_id).is_none() {
            return Err(AppError::AuthenticationFailed {
                message: "unknown service account".to_string(),
            });
        }

        debug!(service_id, client_ip, "Debug bypass accepted");
        self.auditor.log_auth_success(service_id, "debug_bypass");
        Ok(Identity::Bypass {
            service_id: service_id.to_string(),
        })
    }
}
