use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SecurityEventType {
    AuthenticationSuccess,
    AuthenticationFailure,
    AuthorizationFailure,
    CredentialMigrated,
    WhitelistDenied,
    RateLimitExceeded,
    DebugSettingsChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SecuritySeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub principal: Option<String>,
    pub ip_address: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub details: HashMap<String, String>,
    pub error_message: Option<String>,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: SecuritySeverity,
        principal: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            severity,
            principal,
            ip_address: None,
            resource: None,
            action: None,
            details: HashMap::new(),
            error_message: None,
        }
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_detail<K: ToString, V: ToString>(mut self, key: K, value: V) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

/// Writes security events to the structured log.
#[derive(Clone, Default)]
pub struct SecurityAuditor {}

impl SecurityAuditor {
    pub fn new() -> Self {
        Self {}
    }

    pub fn log_event(&self, event: SecurityEvent) {
        match event.severity {
            SecuritySeverity::Low => {
                info!(
                    event_id = %event.id,
                    event_type = ?event.event_type,
                    principal = ?event.principal,
                    resource = ?event.resource,
                    action = ?event.action,
                    "Security event logged"
                );
            }
            SecuritySeverity::Medium => {
                warn!(
                    event_id = %event.id,
                    event_type = ?event.event_type,
                    principal = ?event.principal,
                    ip_address = ?event.ip_address,
                    resource = ?event.resource,
                    action = ?event.action,
                    error = ?event.error_message,
                    "Security warning logged"
                );
            }
            SecuritySeverity::High => {
                error!(
                    event_id = %event.id,
                    event_type = ?event.event_type,
                    principal = ?event.principal,
                    ip_address = ?event.ip_address,
                    resource = ?event.resource,
                    action = ?event.action,
                    details = ?event.details,
                    error = ?event.error_message,
                    "Critical security event logged"
                );
            }
        }
    }

    pub fn log_auth_success(&self, principal: &str, method: &str) {
        self.log_event(
            SecurityEvent::new(
                SecurityEventType::AuthenticationSuccess,
                SecuritySeverity::Low,
                Some(principal.to_string()),
            )
            .with_action("authenticate")
            .with_detail("method", method),
        );
    }

    pub fn log_auth_failure(&self, attempted: Option<String>, reason: &str, ip: Option<&str>) {
        let mut event = SecurityEvent::new(
            SecurityEventType::AuthenticationFailure,
            SecuritySeverity::Medium,
            attempted,
        )
        .with_action("authenticate")
        .with_error(reason);
        if let Some(ip) = ip {
            event = event.with_ip(ip);
        }
        self.log_event(event);
    }

    pub fn log_whitelist_denied(&self, ip: &str, resource: &str) {
        self.log_event(
            SecurityEvent::new(
                SecurityEventType::WhitelistDenied,
                SecuritySeverity::Medium,
                None,
            )
            .with_ip(ip)
            .with_resource(resource)
            .with_action("public_debug_access"),
        );
    }

    pub fn log_rate_limited(&self, key: &str, retry_after_secs: u64) {
        self.log_event(
            SecurityEvent::new(
                SecurityEventType::RateLimitExceeded,
                SecuritySeverity::Medium,
                None,
            )
            .with_resource(key)
            .with_detail("retry_after_secs", retry_after_secs),
        );
    }
}
