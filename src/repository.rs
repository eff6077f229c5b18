//! In-memory store for scripts, service accounts, the debug access settings
//! row and UI sessions. Writers are serialized per table by the locks.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

const MAX_ENDPOINT_LEN: usize = 64;

lazy_static! {
    static ref ENDPOINT_RE: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("endpoint pattern is valid");
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    #[error("Endpoint already in use: {0}")]
    EndpointTaken(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Service account not found: {0}")]
    ServiceAccountNotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Script {
    pub id: String,
    pub name: String,
    pub code: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_code: Option<String>,
    pub debug_enabled: bool,
    pub test_params: serde_json::Value,
    pub trigger_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating a script.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewScript {
    pub name: String,
    pub code: String,
    pub endpoint: String,
    #[serde(default)]
    pub debug_code: Option<String>,
    #[serde(default)]
    pub debug_enabled: bool,
    #[serde(default)]
    pub test_params: Option<serde_json::Value>,
    #[serde(default)]
    pub trigger_config: Option<serde_json::Value>,
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptUpdate {
    pub name: Option<String>,
    pub code: Option<String>,
    pub endpoint: Option<String>,
    /// `Some("")` clears the override
    pub debug_code: Option<String>,
    pub debug_enabled: Option<bool>,
    pub test_params: Option<serde_json::Value>,
    pub trigger_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceAccount {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugAccessSettings {
    pub enabled: bool,
    pub whitelist: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for DebugAccessSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            whitelist: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

pub fn validate_endpoint(endpoint: &str) -> Result<(), RepositoryError> {
    if endpoint.len() > MAX_ENDPOINT_LEN || !ENDPOINT_RE.is_match(endpoint) {
        return Err(RepositoryError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct Repository {
    scripts: RwLock<IndexMap<String, Script>>,
    service_accounts: RwLock<IndexMap<String, ServiceAccount>>,
    debug_settings: RwLock<DebugAccessSettings>,
    ui_sessions: RwLock<HashMap<String, String>>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    // Scripts

    pub fn list_scripts(&self) -> Vec<Script> {
        read(&self.scripts).values().cloned().collect()
    }

    pub fn get_script(&self, id: &str) -> Option<Script> {
        read(&self.scripts).get(id).cloned()
    }

    pub fn get_script_by_endpoint(&self, endpoint: &str) -> Option<Script> {
        read(&self.scripts)
            .values()
            .find(|script| script.endpoint == endpoint)
            .cloned()
    }

    pub fn create_script(&self, input: NewScript) -> Result<Script, RepositoryError> {
        if input.name.trim().is_empty() {
            return Err(RepositoryError::InvalidData("name must not be empty".to_string()));
        }
        validate_endpoint(&input.endpoint)?;

        let mut scripts = write(&self.scripts);
        if scripts.values().any(|s| s.endpoint == input.endpoint) {
            return Err(RepositoryError::EndpointTaken(input.endpoint));
        }

        let now = Utc::now();
        let script = Script {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name,
            code: input.code,
            endpoint: input.endpoint,
            debug_code: input.debug_code.filter(|c| !c.trim().is_empty()),
            debug_enabled: input.debug_enabled,
            test_params: input.test_params.unwrap_or_else(|| serde_json::json!({})),
            trigger_config: input.trigger_config.unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
        };
        scripts.insert(script.id.clone(), script.clone());
        info!(script_id = %script.id, endpoint = %script.endpoint, "Script created");
        Ok(script)
    }

    pub fn update_script(&self, id: &str, update: ScriptUpdate) -> Result<Script, RepositoryError> {
        if let Some(endpoint) = &update.endpoint {
            validate_endpoint(endpoint)?;
        }

        let mut scripts = write(&self.scripts);
        if let Some(endpoint) = &update.endpoint
            && scripts
                .values()
                .any(|s| s.id != id && &s.endpoint == endpoint)
        {
            return Err(RepositoryError::EndpointTaken(endpoint.clone()));
        }

        let script = scripts
            .get_mut(id)
            .ok_or_else(|| RepositoryError::ScriptNotFound(id.to_string()))?;

        if let Some(name) = update.name {
            script.name = name;
        }
        if let Some(code) = update.code {
            script.code = code;
        }
        if let Some(endpoint) = update.endpoint {
            script.endpoint = endpoint;
        }
        if let Some(debug_code) = update.debug_code {
            script.debug_code = Some(debug_code).filter(|c| !c.trim().is_empty());
        }
        if let Some(debug_enabled) = update.debug_enabled {
            script.debug_enabled = debug_enabled;
        }
        if let Some(test_params) = update.test_params {
            script.test_params = test_params;
        }
        if let Some(trigger_config) = update.trigger_config {
            script.trigger_config = trigger_config;
        }
        script.updated_at = Utc::now();

        debug!(script_id = %id, "Script updated");
        Ok(script.clone())
    }

    /// Removes the script and returns the deleted row.
    pub fn delete_script(&self, id: &str) -> Result<Script, RepositoryError> {
        write(&self.scripts)
            .shift_remove(id)
            .ok_or_else(|| RepositoryError::ScriptNotFound(id.to_string()))
    }

    // Service accounts

    /// Stores an account whose secret is already in its persisted form.
    pub fn insert_service_account(
        &self,
        name: &str,
        secret: String,
    ) -> Result<ServiceAccount, RepositoryError> {
        if name.trim().is_empty() {
            return Err(RepositoryError::InvalidData("name must not be empty".to_string()));
        }
        let account = ServiceAccount {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            secret,
            created_at: Utc::now(),
        };
        write(&self.service_accounts).insert(account.id.clone(), account.clone());
        info!(account_id = %account.id, "Service account created");
        Ok(account)
    }

    pub fn get_service_account(&self, id: &str) -> Option<ServiceAccount> {
        read(&self.service_accounts).get(id).cloned()
    }

    pub fn list_service_accounts(&self) -> Vec<ServiceAccount> {
        read(&self.service_accounts).values().cloned().collect()
    }

    pub fn delete_service_account(&self, id: &str) -> Result<(), RepositoryError> {
        write(&self.service_accounts)
            .shift_remove(id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::ServiceAccountNotFound(id.to_string()))
    }

    /// Compare-and-swap on the stored secret. Returns false when the row is
    /// gone or no longer holds `expected`.
    pub fn replace_service_account_secret(&self, id: &str, expected: &str, secret: String) -> bool {
        let mut accounts = write(&self.service_accounts);
        match accounts.get_mut(id) {
            Some(account) if account.secret == expected => {
                account.secret = secret;
                true
            }
            _ => false,
        }
    }

    // Debug access settings

    pub fn debug_settings(&self) -> DebugAccessSettings {
        read(&self.debug_settings).clone()
    }

    pub fn store_debug_settings(
        &self,
        enabled: bool,
        whitelist: Vec<String>,
    ) -> DebugAccessSettings {
        let mut settings = write(&self.debug_settings);
        settings.enabled = enabled;
        settings.whitelist = whitelist;
        settings.updated_at = Utc::now();
        settings.clone()
    }

    // UI sessions

    pub fn register_ui_session(&self, token: &str, user_id: &str) {
        write(&self.ui_sessions).insert(token.to_string(), user_id.to_string());
    }

    pub fn resolve_ui_session(&self, token: &str) -> Option<String> {
        read(&self.ui_sessions).get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_script(endpoint: &str) -> NewScript {
        NewScript {
            name: format!("script {}", endpoint),
            code: "PRINT \"hi\"".to_string(),
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint_uniqueness_on_create() {
        let repo = Repository::new();
        repo.create_script(new_script("lights")).unwrap();
        let err = repo.create_script(new_script("lights")).unwrap_err();
        assert!(matches!(err, RepositoryError::EndpointTaken(_)));
    }

    #[test]
    fn test_endpoint_uniqueness_on_update() {
        let repo = Repository::new();
        let a = repo.create_script(new_script("a")).unwrap();
        repo.create_script(new_script("b")).unwrap();

        let err = repo
            .update_script(
                &a.id,
                ScriptUpdate {
                    endpoint: Some("b".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RepositoryError::EndpointTaken(_)));

        // Keeping its own endpoint is fine
        let same = repo
            .update_script(
                &a.id,
                ScriptUpdate {
                    endpoint: Some("a".to_string()),
                    code: Some("PRINT 1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(same.code, "PRINT 1");
    }

    #[test]
    fn test_endpoint_syntax() {
        assert!(validate_endpoint("living-room_1").is_ok());
        assert!(validate_endpoint("").is_err());
        assert!(validate_endpoint("-leading").is_err());
        assert!(validate_endpoint("has space").is_err());
        assert!(validate_endpoint(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_debug_code_blank_is_cleared() {
        let repo = Repository::new();
        let script = repo
            .create_script(NewScript {
                debug_code: Some("  ".to_string()),
                ..new_script("x")
            })
            .unwrap();
        assert_eq!(script.debug_code, None);
    }

    #[test]
    fn test_lookup_by_endpoint_and_delete() {
        let repo = Repository::new();
        let script = repo.create_script(new_script("door")).unwrap();
        assert_eq!(repo.get_script_by_endpoint("door").unwrap().id, script.id);
        repo.delete_script(&script.id).unwrap();
        assert!(repo.get_script_by_endpoint("door").is_none());
        assert!(repo.delete_script(&script.id).is_err());
    }

    #[test]
    fn test_secret_compare_and_swap() {
        let repo = Repository::new();
        let account = repo.insert_service_account("bot", "plain".to_string()).unwrap();
        assert!(!repo.replace_service_account_secret(&account.id, "other", "x".to_string()));
        assert!(repo.replace_service_account_secret(&account.id, "plain", "hashed".to_string()));
        assert_eq!(repo.get_service_account(&account.id).unwrap().secret, "hashed");
    }

    #[test]
    fn test_service_account_secret_not_serialized() {
        let repo = Repository::new();
        let account = repo.insert_service_account("bot", "s3cret".to_string()).unwrap();
        let json = serde_json::to_string(&account).unwrap();
        assert!(!json.contains("s3cret"));
    }

    #[test]
    fn test_ui_sessions() {
        let repo = Repository::new();
        repo.register_ui_session("tok", "alice");
        assert_eq!(repo.resolve_ui_session("tok").as_deref(), Some("alice"));
        assert!(repo.resolve_ui_session("other").is_none());
    }
}
