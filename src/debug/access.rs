//! Debug access policy: the settings row and the public-surface gate.

use serde::{Deserialize, Serialize};

use crate::auth::Identity;
use crate::error::{AppError, AppResult};
use crate::repository::{DebugAccessSettings, Repository};
use crate::security::{SecurityAuditor, is_ip_allowed_by_whitelist, is_valid_ip_or_cidr};

/// Body of `PUT /api/debug/settings`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DebugSettingsUpdate {
    pub enabled: bool,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// Trims entries, drops blanks and rejects anything that is not an IP or CIDR.
pub fn validate_settings(update: &DebugSettingsUpdate) -> AppResult<Vec<String>> {
    let mut whitelist = Vec::with_capacity(update.whitelist.len());
    for entry in &update.whitelist {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if !is_valid_ip_or_cidr(entry) {
            return Err(AppError::validation(
                "whitelist",
                format!("'{}' is not a valid IP address or CIDR range", entry),
            ));
        }
        if !whitelist.iter().any(|existing: &String| existing == entry) {
            whitelist.push(entry.to_string());
        }
    }

    if update.enabled && whitelist.is_empty() {
        return Err(AppError::validation(
            "whitelist",
            "enabling debug access requires at least one whitelist entry",
        ));
    }
    Ok(whitelist)
}

/// Only interactive UI users may manage debugging; service accounts pass the
/// generic gate but are refused here.
pub fn require_ui_user(identity: &Identity) -> AppResult<&str> {
    match identity {
        Identity::UiUser { user_id } => Ok(user_id.as_str()),
        _ => Err(AppError::forbidden(
            "debug resources require an interactive user session",
        )),
    }
}

pub fn read_settings(
    repository: &Repository,
    identity: &Identity,
) -> AppResult<DebugAccessSettings> {
    require_ui_user(identity)?;
    Ok(repository.debug_settings())
}

pub fn update_settings(
    repository: &Repository,
    auditor: &SecurityAuditor,
    identity: &Identity,
    update: DebugSettingsUpdate,
) -> AppResult<DebugAccessSettings> {
    let user_id = require_ui_user(identity)?;
    let whitelist = validate_settings(&update)?;
    let settings = repository.store_debug_settings(update.enabled, whitelist);

    auditor.log_event(
        crate::security::SecurityEvent::new(
            crate::security::SecurityEventType::DebugSettingsChanged,
            crate::security::SecuritySeverity::Low,
            Some(user_id.to_string()),
        )
        .with_resource("debug_settings")
        .with_detail("enabled", settings.enabled)
        .with_detail("whitelist_entries", settings.whitelist.len()),
    );
    Ok(settings)
}

/// Whether the public debug surfaces are open to `client_ip`.
pub fn public_access_allowed(settings: &DebugAccessSettings, client_ip: &str) -> bool {
    settings.enabled && is_ip_allowed_by_whitelist(client_ip, &settings.whitelist)
}

pub fn check_public_access(
    repository: &Repository,
    auditor: &SecurityAuditor,
    client_ip: &str,
    resource: &str,
) -> AppResult<()> {
    let settings = repository.debug_settings();
    if !settings.enabled {
        return Err(AppError::forbidden("debug access is disabled"));
    }
    if !is_ip_allowed_by_whitelist(client_ip, &settings.whitelist) {
        auditor.log_whitelist_denied(client_ip, resource);
        return Err(AppError::forbidden("address not allowed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(enabled: bool, whitelist: &[&str]) -> DebugSettingsUpdate {
        DebugSettingsUpdate {
            enabled,
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ui() -> Identity {
        Identity::UiUser {
            user_id: "alice".to_string(),
        }
    }

    #[test]
    fn test_invalid_entry_rejected() {
        let err = validate_settings(&update(false, &["10.0.0.0/8", "10.0.0.0/33"])).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_enable_requires_whitelist() {
        assert!(validate_settings(&update(true, &[])).is_err());
        assert!(validate_settings(&update(true, &["  "])).is_err());
        assert!(validate_settings(&update(false, &[])).is_ok());
    }

    #[test]
    fn test_entries_trimmed_and_deduplicated() {
        let list = validate_settings(&update(true, &[" 10.0.0.1 ", "10.0.0.1", "::1"])).unwrap();
        assert_eq!(list, vec!["10.0.0.1".to_string(), "::1".to_string()]);
    }

    #[test]
    fn test_service_accounts_refused() {
        let repository = Repository::new();
        let service = Identity::ServiceAccount {
            id: "svc".to_string(),
            name: "bot".to_string(),
        };
        let err = read_settings(&repository, &service).unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(read_settings(&repository, &ui()).is_ok());
    }

    #[test]
    fn test_update_and_gate() {
        let repository = Repository::new();
        let auditor = SecurityAuditor::new();

        assert!(check_public_access(&repository, &auditor, "192.168.1.5", "catalogue").is_err());

        update_settings(&repository, &auditor, &ui(), update(true, &["192.168.1.0/24"])).unwrap();
        assert!(check_public_access(&repository, &auditor, "192.168.1.5", "catalogue").is_ok());
        assert!(check_public_access(&repository, &auditor, "192.168.2.5", "catalogue").is_err());
        assert!(public_access_allowed(&repository.debug_settings(), "::ffff:192.168.1.9"));
    }
}
