// Service Account Credentials
// Salted argon2id hashing of service-account secrets, constant-time
// verification, and transparent migration of legacy plaintext rows.

use argon2::Argon2;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::repository::{Repository, RepositoryError, ServiceAccount};
use crate::security::{SecurityAuditor, SecurityEvent, SecurityEventType, SecuritySeverity};

/// Tag written in front of hashed secrets.
pub const HASH_ALGORITHM: &str = "argon2id";

const SALT_LEN: usize = 16;
const DERIVED_KEY_LEN: usize = 64;
const GENERATED_SECRET_BYTES: usize = 32;

/// Credential hashing errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Malformed stored secret")]
    MalformedHash,

    #[error("Invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Whether `stored` uses the tagged `algorithm$salt$hash` format.
pub fn is_hashed(stored: &str) -> bool {
    stored
        .strip_prefix(HASH_ALGORITHM)
        .map(|rest| rest.starts_with('$'))
        .unwrap_or(false)
}

fn derive_key(secret: &str, salt: &[u8], len: usize) -> Result<Vec<u8>, CredentialError> {
    let mut output = vec![0u8; len];
    Argon2::default()
        .hash_password_into(secret.as_bytes(), salt, &mut output)
        .map_err(|e| CredentialError::KeyDerivation(e.to_string()))?;
    Ok(output)
}

/// Hashes a secret with a fresh random salt.
pub fn hash_secret(secret: &str) -> Result<String, CredentialError> {
    let salt: [u8; SALT_LEN] = rand::random();
    let key = derive_key(secret, &salt, DERIVED_KEY_LEN)?;
    Ok(format!(
        "{}${}${}",
        HASH_ALGORITHM,
        hex::encode(salt),
        hex::encode(key)
    ))
}

/// Random secret handed out once when a service account is created.
pub fn generate_secret() -> String {
    let bytes: [u8; GENERATED_SECRET_BYTES] = rand::random();
    hex::encode(bytes)
}

fn verify_tagged(stored: &str, candidate: &str) -> Result<bool, CredentialError> {
    let parts: Vec<&str> = stored.split('$').collect();
    if parts.len() != 3 || parts[0] != HASH_ALGORITHM {
        return Err(CredentialError::MalformedHash);
    }

    let salt = hex::decode(parts[1])?;
    let expected = hex::decode(parts[2])?;
    if salt.is_empty() || expected.is_empty() {
        return Err(CredentialError::MalformedHash);
    }

    let computed = derive_key(candidate, &salt, expected.len())?;
    Ok(computed.ct_eq(&expected).into())
}

fn verify_legacy(stored: &str, candidate: &str) -> bool {
    let stored = stored.as_bytes();
    let candidate = candidate.as_bytes();
    // ct_eq needs equal-length inputs
    if stored.len() != candidate.len() {
        return false;
    }
    stored.ct_eq(candidate).into()
}

/// Checks `candidate` against a stored secret in either format.
///
/// Never fails: malformed rows and derivation errors count as a mismatch.
pub fn verify_secret(stored: &str, candidate: &str) -> bool {
    if is_hashed(stored) {
        match verify_tagged(stored, candidate) {
            Ok(matched) => matched,
            Err(e) => {
                debug!("Stored secret could not be verified: {}", e);
                false
            }
        }
    } else {
        verify_legacy(stored, candidate)
    }
}

/// Service-account credential operations over the repository.
#[derive(Clone)]
pub struct CredentialStore {
    repository: Arc<Repository>,
    auditor: SecurityAuditor,
}

impl CredentialStore {
    pub fn new(repository: Arc<Repository>, auditor: SecurityAuditor) -> Self {
        Self {
            repository,
            auditor,
        }
    }

    /// Creates an account with a generated secret. The plaintext secret is
    /// returned once; only its hash is stored.
    pub async fn create_service_account(
        &self,
        name: &str,
    ) -> Result<(ServiceAccount, String), RepositoryError> {
        let secret = generate_secret();
        let to_hash = secret.clone();
        let hashed = tokio::task::spawn_blocking(move || hash_secret(&to_hash))
            .await
            .map_err(|e| RepositoryError::InvalidData(format!("hashing task failed: {}", e)))?
            .map_err(|e| RepositoryError::InvalidData(e.to_string()))?;

        let account = self.repository.insert_service_account(name, hashed)?;
        Ok((account, secret))
    }

    /// Verifies `candidate` for account `id`, migrating a legacy plaintext
    /// row to hashed form on success.
    pub async fn verify(&self, id: &str, candidate: &str) -> Option<ServiceAccount> {
        let account = self.repository.get_service_account(id)?;
        let stored = account.secret.clone();
        let candidate_owned = candidate.to_string();

        let matched = tokio::task::spawn_blocking(move || verify_secret(&stored, &candidate_owned))
            .await
            .unwrap_or(false);

        if !matched {
            self.auditor.log_event(
                SecurityEvent::new(
                    SecurityEventType::AuthenticationFailure,
                    SecuritySeverity::Medium,
                    Some(id.to_string()),
                )
                .with_action("service_account_verify"),
            );
            return None;
        }

        if !is_hashed(&account.secret) {
            self.migrate_legacy_secret(&account, candidate).await;
        }

        self.repository.get_service_account(id)
    }

    async fn migrate_legacy_secret(&self, account: &ServiceAccount, secret: &str) {
        let secret = secret.to_string();
        let hashed = match tokio::task::spawn_blocking(move || hash_secret(&secret)).await {
            Ok(Ok(hashed)) => hashed,
            Ok(Err(e)) => {
                warn!(account_id = %account.id, "Failed to hash legacy secret: {}", e);
                return;
            }
            Err(e) => {
                warn!(account_id = %account.id, "Hashing task failed: {}", e);
                return;
            }
        };

        // Only replaces the exact legacy value, so a concurrent migration wins once.
        if self
            .repository
            .replace_service_account_secret(&account.id, &account.secret, hashed)
        {
            self.auditor.log_event(
                SecurityEvent::new(
                    SecurityEventType::CredentialMigrated,
                    SecuritySeverity::Low,
                    Some(account.id.clone()),
                )
                .with_action("legacy_secret_rehashed"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_format() {
        let hashed = hash_secret("s3cret").unwrap();
        let parts: Vec<&str> = hashed.split('$').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], HASH_ALGORITHM);
        assert_eq!(parts[1].len(), SALT_LEN * 2);
        assert_eq!(parts[2].len(), DERIVED_KEY_LEN * 2);
        assert!(is_hashed(&hashed));
    }

    #[test]
    fn test_hash_round_trip() {
        let hashed = hash_secret("correct horse").unwrap();
        assert!(verify_secret(&hashed, "correct horse"));
        assert!(!verify_secret(&hashed, "correct horsf"));
        assert!(!verify_secret(&hashed, ""));
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_secret("same").unwrap(), hash_secret("same").unwrap());
    }

    #[test]
    fn test_legacy_plaintext() {
        assert!(verify_secret("legacy-key", "legacy-key"));
        assert!(!verify_secret("legacy-key", "legacy-kez"));
        assert!(!verify_secret("legacy-key", "legacy-key-longer"));
        assert!(!is_hashed("legacy-key"));
    }

    #[test]
    fn test_malformed_tagged_rows_fail_closed() {
        assert!(!verify_secret("argon2id$abcd", "x"));
        assert!(!verify_secret("argon2id$$00ff", "x"));
        assert!(!verify_secret("argon2id$00ff$", "x"));
        assert!(!verify_secret("argon2id$zz$00ff", "x"));
        assert!(!verify_secret("argon2id$00$11$22", "x"));
        // Salt shorter than argon2 accepts
        assert!(!verify_secret("argon2id$00$00112233", "x"));
    }

    #[test]
    fn test_generated_secret() {
        let secret = generate_secret();
        assert_eq!(secret.len(), GENERATED_SECRET_BYTES * 2);
        assert_ne!(secret, generate_secret());
    }
}
