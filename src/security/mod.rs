pub mod audit;
pub mod credentials;
pub mod ip_whitelist;
pub mod rate_limiting;

pub use audit::{SecurityAuditor, SecurityEvent, SecurityEventType, SecuritySeverity};
pub use credentials::{CredentialError, CredentialStore, hash_secret, is_hashed, verify_secret};
pub use ip_whitelist::{is_ip_allowed_by_whitelist, is_valid_ip_or_cidr, normalize_request_ip};
pub use rate_limiting::{
    AuthFailureTracker, RateLimitConfig, RateLimitDecision, RateLimitKey, RateLimiter, Sweepable,
    spawn_sweeper,
};
