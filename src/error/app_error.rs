use thiserror::Error;

use crate::homescript::ScriptError;

/// Unified application error type returned by every HTTP surface.
#[derive(Debug, Error)]
pub enum AppError {
    // Authentication and authorization errors
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    // Lookup errors
    #[error("Script not found: {endpoint}")]
    ScriptNotFound { endpoint: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    // Validation errors
    #[error("Input validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    // Script execution errors
    #[error("{0}")]
    Script(ScriptError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Convert to HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            // Client errors (4xx)
            AppError::AuthenticationRequired => 401,
            AppError::AuthenticationFailed { .. } => 401,
            AppError::Forbidden { .. } => 403,
            AppError::ScriptNotFound { .. } => 404,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::Validation { .. } => 400,
            AppError::RateLimitExceeded { .. } => 429,
            AppError::Script(err) => err.status,

            // Server errors (5xx)
            AppError::Internal { .. } => 500,
        }
    }

    /// Source line for script failures
    pub fn line(&self) -> Option<usize> {
        match self {
            AppError::Script(err) => err.line,
            _ => None,
        }
    }

    /// Message safe to show to the caller. Internal details stay in the log.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Internal { .. } => "Internal server error".to_string(),
            AppError::Script(err) => err.message.clone(),
            other => other.to_string(),
        }
    }
}

// Conversion implementations from layer error types

impl From<ScriptError> for AppError {
    fn from(err: ScriptError) -> Self {
        AppError::Script(err)
    }
}

impl From<crate::repository::RepositoryError> for AppError {
    fn from(err: crate::repository::RepositoryError) -> Self {
        use crate::repository::RepositoryError;
        match err {
            RepositoryError::ScriptNotFound(endpoint) => AppError::ScriptNotFound { endpoint },
            RepositoryError::ServiceAccountNotFound(id) => AppError::NotFound {
                what: format!("service account {}", id),
            },
            RepositoryError::EndpointTaken(endpoint) => AppError::Conflict {
                message: format!("endpoint '{}' is already in use", endpoint),
            },
            RepositoryError::InvalidEndpoint(endpoint) => AppError::Validation {
                field: "endpoint".to_string(),
                reason: format!("'{}' is not a valid endpoint", endpoint),
            },
            RepositoryError::InvalidData(msg) => AppError::Validation {
                field: "data".to_string(),
                reason: msg,
            },
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation {
            field: "json".to_string(),
            reason: err.to_string(),
        }
    }
}

// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::homescript::ScriptErrorKind;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(AppError::AuthenticationRequired.status_code(), 401);
        assert_eq!(AppError::validation("test", "invalid").status_code(), 400);
        assert_eq!(
            AppError::RateLimitExceeded {
                retry_after_secs: 3
            }
            .status_code(),
            429
        );
        assert_eq!(AppError::forbidden("no").status_code(), 403);
        assert_eq!(AppError::internal("test").status_code(), 500);
    }

    #[test]
    fn test_script_error_keeps_status_and_line() {
        let err: AppError = ScriptError::new(ScriptErrorKind::Raised, "nope")
            .with_status(418)
            .at_line(7)
            .into();
        assert_eq!(err.status_code(), 418);
        assert_eq!(err.line(), Some(7));
        assert_eq!(err.public_message(), "nope");
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = AppError::internal("lock poisoned at foo.rs:12");
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn test_conversions() {
        let repo_err = crate::repository::RepositoryError::EndpointTaken("x".to_string());
        let app_err: AppError = repo_err.into();
        assert_eq!(app_err.status_code(), 409);

        let repo_err = crate::repository::RepositoryError::ScriptNotFound("x".to_string());
        let app_err: AppError = repo_err.into();
        assert!(matches!(app_err, AppError::ScriptNotFound { .. }));

        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let app_err: AppError = json_err.into();
        assert!(matches!(app_err, AppError::Validation { .. }));
    }
}
