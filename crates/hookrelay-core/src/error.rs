//! Error types for hookrelay operations.
//!
//! Every error carries a stable [`ErrorCode`] so the HTTP layer and log
//! consumers can match on it without parsing messages.

use thiserror::Error;

/// Result type alias for hookrelay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Main error type for all hookrelay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Signature missing, malformed or not matching the subscription secret.
    #[error("Authentication error: {message}")]
    Authentication { message: String, code: ErrorCode },

    /// Subscription or event does not exist.
    #[error("Not found: {message}")]
    NotFound {
        message: String,
        code: ErrorCode,
        resource_id: Option<String>,
    },

    /// Subscription exists but is switched off.
    #[error("Subscription inactive: {subscription_id}")]
    Inactive { subscription_id: String },

    /// Input validation failed.
    #[error("Validation error: {message}")]
    Validation { message: String, code: ErrorCode },

    /// Dispatch queue is at capacity.
    #[error("Dispatch queue is full")]
    Backpressure,

    /// Dispatch queue no longer accepts jobs.
    #[error("Dispatch queue is shut down")]
    Shutdown,

    /// A single delivery attempt failed.
    #[error("Delivery error: {message}")]
    Delivery {
        message: String,
        status: Option<u16>,
        transient: bool,
    },

    /// The attempt budget for a pair has been used up.
    #[error("Attempt budget exhausted after {attempts} attempts")]
    BudgetExhausted { attempts: u32 },

    /// A write raced with another write for the same record.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache backend failed.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Authentication (AUTH_xxx)
    AuthMissingSignature,
    AuthInvalidSignature,
    AuthMissingSecret,

    // Lookup (NF_xxx)
    SubscriptionNotFound,
    EventNotFound,

    // Validation (VAL_xxx)
    ValInvalidInput,
    ValMissingField,
    ValEventTypeRejected,
    ValSubscriptionInactive,

    // Queue (QUEUE_xxx)
    QueueFull,
    QueueClosed,

    // Delivery (DLV_xxx)
    DeliveryFailed,
    DeliveryBudgetExhausted,

    // Database (DB_xxx)
    DbConnectionFailed,
    DbOperationFailed,
    DbConflict,

    // Cache
    CacheFailed,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthMissingSignature => "AUTH_001",
            ErrorCode::AuthInvalidSignature => "AUTH_002",
            ErrorCode::AuthMissingSecret => "AUTH_003",
            ErrorCode::SubscriptionNotFound => "NF_001",
            ErrorCode::EventNotFound => "NF_002",
            ErrorCode::ValInvalidInput => "VAL_001",
            ErrorCode::ValMissingField => "VAL_002",
            ErrorCode::ValEventTypeRejected => "VAL_003",
            ErrorCode::ValSubscriptionInactive => "VAL_004",
            ErrorCode::QueueFull => "QUEUE_001",
            ErrorCode::QueueClosed => "QUEUE_002",
            ErrorCode::DeliveryFailed => "DLV_001",
            ErrorCode::DeliveryBudgetExhausted => "DLV_002",
            ErrorCode::DbConnectionFailed => "DB_001",
            ErrorCode::DbOperationFailed => "DB_002",
            ErrorCode::DbConflict => "DB_003",
            ErrorCode::CacheFailed => "CACHE_001",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl RelayError {
    /// Create an authentication error for a signature that did not verify.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            code: ErrorCode::AuthInvalidSignature,
        }
    }

    /// Create an authentication error for a request without a signature.
    pub fn missing_signature() -> Self {
        Self::Authentication {
            message: "Missing signature header".to_string(),
            code: ErrorCode::AuthMissingSignature,
        }
    }

    /// Create an authentication error for a subscription that cannot verify.
    pub fn missing_secret(subscription_id: &str) -> Self {
        Self::Authentication {
            message: format!("Subscription '{}' has no signing secret", subscription_id),
            code: ErrorCode::AuthMissingSecret,
        }
    }

    /// Create a not found error for a subscription.
    pub fn subscription_not_found(subscription_id: impl Into<String>) -> Self {
        let id = subscription_id.into();
        Self::NotFound {
            message: format!("Subscription '{}' not found", id),
            code: ErrorCode::SubscriptionNotFound,
            resource_id: Some(id),
        }
    }

    /// Create a not found error for an event.
    pub fn event_not_found(event_id: impl Into<String>) -> Self {
        let id = event_id.into();
        Self::NotFound {
            message: format!("Event '{}' not found", id),
            code: ErrorCode::EventNotFound,
            resource_id: Some(id),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code: ErrorCode::ValInvalidInput,
        }
    }

    /// Create a validation error for a missing field.
    pub fn missing_field(field: &str) -> Self {
        Self::Validation {
            message: format!("Missing required field: {}", field),
            code: ErrorCode::ValMissingField,
        }
    }

    /// Create a validation error for an event the subscription filters out.
    pub fn event_type_rejected(event_type: &str, accepted: &str) -> Self {
        Self::Validation {
            message: format!(
                "Event type '{}' is not accepted by this subscription (accepts '{}')",
                event_type, accepted
            ),
            code: ErrorCode::ValEventTypeRejected,
        }
    }

    /// Create a delivery error that should be retried.
    pub fn transient(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Delivery {
            message: message.into(),
            status,
            transient: true,
        }
    }

    /// Create a delivery error that should not be retried.
    pub fn permanent(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Delivery {
            message: message.into(),
            status,
            transient: false,
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            code: ErrorCode::DbOperationFailed,
            source: None,
        }
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Authentication { code, .. } => *code,
            Self::NotFound { code, .. } => *code,
            Self::Validation { code, .. } => *code,
            Self::Database { code, .. } => *code,
            Self::Inactive { .. } => ErrorCode::ValSubscriptionInactive,
            Self::Backpressure => ErrorCode::QueueFull,
            Self::Shutdown => ErrorCode::QueueClosed,
            Self::Delivery { .. } => ErrorCode::DeliveryFailed,
            Self::BudgetExhausted { .. } => ErrorCode::DeliveryBudgetExhausted,
            Self::Conflict { .. } => ErrorCode::DbConflict,
            Self::Cache(_) => ErrorCode::CacheFailed,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether a failed delivery may be attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Delivery { transient: true, .. })
    }

    /// HTTP status attached to a delivery failure, if the endpoint answered.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Delivery { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            message: err.to_string(),
            code: ErrorCode::DbOperationFailed,
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = RelayError::subscription_not_found("sub-1");
        assert_eq!(err.code(), ErrorCode::SubscriptionNotFound);
        assert!(err.to_string().contains("sub-1"));
    }

    #[test]
    fn test_delivery_error_classification() {
        let transient = RelayError::transient("HTTP 500", Some(500));
        assert!(transient.is_transient());
        assert_eq!(transient.http_status(), Some(500));

        let permanent = RelayError::permanent("HTTP 404", Some(404));
        assert!(!permanent.is_transient());
        assert!(!RelayError::Backpressure.is_transient());
    }

    #[test]
    fn test_error_code_as_str() {
        assert_eq!(ErrorCode::AuthInvalidSignature.as_str(), "AUTH_002");
        assert_eq!(ErrorCode::SubscriptionNotFound.as_str(), "NF_001");
        assert_eq!(RelayError::Backpressure.code().as_str(), "QUEUE_001");
    }
}
