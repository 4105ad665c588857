/*!
 * Calendar Aggregator Error Types
 *
 * Error taxonomy for the aggregation engine and the two-tier event cache.
 * Operational errors (per-source network/auth/protocol failures, cache I/O)
 * are surfaced as data, never as panics; programming errors (unknown source,
 * unsupported source type, schema mismatch) raise synchronously.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for calendar aggregator operations.
pub type CalendarResult<T> = Result<T, CalendarError>;

/// Calendar aggregator error types.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum CalendarError {
    /// Adapter could not reach the remote source.
    #[error("Network error for source {source_id}: {message}")]
    NetworkError {
        message: String,
        source_id: String,
        is_timeout: bool,
    },

    /// Adapter authentication/authorization with the remote source failed.
    #[error("Authentication error for source {source_id}: {message}")]
    AuthError { message: String, source_id: String },

    /// Adapter received a response it could not interpret.
    #[error("Protocol error for source {source_id}: {message}")]
    ProtocolError { message: String, source_id: String },

    /// A single raw event could not be normalized; the adapter drops it and
    /// continues with the rest of the fetch.
    #[error("Normalization error for source {source_id}: {message}")]
    NormalizationError { message: String, source_id: String },

    /// Persistent-index or memory-tier I/O failure. A failed cache write does
    /// not invalidate events already returned to the caller.
    #[error("Cache I/O error: {message}")]
    CacheError { message: String, operation: String },

    /// Invalid source configuration (missing fields, malformed URL, ...).
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String, field: Option<String> },

    /// No adapter is registered for the source's `type`.
    #[error("Unsupported source type: {source_type}")]
    UnsupportedSourceType { source_type: String },

    /// Operation referenced a source id that is not in the registry.
    #[error("Source not found: {source_id}")]
    SourceNotFound { source_id: String },

    /// The on-disk store's schema version does not match what this build
    /// expects. Fatal for the `EventCache` instance being constructed.
    #[error("Schema mismatch: on-disk version {found}, expected {expected}")]
    SchemaMismatch { found: i64, expected: i64 },

    /// Catch-all for errors from lower layers not otherwise modeled above.
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl CalendarError {
    /// Whether a Fetch Coordinator retry makes sense for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CalendarError::NetworkError { .. } | CalendarError::ProtocolError { .. }
        )
    }

    /// Whether the error message should read as a timeout per spec.md §7/§8
    /// ("error containing the substring `timeout`").
    pub fn is_timeout(&self) -> bool {
        matches!(self, CalendarError::NetworkError { is_timeout: true, .. })
    }

    pub fn network(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into(), source_id: source_id.into(), is_timeout: false }
    }

    pub fn timeout(source_id: impl Into<String>, after: std::time::Duration) -> Self {
        Self::NetworkError {
            message: format!("operation timed out after {:?}", after),
            source_id: source_id.into(),
            is_timeout: true,
        }
    }

    pub fn cache(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CacheError { message: message.into(), operation: operation.into() }
    }

    /// Coarse severity for log-level selection and alerting thresholds.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CalendarError::AuthError { .. } => ErrorSeverity::High,
            CalendarError::SchemaMismatch { .. } => ErrorSeverity::High,
            CalendarError::ConfigurationError { .. } => ErrorSeverity::Medium,
            CalendarError::UnsupportedSourceType { .. } => ErrorSeverity::Medium,
            CalendarError::SourceNotFound { .. } => ErrorSeverity::Medium,
            CalendarError::NetworkError { .. } => ErrorSeverity::Low,
            CalendarError::ProtocolError { .. } => ErrorSeverity::Low,
            CalendarError::NormalizationError { .. } => ErrorSeverity::Low,
            CalendarError::CacheError { .. } => ErrorSeverity::Medium,
            CalendarError::InternalError { .. } => ErrorSeverity::Medium,
        }
    }
}

/// Severity tier for monitoring and alerting; not used to change control
/// flow, only log levels at the call site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<sqlx::Error> for CalendarError {
    fn from(error: sqlx::Error) -> Self {
        CalendarError::CacheError { message: error.to_string(), operation: "sqlite".to_string() }
    }
}

impl From<serde_json::Error> for CalendarError {
    fn from(error: serde_json::Error) -> Self {
        CalendarError::InternalError { message: format!("serialization error: {}", error) }
    }
}

impl From<reqwest::Error> for CalendarError {
    fn from(error: reqwest::Error) -> Self {
        CalendarError::NetworkError {
            message: error.to_string(),
            source_id: "unknown".to_string(),
            is_timeout: error.is_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_retryable() {
        let err = CalendarError::network("s1", "connection refused");
        assert!(err.is_retryable());
    }

    #[test]
    fn auth_errors_are_high_severity() {
        let err = CalendarError::AuthError { message: "denied".to_string(), source_id: "s1".to_string() };
        assert_eq!(err.severity(), ErrorSeverity::High);
    }

    #[test]
    fn network_errors_are_low_severity() {
        let err = CalendarError::network("s1", "connection refused");
        assert_eq!(err.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = CalendarError::SourceNotFound { source_id: "s1".to_string() };
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_message_contains_substring() {
        let err = CalendarError::timeout("s1", std::time::Duration::from_secs(1));
        assert!(err.to_string().to_lowercase().contains("timeout"));
    }
}
