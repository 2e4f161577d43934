//! Error types for the reconciliation pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fallback::DataSource;
use crate::run::TargetId;

/// Result type alias using the ratesync error type.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Main error type for the reconciliation pipeline.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Local product read failed or produced nothing to export
    #[error("Product data unavailable: {0}")]
    DataUnavailable(String),

    /// Product submission was not acknowledged
    #[error("Product submission failed: {}", .0.to_error_message())]
    TransmissionFailed(FailureReason),

    /// Rate retrieval from a data source failed
    #[error("Fetching rates from {data_source} failed: {}", reason.to_error_message())]
    FetchFailed {
        data_source: DataSource,
        reason: FailureReason,
    },

    /// Envelope could not be authenticated or decrypted
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Sanitized script did not survive a second sanitizing pass unchanged
    #[error("Sanitized script is not stable under re-sanitization")]
    SanitizationUnstable,

    /// A statement failed; the transaction was rolled back
    #[error("Statement {index} failed: {message}")]
    SqlExecutionFailed {
        /// Zero-based statement index. Equal to the number of statements
        /// when the final `COMMIT` failed, with `statement` set to `COMMIT`.
        index: usize,
        statement: String,
        message: String,
    },

    /// Pre-flight connectivity check against the target failed
    #[error("Database connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// Another run holds the lock for this target
    #[error("A reconciliation run is already active for target '{0}'")]
    AlreadyRunning(TargetId),

    /// Caller cancelled the run
    #[error("Reconciliation run cancelled")]
    Cancelled,

    /// No license session has been published
    #[error("No license session available")]
    SessionUnavailable,

    /// Session is present but unusable (missing identity fields)
    #[error("Invalid license session: {0}")]
    InvalidSession(String),

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// The worker task ended without producing an outcome
    #[error("Reconciliation worker terminated unexpectedly: {0}")]
    WorkerTerminated(String),

    /// Database driver error outside the transactional apply
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReconcileError {
    /// Discriminant used in run records and progress events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::DataUnavailable(_) => ErrorKind::DataUnavailable,
            ReconcileError::TransmissionFailed(_) => ErrorKind::TransmissionFailed,
            ReconcileError::FetchFailed { .. } => ErrorKind::FetchFailed,
            ReconcileError::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            ReconcileError::SanitizationUnstable => ErrorKind::SanitizationUnstable,
            ReconcileError::SqlExecutionFailed { .. } => ErrorKind::SqlExecutionFailed,
            ReconcileError::ConnectionUnavailable(_) => ErrorKind::ConnectionUnavailable,
            ReconcileError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            ReconcileError::Cancelled => ErrorKind::Cancelled,
            ReconcileError::SessionUnavailable | ReconcileError::InvalidSession(_) => {
                ErrorKind::InvalidSession
            }
            ReconcileError::Config(_) => ErrorKind::Config,
            ReconcileError::WorkerTerminated(_)
            | ReconcileError::Database(_)
            | ReconcileError::Serialization(_)
            | ReconcileError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Remote failure details, if this error came from the remote channel.
    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            ReconcileError::TransmissionFailed(reason) => Some(reason),
            ReconcileError::FetchFailed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Serializable error discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DataUnavailable,
    TransmissionFailed,
    FetchFailed,
    DecryptionFailed,
    SanitizationUnstable,
    SqlExecutionFailed,
    ConnectionUnavailable,
    AlreadyRunning,
    Cancelled,
    InvalidSession,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DataUnavailable => "data_unavailable",
            ErrorKind::TransmissionFailed => "transmission_failed",
            ErrorKind::FetchFailed => "fetch_failed",
            ErrorKind::DecryptionFailed => "decryption_failed",
            ErrorKind::SanitizationUnstable => "sanitization_unstable",
            ErrorKind::SqlExecutionFailed => "sql_execution_failed",
            ErrorKind::ConnectionUnavailable => "connection_unavailable",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidSession => "invalid_session",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeouts, connection failures, 5xx/408/429. Eligible for retry.
    Transient,
    /// 401/403. The license was rejected.
    Authorization,
    /// Malformed requests or responses. Retrying cannot help.
    Validation,
}

/// Reason why a remote operation failed.
///
/// Distinguishes failures that may succeed on retry from those that never will.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum FailureReason {
    /// Status that may succeed on retry (5xx, 408, 429).
    RetriableHttpStatus { status: u16, body: String },

    /// License identity was rejected (401, 403).
    AuthorizationRejected { status: u16, body: String },

    /// Any other non-success status.
    NonRetriableHttpStatus { status: u16, body: String },

    /// Timeout, connection reset or other transport-level failure.
    NetworkError { error: String },

    /// The remote answered successfully but the body could not be understood.
    MalformedResponse { error: String },

    /// The request could not be constructed before sending.
    RequestBuilderError { error: String },

    /// No endpoint or dataset is configured for the source.
    SourceNotConfigured { source: DataSource },
}

impl FailureReason {
    /// Classify an HTTP status that is not a positive acknowledgement.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => FailureReason::AuthorizationRejected { status, body },
            408 | 429 => FailureReason::RetriableHttpStatus { status, body },
            s if s >= 500 => FailureReason::RetriableHttpStatus { status, body },
            _ => FailureReason::NonRetriableHttpStatus { status, body },
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            FailureReason::RetriableHttpStatus { .. } | FailureReason::NetworkError { .. } => {
                FailureClass::Transient
            }
            FailureReason::AuthorizationRejected { .. } => FailureClass::Authorization,
            FailureReason::NonRetriableHttpStatus { .. }
            | FailureReason::MalformedResponse { .. }
            | FailureReason::RequestBuilderError { .. }
            | FailureReason::SourceNotConfigured { .. } => FailureClass::Validation,
        }
    }

    /// Returns true if this failure reason indicates the operation should be retried.
    pub fn is_retriable(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Returns a human-readable error message for this failure reason.
    pub fn to_error_message(&self) -> String {
        match self {
            FailureReason::RetriableHttpStatus { status, body } => {
                format!("remote returned retriable status code: {} - {}", status, body)
            }
            FailureReason::AuthorizationRejected { status, body } => {
                format!("license rejected by remote ({}): {}", status, body)
            }
            FailureReason::NonRetriableHttpStatus { status, body } => {
                format!("remote returned error status code: {} - {}", status, body)
            }
            FailureReason::NetworkError { error } => format!("Network error: {}", error),
            FailureReason::MalformedResponse { error } => {
                format!("Malformed response: {}", error)
            }
            FailureReason::RequestBuilderError { error } => {
                format!("Failed to build HTTP request: {}", error)
            }
            FailureReason::SourceNotConfigured { source } => {
                format!("No endpoint configured for {}", source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(FailureReason::from_status(503, String::new()).is_retriable());
        assert!(FailureReason::from_status(429, String::new()).is_retriable());
        assert!(FailureReason::from_status(408, String::new()).is_retriable());
        assert_eq!(
            FailureReason::from_status(401, String::new()).class(),
            FailureClass::Authorization
        );
        assert_eq!(
            FailureReason::from_status(403, String::new()).class(),
            FailureClass::Authorization
        );
        assert_eq!(
            FailureReason::from_status(404, String::new()).class(),
            FailureClass::Validation
        );
    }

    #[test]
    fn test_kind_mapping() {
        let err = ReconcileError::FetchFailed {
            data_source: DataSource::Primary,
            reason: FailureReason::NetworkError {
                error: "reset".into(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::FetchFailed);
        assert!(err.failure_reason().unwrap().is_retriable());
        assert_eq!(ReconcileError::Cancelled.kind().as_str(), "cancelled");
    }

    #[test]
    fn test_failure_reason_serializes_tagged() {
        let reason = FailureReason::RetriableHttpStatus {
            status: 502,
            body: "bad gateway".into(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["type"], "RetriableHttpStatus");
        assert_eq!(json["details"]["status"], 502);
    }
}
