use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures while establishing a usable credential. Fatal to a scan run.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("interactive consent is unavailable: {0}")]
    ConsentUnavailable(String),

    #[error("consent flow failed: {0}")]
    Consent(String),

    #[error("consent flow timed out after {}s", .0.as_secs())]
    ConsentTimedOut(Duration),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("stored credential is unreadable: {0}")]
    CorruptCredential(String),

    #[error("failed to persist credential: {0}")]
    Persist(String),
}

/// Errors surfaced by the mail service boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limiting, network faults and 5xx responses.
    #[error("transient service error: {0}")]
    Transient(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("request was not authorized: {0}")]
    Unauthorized(String),

    #[error("service error: {0}")]
    Service(String),
}

impl MailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::Transient(_))
    }
}

/// The spam model could not be loaded. Fatal at startup.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model artifact {artifact}: {source}")]
    Parse {
        artifact: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported {artifact} format version {found} (expected {expected})")]
    UnsupportedVersion {
        artifact: String,
        found: u32,
        expected: u32,
    },

    #[error("invalid model artifact: {0}")]
    Invalid(String),
}

/// Terminal errors of a scan run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("could not connect to the mail service: {0}")]
    Connection(MailError),

    #[error("failed to list messages: {0}")]
    Listing(MailError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(MailError::Transient("429".into()).is_transient());
        assert!(!MailError::NotFound("m1".into()).is_transient());
        assert!(!MailError::Conflict("label".into()).is_transient());
        assert!(!MailError::Service("400".into()).is_transient());
    }

    #[test]
    fn test_consent_timeout_message_reports_seconds() {
        let err = AuthError::ConsentTimedOut(Duration::from_secs(300));
        assert_eq!(err.to_string(), "consent flow timed out after 300s");
    }
}
