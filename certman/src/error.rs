use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failure reported by the CA or by the transport underneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// ACME problem type (e.g. `urn:ietf:params:acme:error:malformed`), or a
    /// transport-level code such as `connection` or `http-503`.
    pub code: String,
    pub detail: String,
    pub retryable: bool,
}

impl ProtocolError {
    pub fn transient(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            retryable: true,
        }
    }

    pub fn fatal(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            retryable: false,
        }
    }

    /// Build an error from an ACME problem document.
    ///
    /// Server-side failures (5xx) are retryable, everything the CA rejects on
    /// purpose is not.
    pub fn from_problem(problem_type: Option<&str>, detail: Option<&str>, status: Option<u16>) -> Self {
        let code = problem_type
            .map(str::to_string)
            .or_else(|| status.map(|s| format!("http-{s}")))
            .unwrap_or_else(|| "unknown".to_string());
        let retryable = matches!(status, Some(500..=599))
            || code.ends_with(":serverInternal");
        Self {
            code,
            detail: detail.unwrap_or_default().to_string(),
            retryable,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.code.ends_with(":rateLimited")
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.detail)
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no supported challenge for {domain} (offered: {offered:?})")]
    NoSupportedChallenge { domain: String, offered: Vec<String> },
    #[error("authorization failed for {domain}: {reason}")]
    AuthorizationFailed { domain: String, reason: String },
    #[error("vault integrity check failed for {bundle}: {reason}")]
    VaultIntegrity { bundle: String, reason: String },
    #[error("no certificate bundle matches {0}")]
    BundleNotFound(String),
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(u64),
    #[error("cannot roll back {requested} checkpoints, only {available} available")]
    InsufficientHistory { requested: usize, available: usize },
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn integrity(bundle: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::VaultIntegrity {
            bundle: bundle.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = ProtocolError::from_problem(
            Some("urn:ietf:params:acme:error:serverInternal"),
            Some("oops"),
            Some(500),
        );
        assert!(err.retryable);
        assert_eq!(err.to_string(), "urn:ietf:params:acme:error:serverInternal: oops");
    }

    #[test]
    fn rejections_are_fatal() {
        let err = ProtocolError::from_problem(
            Some("urn:ietf:params:acme:error:rateLimited"),
            None,
            Some(429),
        );
        assert!(!err.retryable);
        assert!(err.is_rate_limited());

        let err = ProtocolError::from_problem(None, None, Some(400));
        assert_eq!(err.code, "http-400");
        assert!(!err.retryable);
    }
}
