//! Error types for construction and dispatch.
//!
//! # Design Decisions
//! - Two disjoint classes: `ConfigError` can only occur while building a
//!   route tree, `RequestError` only while dispatching a request.
//! - A failed build installs nothing; the previous generation keeps serving.
//! - `RequestError::is_transient` decides failover eligibility in one place
//!   so resilience policies cannot disagree about it.

use thiserror::Error;

/// Construction-time error. Carries the policy name and the dotted path of
/// the offending config node so operators can find it in a large document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid route config at `{path}` ({policy}): {reason}")]
pub struct ConfigError {
    /// Policy name being built when the error was found.
    pub policy: String,
    /// Dotted path into the configuration document.
    pub path: String,
    /// Human-readable cause.
    pub reason: String,
}

impl ConfigError {
    pub fn new(
        policy: impl Into<String>,
        path: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            policy: policy.into(),
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Dispatch-time error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Backend could not be reached or refused the request.
    #[error("destination {destination} unavailable: {reason}")]
    Unavailable {
        destination: String,
        reason: String,
    },

    /// The send primitive reported a timeout.
    #[error("request to {destination} timed out")]
    Timeout { destination: String },

    /// Malformed request; retrying elsewhere cannot help.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Rejected by an admission policy. Terminal so that failover does not
    /// amplify load on an already saturated subtree.
    #[error("request throttled by {0} limit")]
    Throttled(&'static str),

    /// Error produced by the routing tree itself rather than a backend.
    #[error("{0}")]
    Local(String),
}

impl RequestError {
    /// Transient errors are eligible for failover; terminal errors surface
    /// immediately and are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RequestError::Unavailable { .. } | RequestError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let unavailable = RequestError::Unavailable {
            destination: "pool-a[0]".into(),
            reason: "connection refused".into(),
        };
        let timeout = RequestError::Timeout {
            destination: "pool-a[1]".into(),
        };
        assert!(unavailable.is_transient());
        assert!(timeout.is_transient());

        assert!(!RequestError::BadRequest("empty key".into()).is_transient());
        assert!(!RequestError::Throttled("rate").is_transient());
        assert!(!RequestError::Local("no tree installed".into()).is_transient());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("hash", "route.children[2]", "`salt` must be a string");
        let text = err.to_string();
        assert!(text.contains("route.children[2]"));
        assert!(text.contains("hash"));
    }
}
