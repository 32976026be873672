//! Error types for fabricgate

use serde_json::{json, Value};
use thiserror::Error;

/// Request-scoped gateway error
///
/// Every variant is local to one request; none of them is fatal to the
/// process.
#[derive(Error, Debug)]
pub enum GateError {
    /// Missing or invalid session against the compute fabric
    #[error("user is not authenticated")]
    Unauthenticated,

    /// Admission check failed
    #[error("request denied: {reason}")]
    Denied {
        /// Human readable reason
        reason: String,
        /// The delta that was attempted
        request: Value,
    },

    /// Disk, device, interface or instance absent or in a disallowed state
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Fabric call errored or returned non-2xx for a synchronous operation
    #[error("upstream returned {status}")]
    Upstream {
        /// Upstream HTTP status
        status: u16,
        /// Upstream body, verbatim
        body: Value,
    },

    /// Asynchronous job reached a terminal failure state
    #[error("job finished with exit status {exit_status}")]
    JobFailed {
        /// Terminal exit status reported by the fabric
        exit_status: String,
        /// Job status object
        result: Value,
        /// Job log
        log: Value,
    },

    /// One of several identity backends failed mid-mutation
    #[error("backend {backend} failed: {message}")]
    PartialAggregation {
        /// Backend that reported the failure
        backend: String,
        /// Status reported by the backend
        status: u16,
        /// Message reported by the backend
        message: String,
    },

    /// Identity store failure
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            GateError::Unauthenticated => 401,
            GateError::Upstream { status, .. } => *status,
            GateError::PartialAggregation { status, .. } if *status >= 400 => *status,
            _ => 500,
        }
    }

    /// JSON body for this error
    pub fn to_body(&self) -> Value {
        match self {
            GateError::Denied { reason, request } => json!({
                "error": format!("request denied: {}", reason),
                "request": request,
            }),
            GateError::Upstream { body, .. } => body.clone(),
            GateError::JobFailed { result, log, .. } => json!({
                "error": self.to_string(),
                "result": result,
                "log": log,
            }),
            other => json!({ "error": other.to_string() }),
        }
    }

    /// Shorthand for a quota denial
    pub fn denied(reason: impl Into<String>, request: Value) -> Self {
        GateError::Denied {
            reason: reason.into(),
            request,
        }
    }
}

/// Result type for fabricgate
pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GateError::Unauthenticated.status_code(), 401);
        assert_eq!(GateError::denied("over quota", json!({})).status_code(), 500);
        assert_eq!(
            GateError::Upstream { status: 403, body: json!(null) }.status_code(),
            403
        );
        assert_eq!(GateError::InvalidTarget("scsi9".into()).status_code(), 500);
    }

    #[test]
    fn test_denied_body_carries_request() {
        let err = GateError::denied("cores exceeds available", json!({ "cores": 4 }));
        let body = err.to_body();
        assert_eq!(body["request"]["cores"], 4);
        assert!(body["error"].as_str().unwrap().contains("cores"));
    }

    #[test]
    fn test_upstream_body_verbatim() {
        let err = GateError::Upstream {
            status: 596,
            body: json!({ "errors": { "vmid": "bad" } }),
        };
        assert_eq!(err.to_body(), json!({ "errors": { "vmid": "bad" } }));
    }
}
