//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gate_common::GateError;
use gate_fabric::Completion;

/// Handler error wrapper
#[derive(Debug)]
pub struct ApiError(pub GateError);

/// Handler result type
pub type ApiResult<T> = Result<T, ApiError>;

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::debug!(error = %self.0, "request failed");
        }
        (status, Json(self.0.to_body())).into_response()
    }
}

/// Response for a resolved mutation
///
/// Failed jobs answer with their result and log; other failures pass the
/// upstream status and body through.
pub fn completion_response(completion: Completion) -> Response {
    let status = StatusCode::from_u16(completion.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if completion.is_success() {
        return (status, Json(completion.body)).into_response();
    }

    let body = completion.body;
    let error = match (body.get("result"), body.get("log")) {
        (Some(result), Some(log)) => GateError::JobFailed {
            exit_status: result["exitstatus"].as_str().unwrap_or_default().to_string(),
            result: result.clone(),
            log: log.clone(),
        },
        _ => GateError::Upstream {
            status: completion.status,
            body,
        },
    };
    ApiError(error).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError(GateError::Unauthenticated).into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError(GateError::denied("cores exhausted", json!({ "cores": 4 }))).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let upstream = GateError::Upstream {
            status: 403,
            body: json!({ "errors": "Permission check failed" }),
        };
        assert_eq!(ApiError(upstream).into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_completion_response() {
        let ok = Completion {
            status: 200,
            body: json!({ "result": { "exitstatus": "OK" }, "log": [] }),
        };
        assert_eq!(completion_response(ok).status(), StatusCode::OK);

        let running = Completion {
            status: 202,
            body: json!({ "upid": "UPID:pve1:1", "status": "running" }),
        };
        assert_eq!(completion_response(running).status(), StatusCode::ACCEPTED);

        let failed = Completion {
            status: 500,
            body: json!({ "result": { "exitstatus": "command failed" }, "log": [] }),
        };
        assert_eq!(completion_response(failed).status(), StatusCode::INTERNAL_SERVER_ERROR);

        let rejected = Completion {
            status: 400,
            body: json!({ "errors": { "cores": "value too large" } }),
        };
        assert_eq!(completion_response(rejected).status(), StatusCode::BAD_REQUEST);
    }
}
