use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use provision_core::error::ProvisionError;

// ---------------------------------------------------------------------------
// Internal sentinels for statuses ProvisionError does not carry
// ---------------------------------------------------------------------------

/// Carries an explicit 401 through the `anyhow::Error` chain.
#[derive(Debug)]
struct UnauthorizedError(String);

impl std::fmt::Display for UnauthorizedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UnauthorizedError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// Construct a 400 Bad Request error with the given message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(ProvisionError::Validation(msg.into()).into())
    }

    /// Construct a 401 Unauthorized error.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self(UnauthorizedError(msg.into()).into())
    }
}

/// HTTP status for a core error.
pub fn status_for(err: &ProvisionError) -> StatusCode {
    match err {
        ProvisionError::Validation(_) => StatusCode::BAD_REQUEST,
        ProvisionError::PolicyNotFound(_) | ProvisionError::RunNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ProvisionError::PolicyDenied { .. } | ProvisionError::CredentialDenied(_) => {
            StatusCode::FORBIDDEN
        }
        ProvisionError::CredentialBrokerUnavailable(_) | ProvisionError::AuditWriteFailure(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ProvisionError::RunConflict(_) => StatusCode::CONFLICT,
        ProvisionError::Backend { .. } => StatusCode::BAD_GATEWAY,
        ProvisionError::Cancelled
        | ProvisionError::UnknownModule(_)
        | ProvisionError::InvalidTransition { .. }
        | ProvisionError::Store(_)
        | ProvisionError::Config(_)
        | ProvisionError::Io(_)
        | ProvisionError::Yaml(_)
        | ProvisionError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(u) = self.0.downcast_ref::<UnauthorizedError>() {
            let body = serde_json::json!({ "error": u.0.clone() });
            return (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response();
        }

        let Some(e) = self.0.downcast_ref::<ProvisionError>() else {
            tracing::error!(error = %self.0, "unhandled error");
            let body = serde_json::json!({ "error": "internal error", "kind": "internal" });
            return (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response();
        };

        let status = status_for(e);
        let kind = match e {
            ProvisionError::RunNotFound(_) => "run_not_found",
            ProvisionError::RunConflict(_) => "run_conflict",
            other => other.kind().as_str(),
        };
        // Client errors carry their reason; anything else only its kind.
        let message = if status.is_client_error() {
            e.to_string()
        } else {
            tracing::error!(error = %e, kind, "request failed");
            kind.replace('_', " ")
        };
        let body = serde_json::json!({ "error": message, "kind": kind });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn validation_maps_to_400() {
        let err = AppError(ProvisionError::Validation("bad service".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn policy_not_found_maps_to_404() {
        let err = AppError(ProvisionError::PolicyNotFound("nope".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn run_not_found_maps_to_404() {
        let err = AppError(ProvisionError::RunNotFound("req-1".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn policy_denied_maps_to_403() {
        let err = AppError(
            ProvisionError::PolicyDenied {
                bundle: "sbx_default".into(),
                reason: "environment PROD not allowed".into(),
            }
            .into(),
        );
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn credential_denied_maps_to_403() {
        let err = AppError(ProvisionError::CredentialDenied("scope".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn broker_unavailable_maps_to_503() {
        let err = AppError(ProvisionError::CredentialBrokerUnavailable("down".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn run_conflict_maps_to_409() {
        let err = AppError(ProvisionError::RunConflict("already COMPLETE".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn store_error_maps_to_500() {
        let err = AppError(ProvisionError::Store("table missing".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn non_provision_error_maps_to_500() {
        let err = AppError(anyhow::anyhow!("something unexpected"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unauthorized_constructor_maps_to_401() {
        let err = AppError::unauthorized("missing bearer token");
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn bad_request_constructor_maps_to_400() {
        let err = AppError::bad_request("malformed body");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn response_body_is_json() {
        let err = AppError(ProvisionError::RunNotFound("req-1".into()).into());
        let response = err.into_response();
        let ct = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .expect("should have content-type");
        assert!(
            ct.to_str().unwrap().contains("application/json"),
            "expected JSON content type, got {:?}",
            ct
        );
    }
}
