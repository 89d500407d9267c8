use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use provision_core::request::ProvisionPayload;
use provision_core::response::RunResponse;
use provision_core::run::{OrchestrationRun, RunStatus};
use provision_core::ErrorKind;

use crate::auth::Bearer;
use crate::error::AppError;
use crate::state::AppState;

/// POST /api/v1/provision: accept a provisioning request.
///
/// Validation errors are rejected before a run exists. Everything after that
/// is answered with the composed run response; denials keep `run_id` and
/// `audit_reference` so the caller can look up the trail.
///
/// `submit` interleaves short redb writes with awaited broker calls, so it
/// runs on the request task rather than under `spawn_blocking`.
pub async fn provision(
    State(app): State<AppState>,
    Bearer(bearer): Bearer,
    payload: Result<Json<ProvisionPayload>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(payload) = payload.map_err(|e| AppError::bad_request(e.body_text()))?;
    let run = app.orchestrator.submit(payload, bearer).await?;
    Ok(run_response(&run))
}

/// HTTP status for a run as it currently stands.
pub fn status_for_run(run: &OrchestrationRun) -> StatusCode {
    match run.status() {
        RunStatus::InProgress => StatusCode::ACCEPTED,
        RunStatus::Complete => StatusCode::OK,
        RunStatus::Failed => match run.failure.as_ref().map(|f| f.kind) {
            Some(ErrorKind::PolicyNotFound) => StatusCode::NOT_FOUND,
            Some(ErrorKind::PolicyDenied | ErrorKind::CredentialDenied) => StatusCode::FORBIDDEN,
            Some(ErrorKind::CredentialUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::OK,
        },
    }
}

/// Composed response with the status from `status_for_run`. Non-2xx bodies
/// also carry an `error` field naming the failure kind.
pub fn run_response(run: &OrchestrationRun) -> Response {
    let status = status_for_run(run);
    let body = RunResponse::from_run(run);
    if status.is_success() {
        return (status, Json(body)).into_response();
    }
    match serde_json::to_value(&body) {
        Ok(mut value) => {
            let kind = run
                .failure
                .as_ref()
                .map(|f| f.kind.as_str())
                .unwrap_or("internal");
            value["error"] = serde_json::json!(kind);
            (status, Json(value)).into_response()
        }
        Err(e) => AppError(e.into()).into_response(),
    }
}
