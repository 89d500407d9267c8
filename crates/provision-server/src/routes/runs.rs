use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use provision_core::response::{Explanation, StatusView};

use crate::error::AppError;
use crate::routes::provision::run_response;
use crate::state::AppState;

/// GET /status/{run_id}: state, steps, transitions and the composed response.
pub async fn get_status(
    State(app): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<StatusView>, AppError> {
    let orchestrator = app.orchestrator.clone();
    let view = tokio::task::spawn_blocking(move || orchestrator.status(&run_id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(view))
}

/// GET /explain/{run_id}: bundle rationale and the ordered audit trail.
pub async fn get_explanation(
    State(app): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Explanation>, AppError> {
    let orchestrator = app.orchestrator.clone();
    let explanation = tokio::task::spawn_blocking(move || orchestrator.explain(&run_id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(explanation))
}

/// POST /cancel/{run_id}: request cancellation.
///
/// 202 while the run is still winding down, 200 once it has failed.
/// Runs on the request task for the same reason as `provision`.
pub async fn cancel_run(
    State(app): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, AppError> {
    let run = app.orchestrator.cancel(&run_id).await?;
    Ok(run_response(&run))
}
