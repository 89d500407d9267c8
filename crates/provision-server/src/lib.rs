pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use provision_core::config::Config;
use provision_core::Orchestrator;
use tower_http::trace::TraceLayer;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let app_state = state::AppState::new(orchestrator);

    Router::new()
        .route("/health", get(routes::health::health))
        // Provisioning
        .route("/api/v1/provision", post(routes::provision::provision))
        // Runs
        .route("/status/{run_id}", get(routes::runs::get_status))
        .route("/api/v1/status/{run_id}", get(routes::runs::get_status))
        .route("/explain/{run_id}", get(routes::runs::get_explanation))
        .route("/api/v1/explain/{run_id}", get(routes::runs::get_explanation))
        .route("/cancel/{run_id}", post(routes::runs::cancel_run))
        .route("/api/v1/cancel/{run_id}", post(routes::runs::cancel_run))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Open the run store from `cfg`, bind the configured address and serve.
pub async fn serve(cfg: &Config) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(cfg)?;
    let listener = tokio::net::TcpListener::bind(cfg.server.addr()).await?;
    serve_on(orchestrator, listener).await
}

/// Serve on a pre-bound listener.
///
/// Starts the reconciler first. Its initial pass settles runs left behind by
/// a previous process before any new request is accepted.
pub async fn serve_on(
    orchestrator: Orchestrator,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;

    let reconciler = orchestrator.reconciler();
    let startup = reconciler.reconcile_once().await?;
    if !startup.is_empty() {
        tracing::warn!(
            flushed = startup.flushed,
            failed = startup.failed,
            still_held = startup.still_held,
            errors = startup.errors,
            "settled runs from a previous process"
        );
    }
    tokio::spawn(reconciler.run(orchestrator.settings().reconcile_interval));

    let app = build_router(orchestrator);
    tracing::info!("provisioning orchestrator listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
