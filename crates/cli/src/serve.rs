//! `runsync serve`: periodic sync driver plus an HTTP trigger hook.
//!
//! Endpoints:
//! - GET  /health               - Server status
//! - POST /runs/{run_id}/sync   - Sync one run now (200 synced, 404 not
//!   found, 502 engine or storage failure)
//!
//! All responses use Content-Type: application/json.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use runsync_core::{spawn_sync_driver, SyncOrchestrator, TriggerResponse};
use runsync_engine::ExecutionEngine;
use runsync_storage::SyncStorage;

/// Application state shared across request handlers.
pub(crate) struct AppState<E, S> {
    pub(crate) orchestrator: Arc<SyncOrchestrator<E, S>>,
}

/// Build the HTTP router over a shared orchestrator.
pub(crate) fn router<E, S>(orchestrator: Arc<SyncOrchestrator<E, S>>) -> Router
where
    E: ExecutionEngine,
    S: SyncStorage,
{
    let state = Arc::new(AppState { orchestrator });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/runs/{run_id}/sync", post(handle_trigger_sync::<E, S>))
        .fallback(handle_not_found)
        .layer(cors)
        .with_state(state)
}

/// Run the periodic driver and the HTTP hook until Ctrl+C.
pub(crate) async fn start_server<E, S>(
    orchestrator: Arc<SyncOrchestrator<E, S>>,
    port: u16,
    interval: Duration,
) -> Result<(), Box<dyn std::error::Error>>
where
    E: ExecutionEngine,
    S: SyncStorage,
{
    let (driver, shutdown_tx) = spawn_sync_driver(Arc::clone(&orchestrator), interval);
    let app = router(orchestrator);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "runsync listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = driver.await {
        warn!(error = %e, "sync driver task ended abnormally");
    }
    info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    info!("received shutdown signal");
}

// ─── Route handlers ─────────────────────────────────────────────────────────

async fn handle_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not found"})),
    )
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// POST /runs/{run_id}/sync
async fn handle_trigger_sync<E, S>(
    State(state): State<Arc<AppState<E, S>>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse
where
    E: ExecutionEngine,
    S: SyncStorage,
{
    let response = state.orchestrator.trigger_sync(&run_id).await;
    (trigger_status(&response), Json(response))
}

fn trigger_status(response: &TriggerResponse) -> StatusCode {
    match response {
        TriggerResponse::Synced { .. } => StatusCode::OK,
        TriggerResponse::NotFound { .. } => StatusCode::NOT_FOUND,
        TriggerResponse::Error { .. } => StatusCode::BAD_GATEWAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use runsync_core::SyncSettings;
    use runsync_engine::{EngineError, RunDetail, RunSummary};
    use runsync_storage::{DomainStatus, MemoryStorage, NewRun};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct StaticEngine {
        runs: HashMap<String, RunDetail>,
    }

    #[async_trait]
    impl ExecutionEngine for StaticEngine {
        async fn get_run_detail(&self, external_run_id: &str) -> Result<RunDetail, EngineError> {
            if external_run_id == "broken" {
                return Err(EngineError::Http { status: 500 });
            }
            self.runs
                .get(external_run_id)
                .cloned()
                .ok_or_else(|| EngineError::RunNotFound {
                    run_id: external_run_id.to_string(),
                })
        }

        async fn list_recently_updated_runs(
            &self,
            _limit: usize,
            _updated_after: Option<time::OffsetDateTime>,
            _updated_before: Option<time::OffsetDateTime>,
        ) -> Result<Vec<RunSummary>, EngineError> {
            Ok(Vec::new())
        }
    }

    async fn app() -> Router {
        let mut runs = HashMap::new();
        runs.insert(
            "r1".to_string(),
            RunDetail {
                run_id: "r1".into(),
                status: "SUCCESS".into(),
                start_time: None,
                end_time: None,
                update_time: None,
                config: json!({}),
                events: vec![json!({
                    "__typename": "ExecutionStepSuccessEvent",
                    "stepKey": "load",
                    "timestamp": "10",
                })],
            },
        );
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert_run(NewRun {
                external_run_id: "r1".into(),
                workflow_id: 1,
                status: DomainStatus::Queued,
                started_at: None,
                run_config: json!({}),
            })
            .await
            .unwrap();
        let orchestrator = SyncOrchestrator::new(
            Arc::new(StaticEngine { runs }),
            storage,
            SyncSettings::default(),
        );
        router(Arc::new(orchestrator))
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = call(app().await, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn trigger_sync_returns_synced_run() {
        let (status, body) = call(app().await, "POST", "/runs/r1/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "synced");
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["log_count"], 1);
    }

    #[tokio::test]
    async fn trigger_sync_maps_not_found_and_errors() {
        let (status, body) = call(app().await, "POST", "/runs/nope/sync").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["result"], "not_found");

        let (status, body) = call(app().await, "POST", "/runs/broken/sync").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["result"], "error");
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (status, body) = call(app().await, "GET", "/nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");
    }
}
