//! REST API for the verified analysis pipeline
//!
//! Thin adapter: one query per request, audit records by query id.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::agent::Orchestrator;
use crate::models::AnalysisQuery;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyzeRequest {
    pub query: String,
    /// `YYYY-MM-DD`; enables look-ahead checks.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Failure that still carries a payload (partial audit info)
    pub fn failure<T: Serialize>(message: String, data: T) -> Self {
        Self {
            data: serde_json::to_value(data).ok(),
            ..Self::error(message)
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Analysis Endpoint
/// =============================

async fn analyze(
    State(state): State<ApiState>,
    Json(req): Json<AnalyzeRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let text = req.query.trim();
    if text.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("query must not be empty".into())),
        );
    }

    let query = AnalysisQuery::new(text, req.as_of);
    let query_id = query.query_id;
    info!(query_id = %query_id, as_of = ?req.as_of, "Received analysis request");

    match state.orchestrator.run(query).await {
        Ok(outcome) if outcome.is_completed() => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "query_id": query_id,
                "stage": outcome.state.stage(),
                "answer": outcome.answer,
                "audit": outcome.audit,
            }))),
        ),
        Ok(outcome) => {
            let reason = outcome
                .audit
                .failure
                .as_ref()
                .map(|f| format!("{}: {}", f.kind, f.reason))
                .unwrap_or_else(|| "pipeline did not complete".to_string());
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ApiResponse::failure(
                    reason,
                    serde_json::json!({
                        "query_id": query_id,
                        "stage": outcome.state.stage(),
                        "failure": outcome.audit.failure,
                        "audit": outcome.audit,
                    }),
                )),
            )
        }
        Err(e) => {
            error!(query_id = %query_id, error = %e, "Pipeline defect");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Pipeline failed: {}", e))),
            )
        }
    }
}

/// =============================
/// Audit Endpoint
/// =============================

async fn get_audit(
    State(state): State<ApiState>,
    Path(query_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    let audit_log = state.orchestrator.audit_log();

    match audit_log.get(query_id).await {
        Ok(Some(record)) => {
            let intact = audit_log.verify_integrity(query_id).await.unwrap_or(false);
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "record": record,
                    "integrity_verified": intact,
                }))),
            )
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("no audit record for {}", query_id))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/audit/:query_id", get(get_audit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
