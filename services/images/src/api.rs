use crate::config::ApiConfig;
use crate::metadata_store::{ImageRecord, MetadataStore};
use crate::rejection::{RejectionLog, RejectionRecord};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub metadata_store: Arc<dyn MetadataStore>,
    pub rejections: Arc<RejectionLog>,
}

/// Query parameters for the rejection list
#[derive(Debug, Deserialize)]
pub struct RejectionListQuery {
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Rejection list response
#[derive(Debug, Serialize)]
pub struct RejectionListResponse {
    pub rejections: Vec<RejectionRecord>,
    pub total_count: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/images/*key", get(get_image))
        .route("/api/v1/rejections", get(list_rejections))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "images-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.metadata_store.check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Get one image record by object key
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ImageRecord>, (StatusCode, Json<ErrorResponse>)> {
    let record = state.metadata_store.get(&key).await.map_err(|e| {
        error!(error = %e, "Failed to get image record");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to get image record".to_string(),
                code: "QUERY_ERROR".to_string(),
            }),
        )
    })?;

    match record {
        Some(record) => Ok(Json(record)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Image not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        )),
    }
}

/// List the most recent rejections, newest first
async fn list_rejections(
    State(state): State<AppState>,
    Query(params): Query<RejectionListQuery>,
) -> Json<RejectionListResponse> {
    Json(RejectionListResponse {
        rejections: state.rejections.recent(params.limit),
        total_count: state.rejections.len(),
    })
}

/// Start the ops API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ops API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
