use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Json, Response},
    routing::{get, post},
};
use monitor_core::{
    Error,
    executor::CheckExecutor,
    models::{Check, CreateMonitorRequest, Monitor, UpdateMonitorRequest},
    store::{CheckStore, MonitorStore},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;
use uuid::Uuid;

pub const DEFAULT_CHECKS_LIMIT: i64 = 25;
pub const MAX_CHECKS_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub monitors: Arc<dyn MonitorStore>,
    pub checks: Arc<dyn CheckStore>,
    pub executor: Arc<CheckExecutor>,
}

#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.0 {
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, format!("{msg} not found")),
            Error::Busy(msg) => (StatusCode::CONFLICT, msg),
            other => {
                error!(error = %other, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/monitors", get(list_monitors).post(create_monitor))
        .route("/api/monitors/{id}", get(get_monitor).put(update_monitor))
        .route("/api/monitors/{id}/pause", post(pause_monitor))
        .route("/api/monitors/{id}/resume", post(resume_monitor))
        .route("/api/monitors/{id}/run", post(run_monitor))
        .route("/api/monitors/{id}/checks", get(list_checks))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now()
    }))
}

async fn list_monitors(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Monitor>>, ApiError> {
    Ok(Json(state.monitors.list().await?))
}

async fn create_monitor(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateMonitorRequest>,
) -> Result<(StatusCode, Json<Monitor>), ApiError> {
    let request = request.validate()?;
    let monitor = state.monitors.create(&request).await?;
    Ok((StatusCode::CREATED, Json(monitor)))
}

async fn get_monitor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Monitor>, ApiError> {
    Ok(Json(state.monitors.read_current(id).await?))
}

async fn update_monitor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateMonitorRequest>,
) -> Result<Json<Monitor>, ApiError> {
    let request = request.validate()?;
    Ok(Json(state.monitors.update_config(id, &request).await?))
}

async fn pause_monitor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Monitor>, ApiError> {
    Ok(Json(state.monitors.set_enabled(id, false).await?))
}

async fn resume_monitor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Monitor>, ApiError> {
    Ok(Json(state.monitors.set_enabled(id, true).await?))
}

async fn run_monitor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Check>), ApiError> {
    let check = state.executor.run_now(id).await?;
    Ok((StatusCode::CREATED, Json(check)))
}

#[derive(Debug, Deserialize)]
struct ChecksQuery {
    limit: Option<i64>,
}

async fn list_checks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChecksQuery>,
) -> Result<Json<Vec<Check>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_CHECKS_LIMIT);
    if !(1..=MAX_CHECKS_LIMIT).contains(&limit) {
        return Err(Error::validation(format!("limit must be between 1 and {MAX_CHECKS_LIMIT}")).into());
    }

    // 404 for unknown monitors rather than an empty list
    state.monitors.read_current(id).await?;
    Ok(Json(state.checks.list_latest(id, limit).await?))
}
