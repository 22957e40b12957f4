use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    domain::StatusTag,
    proxy_supervisor::ProxyHealthHandle,
    reconcile::ReconcileHandle,
    status::{EntityReport, StatusBoard},
};

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct AppState {
    pub board: StatusBoard,
    pub proxy_health: ProxyHealthHandle,
    pub reconcile: ReconcileHandle,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Debug, Serialize)]
struct EntityItem {
    entity: String,
    #[serde(flatten)]
    report: EntityReport,
}

#[derive(Debug, Deserialize)]
struct EntitiesQuery {
    /// A status tag, or `error` for excluded declarations.
    status: Option<String>,
}

enum EntityFilter {
    Status(StatusTag),
    Error,
}

impl EntityFilter {
    fn parse(raw: &str) -> Result<Self, ApiError> {
        let filter = match raw {
            "unchanged" => Self::Status(StatusTag::Unchanged),
            "added" => Self::Status(StatusTag::Added),
            "modified" => Self::Status(StatusTag::Modified),
            "deleted" => Self::Status(StatusTag::Deleted),
            "error" => Self::Error,
            _ => {
                return Err(ApiError::invalid_request(format!("unknown status filter: {raw}"))
                    .with_detail(
                        "allowed",
                        json!(["unchanged", "added", "modified", "deleted", "error"]),
                    ));
            }
        };
        Ok(filter)
    }

    fn matches(&self, report: &EntityReport) -> bool {
        match (self, report) {
            (Self::Status(want), EntityReport::Status { status }) => want == status,
            (Self::Error, EntityReport::Error { .. }) => true,
            _ => false,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/entities", get(list_entities))
        .route("/entities/*entity", get(get_entity))
        .route("/resync", post(request_resync))
        .fallback(fallback_not_found);

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .fallback(fallback_not_found)
        .layer(Extension(state))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    let snap = state.proxy_health.snapshot().await;
    Json(json!({
        "status": "ok",
        "version": crate::version::VERSION,
        "proxy": {
            "status": snap.status.as_str(),
            "last_ok_at": snap.last_ok_at.map(|t| t.to_rfc3339()),
            "last_fail_at": snap.last_fail_at.map(|t| t.to_rfc3339()),
            "down_since": snap.down_since.map(|t| t.to_rfc3339()),
            "consecutive_failures": snap.consecutive_failures,
            "recoveries_observed": snap.recoveries_observed,
        }
    }))
}

async fn get_status(Extension(state): Extension<AppState>) -> Json<Value> {
    let sync = state.board.snapshot().await;
    let proxy = state.proxy_health.snapshot().await;
    Json(json!({
        "sync": sync,
        "proxy": proxy,
    }))
}

async fn list_entities(
    Extension(state): Extension<AppState>,
    Query(query): Query<EntitiesQuery>,
) -> Result<Json<Items<EntityItem>>, ApiError> {
    let filter = query.status.as_deref().map(EntityFilter::parse).transpose()?;
    let items = state
        .board
        .entities()
        .await
        .into_iter()
        .filter(|(_, report)| filter.as_ref().is_none_or(|f| f.matches(report)))
        .map(|(entity, report)| EntityItem { entity, report })
        .collect();
    Ok(Json(Items { items }))
}

async fn get_entity(
    Extension(state): Extension<AppState>,
    Path(entity): Path<String>,
) -> Result<Json<EntityItem>, ApiError> {
    let mut entities = state.board.entities().await;
    match entities.remove(&entity) {
        Some(report) => Ok(Json(EntityItem { entity, report })),
        None => Err(ApiError::not_found(format!("entity not found: {entity}"))),
    }
}

async fn request_resync(Extension(state): Extension<AppState>) -> impl IntoResponse {
    state.reconcile.request_resync();
    (StatusCode::ACCEPTED, Json(json!({ "requested": "resync" })))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
