use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{ServiceError, StoreError};
use crate::identity::EntityId;
use crate::model::{ItemDraft, LineItem, PaymentInfo, Tab};
use crate::service::TabService;
use crate::store::Notice;
use crate::sync::SyncStatus;

#[derive(Clone)]
pub struct ApiState {
    pub service: TabService,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

pub fn router(service: TabService) -> Router {
    let state = ApiState { service };

    Router::new()
        .route("/tabs", get(list_open_tabs).post(open_tab))
        .route("/tabs/:id", get(get_tab))
        .route("/tabs/:id/items", get(list_items).post(add_item))
        .route("/tabs/:id/close", post(close_tab))
        .route("/tabs/:id/cancel", post(cancel_tab))
        .route("/sync/status", get(sync_status))
        .route("/sync/notices", get(list_notices))
        .route("/sync/notices/:seq", delete(dismiss_notice))
        .with_state(state)
}

fn store_error(e: StoreError) -> (StatusCode, String) {
    let status = match &e {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::InvalidTransition { .. } | StoreError::OrphanLineItem { .. } => {
            StatusCode::CONFLICT
        }
        StoreError::AmountOverflow(_) => StatusCode::BAD_REQUEST,
        _ => {
            tracing::error!("Store failure: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

fn service_error(e: ServiceError) -> (StatusCode, String) {
    match e {
        ServiceError::Invalid(message) => (StatusCode::BAD_REQUEST, message),
        ServiceError::Store(e) => store_error(e),
    }
}

fn parse_id(raw: &str) -> Result<EntityId, (StatusCode, String)> {
    raw.parse()
        .map_err(|e: crate::identity::IdentityParseError| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn list_open_tabs(State(state): State<ApiState>) -> ApiResult<Vec<Tab>> {
    state.service.open_tabs().map(Json).map_err(store_error)
}

async fn open_tab(State(state): State<ApiState>) -> ApiResult<Tab> {
    state.service.open_tab().map(Json).map_err(service_error)
}

async fn get_tab(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Tab> {
    let id = parse_id(&id)?;
    match state.service.get_tab(&id).map_err(store_error)? {
        Some(tab) => Ok(Json(tab)),
        None => Err((StatusCode::NOT_FOUND, format!("tab {} not found", id))),
    }
}

async fn list_items(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Vec<LineItem>> {
    let id = parse_id(&id)?;
    state.service.line_items(&id).map(Json).map_err(store_error)
}

async fn add_item(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(draft): Json<ItemDraft>,
) -> ApiResult<LineItem> {
    let id = parse_id(&id)?;
    state
        .service
        .add_item(&id, draft)
        .map(Json)
        .map_err(service_error)
}

async fn close_tab(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(payment): Json<PaymentInfo>,
) -> ApiResult<Tab> {
    let id = parse_id(&id)?;
    state
        .service
        .close_tab(&id, payment)
        .map(Json)
        .map_err(service_error)
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_tab(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Tab> {
    let id = parse_id(&id)?;
    let request = body.map(|Json(request)| request).unwrap_or_default();
    state
        .service
        .cancel_tab(&id, request.reason)
        .map(Json)
        .map_err(service_error)
}

async fn sync_status(State(state): State<ApiState>) -> ApiResult<SyncStatus> {
    state.service.sync_status().map(Json).map_err(store_error)
}

async fn list_notices(State(state): State<ApiState>) -> ApiResult<Vec<Notice>> {
    state.service.notices().map(Json).map_err(store_error)
}

async fn dismiss_notice(
    State(state): State<ApiState>,
    Path(seq): Path<u64>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.service.dismiss_notice(seq).map_err(store_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("notice {} not found", seq)))
    }
}
