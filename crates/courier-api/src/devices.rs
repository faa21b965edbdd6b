use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use courier_types::api::CreateDeviceRequest;

use crate::{AppState, status_for};

pub async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

pub async fn add_device(
    State(state): State<AppState>,
    Json(req): Json<CreateDeviceRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.label.is_empty() || req.label.len() > 64 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let info = state.registry.add_device(req.label).await.map_err(|e| {
        error!("add device failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn delete_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .registry
        .remove_device(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(StatusCode::NO_CONTENT)
}
