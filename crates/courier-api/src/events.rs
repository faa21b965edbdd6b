use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use courier_types::events::ProtocolEvent;

use crate::{AppState, status_for};

/// Intake for the protocol-client collaborator: typed events pushed here
/// are queued onto the device's actor and handled in arrival order.
pub async fn deliver_event(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    Json(event): Json<ProtocolEvent>,
) -> Result<impl IntoResponse, StatusCode> {
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    handle.deliver(event).map_err(|e| status_for(&e))?;
    Ok(StatusCode::ACCEPTED)
}
