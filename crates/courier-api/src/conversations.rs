use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use courier_types::api::{
    BackfillResponse, RenameRequest, SearchFilter, SendMediaRequest, SendTextRequest,
};

use crate::{AppState, status_for};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    let conversations = handle
        .list_conversations()
        .await
        .map_err(|e| status_for(&e))?;
    Ok(Json(conversations))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path((device_id, conversation_id)): Path<(Uuid, String)>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    let messages = handle
        .get_messages(conversation_id, query.limit.min(500))
        .await
        .map_err(|e| status_for(&e))?;
    Ok(Json(messages))
}

pub async fn search_messages(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    Query(filter): Query<SearchFilter>,
) -> Result<impl IntoResponse, StatusCode> {
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    let hits = handle.search(filter).await.map_err(|e| status_for(&e))?;
    Ok(Json(hits))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path((device_id, conversation_id)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, StatusCode> {
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    handle
        .mark_read(conversation_id)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rename(
    State(state): State<AppState>,
    Path((device_id, conversation_id)): Path<(Uuid, String)>,
    Json(req): Json<RenameRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.name.is_empty() || req.name.len() > 128 {
        return Err(StatusCode::BAD_REQUEST);
    }
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    handle
        .rename(conversation_id, req.name)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Queue a text send. The message is not stored here: the protocol client
/// echoes it back as a self-sent event and the pending-send ledger
/// attributes that echo to the panel.
pub async fn send_text(
    State(state): State<AppState>,
    Path((device_id, conversation_id)): Path<(Uuid, String)>,
    Json(req): Json<SendTextRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.body.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    handle
        .send_text(conversation_id, req.body)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn send_media(
    State(state): State<AppState>,
    Path((device_id, conversation_id)): Path<(Uuid, String)>,
    Json(req): Json<SendMediaRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.path.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    handle
        .send_media(conversation_id, req.media_kind, req.path, req.caption)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn reset_cache(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    handle.reset_cache().await.map_err(|e| status_for(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn backfill_aliases(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let handle = state
        .registry
        .get(device_id)
        .await
        .map_err(|e| status_for(&e))?;
    let stats = handle.backfill().await.map_err(|e| status_for(&e))?;
    Ok(Json(BackfillResponse {
        device_id,
        aliases_written: stats.aliases_written,
        conversations_merged: stats.conversations_merged,
    }))
}
