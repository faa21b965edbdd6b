use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageOrigin, StoredMessage};

// -- JWT Claims --

/// JWT claims shared across courier-api (REST middleware) and
/// courier-gateway (WebSocket authentication). Canonical definition lives
/// here in courier-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub operator: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub operator: String,
    pub token: String,
}

// -- Devices --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateDeviceRequest {
    pub label: String,
}

// -- Conversations --

/// One row of `listConversations`, sorted by last activity descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub display_name: String,
    pub is_group: bool,
    pub last_activity: i64,
    pub unread: u32,
    pub photo: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendTextRequest {
    pub body: String,
}

/// Send a media file the media layer already wrote to disk.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMediaRequest {
    pub media_kind: crate::models::MediaKind,
    pub path: String,
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameRequest {
    pub name: String,
}

/// Filters for `searchMessages`. All optional; empty query matches
/// nothing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilter {
    pub q: String,
    pub conversation: Option<String>,
    pub origin: Option<MessageOrigin>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub conversation_id: String,
    pub message: StoredMessage,
}

#[derive(Debug, Serialize)]
pub struct BackfillResponse {
    pub device_id: Uuid,
    pub aliases_written: usize,
    pub conversations_merged: usize,
}
