use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A managed protocol session. One device owns one conversation store and
/// one persisted log/alias partition; nothing is shared across devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: Uuid,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// Connection state of a device's protocol session, as reported by the
/// external protocol client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

/// Who produced a message: the operator panel, the physical device app,
/// or the remote contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    Panel,
    Device,
    Contact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

/// Reference to a media file already written to disk by the media layer.
/// The core never touches the bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub path: String,
    pub mime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
}

/// Conversation metadata, keyed in the store by canonical identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Display name as reported by the protocol (contact push name or
    /// group subject).
    pub name: Option<String>,
    /// Operator-assigned name; wins over `name` when present.
    pub name_override: Option<String>,
    pub is_group: bool,
    /// Epoch milliseconds of the newest activity seen.
    pub last_activity: i64,
    pub unread: u32,
    /// Profile-photo reference (path or URL), cached from the protocol.
    pub photo: Option<String>,
}

impl Conversation {
    pub fn new(id: String, is_group: bool) -> Self {
        Self {
            id,
            name: None,
            name_override: None,
            is_group,
            last_activity: 0,
            unread: 0,
            photo: None,
        }
    }

    /// The name the panel should show: override, then protocol name, then
    /// the raw identifier.
    pub fn display_name(&self) -> &str {
        self.name_override
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.id)
    }
}

/// A single stored message. Lives in the per-device store under its
/// canonical conversation identifier and in the persisted log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Protocol message id; absent for some history records.
    pub message_id: Option<String>,
    pub from_self: bool,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub text: Option<String>,
    pub media: Option<MediaRef>,
    pub location: Option<GeoPoint>,
    pub origin: MessageOrigin,
}
