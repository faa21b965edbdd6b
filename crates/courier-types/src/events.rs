use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, LinkState, MediaKind, StoredMessage};

// -- Protocol client boundary --

/// Raw message payload as delivered by the protocol client. This is the
/// only place protocol payload shapes exist; ingestion converts them into
/// [`StoredMessage`] projections immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Text {
        body: String,
    },
    Media {
        media_kind: MediaKind,
        path: String,
        mime: Option<String>,
        caption: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    },
    /// Protocol-internal subtypes that never become stored messages.
    Receipt,
    KeyDistribution,
    Reaction,
    PollUpdate,
}

/// One inbound or self-sent message as seen on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUpsert {
    /// Conversation identifier as the protocol addressed it (any shape).
    pub chat_id: String,
    /// When the protocol delivers the same event under a second identifier
    /// form (a linked id alongside the phone id), that other form rides
    /// here. This is the only evidence from which linked↔phone
    /// equivalence may be learned.
    pub alt_chat_id: Option<String>,
    pub message_id: Option<String>,
    pub from_self: bool,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactUpsert {
    pub id: String,
    pub display_name: Option<String>,
    /// Present when the protocol asserts this contact's phone identifier
    /// alongside a linked id — same explicit-evidence rule as
    /// [`MessageUpsert::alt_chat_id`].
    pub phone_id: Option<String>,
    pub photo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMetadata {
    pub id: String,
    pub subject: Option<String>,
    pub unread: Option<u32>,
    /// Epoch milliseconds.
    pub timestamp: Option<i64>,
}

/// Typed event stream consumed from the protocol client. Closed set: the
/// rest of the system never sees raw protocol shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProtocolEvent {
    ConnectionState { state: LinkState },
    /// Initial history sync delivered on (re)connection.
    HistorySnapshot {
        chats: Vec<ChatMetadata>,
        contacts: Vec<ContactUpsert>,
        messages: Vec<MessageUpsert>,
    },
    Message(MessageUpsert),
    Contact(ContactUpsert),
    ChatMetadata(ChatMetadata),
}

/// Commands issued back to the protocol client, keyed by canonical
/// identifiers. Translating to protocol-native addressing is the
/// collaborator's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProtocolCommand {
    SendText {
        device_id: Uuid,
        chat_id: String,
        body: String,
    },
    SendMedia {
        device_id: Uuid,
        chat_id: String,
        media_kind: MediaKind,
        path: String,
        caption: Option<String>,
    },
    FetchGroupSubject {
        device_id: Uuid,
        chat_id: String,
    },
    FetchProfilePhoto {
        device_id: Uuid,
        chat_id: String,
    },
}

// -- Panel boundary --

/// Events pushed to panel clients over the WebSocket gateway. Message
/// events always carry the canonical conversation identifier, never the
/// raw one from the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PanelEvent {
    /// Server confirms successful authentication
    Ready { operator: String },

    MessageNew {
        device_id: Uuid,
        conversation_id: String,
        message: StoredMessage,
    },

    ConversationUpdated {
        device_id: Uuid,
        conversation: Conversation,
    },

    DeviceState {
        device_id: Uuid,
        state: LinkState,
    },
}

impl PanelEvent {
    /// Returns the device_id if this event is scoped to a specific device.
    /// Events that return `None` are global and delivered to all clients.
    pub fn device_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageNew { device_id, .. } => Some(*device_id),
            Self::ConversationUpdated { device_id, .. } => Some(*device_id),
            Self::DeviceState { device_id, .. } => Some(*device_id),
            Self::Ready { .. } => None,
        }
    }
}

/// Commands sent FROM panel client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Subscribe to events for specific devices. The server only forwards
    /// device-scoped events for subscribed devices.
    Subscribe { device_ids: Vec<Uuid> },
}

impl MessagePayload {
    /// Whether this payload carries conversation content. Non-content
    /// subtypes are discarded before any store mutation.
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            Self::Text { .. } | Self::Media { .. } | Self::Location { .. }
        )
    }
}
