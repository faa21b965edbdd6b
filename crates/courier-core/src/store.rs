//! Per-device in-memory conversation state.

use std::collections::HashMap;

use courier_types::api::ConversationSummary;
use courier_types::ident;
use courier_types::models::{Conversation, StoredMessage};

use crate::alias::{AliasTable, LinkedPhoneMap};

/// How deep into a conversation's message tail the duplicate check looks.
/// Full-history scans on every append would make large conversations
/// quadratic.
const DUP_CHECK_DEPTH: usize = 200;

/// All state a device owns. The owning actor task is the only writer, so
/// none of this needs interior locking.
#[derive(Debug, Default)]
pub struct DeviceStore {
    pub conversations: HashMap<String, Conversation>,
    pub messages: HashMap<String, Vec<StoredMessage>>,
    /// Contact display names keyed by canonical identifier.
    pub contact_names: HashMap<String, String>,
    /// Profile-photo references keyed by canonical identifier.
    pub photos: HashMap<String, String>,
    pub aliases: AliasTable,
    pub linked_phone: LinkedPhoneMap,
}

impl DeviceStore {
    /// Fetch-or-create the conversation record for a canonical identifier.
    pub fn conversation_entry(&mut self, canonical: &str) -> &mut Conversation {
        self.conversations
            .entry(canonical.to_string())
            .or_insert_with(|| {
                Conversation::new(canonical.to_string(), ident::is_group(canonical))
            })
    }

    pub fn display_name_for(&self, canonical: &str) -> String {
        if let Some(conv) = self.conversations.get(canonical) {
            if conv.name_override.is_some() || conv.name.is_some() {
                return conv.display_name().to_string();
            }
        }
        self.contact_names
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| canonical.to_string())
    }

    /// Append a message to a conversation unless its id already appears in
    /// the recent tail. Returns false when the message was a duplicate.
    pub fn append_message(&mut self, canonical: &str, message: StoredMessage) -> bool {
        let list = self.messages.entry(canonical.to_string()).or_default();
        if let Some(id) = message.message_id.as_deref() {
            let tail_start = list.len().saturating_sub(DUP_CHECK_DEPTH);
            if list[tail_start..]
                .iter()
                .any(|m| m.message_id.as_deref() == Some(id))
            {
                return false;
            }
        }
        list.push(message);
        true
    }

    /// Fold the losing conversation into the winning one and leave an
    /// alias behind. Idempotent; no-op when the ids are equal or neither
    /// owns any state.
    pub fn merge(&mut self, losing: &str, winning: &str) {
        if losing == winning {
            return;
        }

        self.aliases.repoint(losing, winning);

        match (self.conversations.remove(losing), self.conversations.remove(winning)) {
            (None, Some(winner)) => {
                self.conversations.insert(winning.to_string(), winner);
            }
            (Some(mut adopted), None) => {
                adopted.id = winning.to_string();
                adopted.is_group = ident::is_group(winning);
                self.conversations.insert(winning.to_string(), adopted);
            }
            (Some(loser), Some(mut winner)) => {
                winner.last_activity = winner.last_activity.max(loser.last_activity);
                winner.unread += loser.unread;
                if winner.name.is_none() {
                    winner.name = loser.name;
                }
                if winner.name_override.is_none() {
                    winner.name_override = loser.name_override;
                }
                if winner.photo.is_none() {
                    winner.photo = loser.photo;
                }
                self.conversations.insert(winning.to_string(), winner);
            }
            (None, None) => {}
        }

        if let Some(mut moved) = self.messages.remove(losing) {
            let list = self.messages.entry(winning.to_string()).or_default();
            list.append(&mut moved);
            // stable on timestamp ties, so insertion order is preserved
            list.sort_by_key(|m| m.timestamp);
            dedup_by_message_id(list);
        }

        if let Some(name) = self.contact_names.remove(losing) {
            self.contact_names
                .entry(winning.to_string())
                .or_insert(name);
        }
        if let Some(photo) = self.photos.remove(losing) {
            self.photos.entry(winning.to_string()).or_insert(photo);
        }
    }

    /// Conversation summaries for the panel, newest activity first.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut rows: Vec<ConversationSummary> = self
            .conversations
            .values()
            .map(|conv| ConversationSummary {
                id: conv.id.clone(),
                display_name: self.display_name_for(&conv.id),
                is_group: conv.is_group,
                last_activity: conv.last_activity,
                unread: conv.unread,
                photo: conv
                    .photo
                    .clone()
                    .or_else(|| self.photos.get(&conv.id).cloned()),
            })
            .collect();
        rows.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        rows
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.messages.clear();
        self.contact_names.clear();
        self.photos.clear();
        self.aliases.clear();
        self.linked_phone.clear();
    }
}

/// Keep the first occurrence of every message id; id-less messages are
/// never considered duplicates of each other.
fn dedup_by_message_id(list: &mut Vec<StoredMessage>) {
    let mut seen = std::collections::HashSet::new();
    list.retain(|m| match m.message_id.as_deref() {
        Some(id) => seen.insert(id.to_string()),
        None => true,
    });
}
