//! Pending-send ledger and source attribution.
//!
//! When the operator panel dispatches a message we don't append it to the
//! store directly — the protocol client echoes it back as a self-sent
//! event, and that echo is what gets stored. The ledger exists to decide,
//! for each self-sent event, whether it came from the panel or from the
//! physical device app.

use std::collections::VecDeque;

use courier_types::models::MessageOrigin;

/// Oldest entries are dropped beyond this, so unmatched sends cannot grow
/// the ledger unbounded.
const LEDGER_CAP: usize = 200;

/// A text match only counts when the event lands within this window of
/// the panel send.
const TEXT_MATCH_WINDOW_MS: i64 = 15_000;

#[derive(Debug, Clone)]
pub struct PendingSend {
    pub conversation_id: String,
    pub message_id: Option<String>,
    pub text: Option<String>,
    pub sent_at: i64,
}

#[derive(Debug, Default)]
pub struct PendingSendLedger {
    entries: VecDeque<PendingSend>,
}

impl PendingSendLedger {
    pub fn push(&mut self, entry: PendingSend) {
        if self.entries.len() >= LEDGER_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Classify a self-sent event. A message-id match, or an identical-text
    /// match within the time window, means the panel produced it — and
    /// consumes the entry so a later identical event cannot match again.
    /// Everything else was typed on the device itself.
    pub fn attribute_self(
        &mut self,
        conversation_id: &str,
        message_id: Option<&str>,
        text: Option<&str>,
        timestamp: i64,
    ) -> MessageOrigin {
        if let Some(id) = message_id {
            if let Some(pos) = self.entries.iter().position(|e| {
                e.conversation_id == conversation_id && e.message_id.as_deref() == Some(id)
            }) {
                self.entries.remove(pos);
                return MessageOrigin::Panel;
            }
        }

        if let Some(text) = text {
            if let Some(pos) = self.entries.iter().position(|e| {
                e.conversation_id == conversation_id
                    && e.text.as_deref() == Some(text)
                    && (timestamp - e.sent_at).abs() <= TEXT_MATCH_WINDOW_MS
            }) {
                self.entries.remove(pos);
                return MessageOrigin::Panel;
            }
        }

        MessageOrigin::Device
    }
}
