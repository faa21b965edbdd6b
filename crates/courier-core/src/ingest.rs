//! Protocol event ingestion.
//!
//! One [`DeviceState`] per device, mutated only by its owning actor task.
//! Every inbound event is handled to completion — resolve, merge,
//! attribute, append — before the next one starts, which is what lets the
//! store and alias table live without locks.

use tracing::debug;
use uuid::Uuid;

use courier_types::events::{
    ChatMetadata, ContactUpsert, MessagePayload, MessageUpsert, PanelEvent, ProtocolCommand,
    ProtocolEvent,
};
use courier_types::ident::{self, IdClass};
use courier_types::models::{GeoPoint, MediaRef, MessageOrigin, StoredMessage};

use crate::pending::PendingSendLedger;
use crate::persist::LogRecord;
use crate::recent::RecentIds;
use crate::resolver::resolve;
use crate::store::DeviceStore;

pub struct DeviceState {
    pub device_id: Uuid,
    pub store: DeviceStore,
    pub ledger: PendingSendLedger,
    pub recent: RecentIds,
    pub retention_days: i64,
}

/// What one applied event produced: normalized panel events to publish,
/// records for the write queue, commands for the protocol client, plus
/// whether the alias state moved (so the actor knows to snapshot it).
#[derive(Default)]
pub struct Applied {
    pub panel: Vec<PanelEvent>,
    pub records: Vec<LogRecord>,
    pub commands: Vec<ProtocolCommand>,
    pub aliases_changed: bool,
}

impl DeviceState {
    pub fn new(device_id: Uuid, retention_days: i64) -> Self {
        Self {
            device_id,
            store: DeviceStore::default(),
            ledger: PendingSendLedger::default(),
            recent: RecentIds::default(),
            retention_days,
        }
    }

    pub fn cutoff_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.retention_days * 24 * 60 * 60 * 1000
    }

    pub fn apply_event(&mut self, event: ProtocolEvent, now_ms: i64) -> Applied {
        let alias_v = self.store.aliases.version();
        let linked_v = self.store.linked_phone.version();
        let mut out = Applied::default();

        match event {
            ProtocolEvent::ConnectionState { state } => {
                out.panel.push(PanelEvent::DeviceState {
                    device_id: self.device_id,
                    state,
                });
            }
            ProtocolEvent::HistorySnapshot {
                chats,
                contacts,
                messages,
            } => {
                for chat in chats {
                    self.apply_chat_metadata(chat, &mut out);
                }
                for contact in contacts {
                    self.apply_contact(contact, &mut out);
                }
                for message in messages {
                    self.apply_message(message, now_ms, false, &mut out);
                }
            }
            ProtocolEvent::Message(upsert) => {
                self.apply_message(upsert, now_ms, true, &mut out);
            }
            ProtocolEvent::Contact(contact) => {
                self.apply_contact(contact, &mut out);
            }
            ProtocolEvent::ChatMetadata(chat) => {
                self.apply_chat_metadata(chat, &mut out);
            }
        }

        out.aliases_changed = self.store.aliases.version() != alias_v
            || self.store.linked_phone.version() != linked_v;
        out
    }

    /// Message path: resolve → dedup → project → attribute → append.
    /// `live` is false for history-snapshot replay, which must not bump
    /// unread counts (chat metadata carries those).
    fn apply_message(
        &mut self,
        upsert: MessageUpsert,
        now_ms: i64,
        live: bool,
        out: &mut Applied,
    ) {
        if !upsert.payload.is_content() {
            return;
        }
        if ident::is_broadcast(&upsert.chat_id) {
            return;
        }
        if upsert.timestamp < self.cutoff_ms(now_ms) {
            debug!("dropping message older than retention cutoff");
            return;
        }

        // an event carrying both identifier forms is the only thing that
        // may teach us a linked↔phone equivalence
        if let Some(alt) = upsert.alt_chat_id.as_deref() {
            self.learn_pair(&upsert.chat_id, alt);
        }

        let canonical = resolve(&mut self.store, &upsert.chat_id);

        if let Some(id) = upsert.message_id.as_deref() {
            if !self.recent.insert(id) {
                return;
            }
        }

        let (text, media, location) = project_payload(upsert.payload);

        let origin = if upsert.from_self {
            self.ledger.attribute_self(
                &canonical,
                upsert.message_id.as_deref(),
                text.as_deref(),
                upsert.timestamp,
            )
        } else {
            MessageOrigin::Contact
        };

        let message = StoredMessage {
            message_id: upsert.message_id,
            from_self: upsert.from_self,
            timestamp: upsert.timestamp,
            text,
            media,
            location,
            origin,
        };

        if !self.store.append_message(&canonical, message.clone()) {
            return;
        }

        let is_new = !self.store.conversations.contains_key(&canonical);
        if is_new {
            self.request_metadata(&canonical, out);
        }

        let conv = self.store.conversation_entry(&canonical);
        conv.last_activity = conv.last_activity.max(upsert.timestamp);
        if live && !upsert.from_self {
            conv.unread += 1;
        }
        let conv = conv.clone();

        let display_name = self.store.display_name_for(&canonical);
        out.records.push(LogRecord {
            conversation_id: canonical.clone(),
            display_name: (display_name != canonical).then_some(display_name),
            is_group: conv.is_group,
            message: message.clone(),
        });

        out.panel.push(PanelEvent::MessageNew {
            device_id: self.device_id,
            conversation_id: canonical,
            message,
        });
        out.panel.push(PanelEvent::ConversationUpdated {
            device_id: self.device_id,
            conversation: conv,
        });
    }

    fn apply_contact(&mut self, contact: ContactUpsert, out: &mut Applied) {
        if ident::is_broadcast(&contact.id) {
            return;
        }
        if let Some(phone) = contact.phone_id.as_deref() {
            self.learn_pair(&contact.id, phone);
        }

        let canonical = resolve(&mut self.store, &contact.id);
        if let Some(name) = contact.display_name {
            self.store.contact_names.insert(canonical.clone(), name);
        }
        if let Some(photo) = contact.photo {
            self.store.photos.insert(canonical.clone(), photo);
        }

        if let Some(conv) = self.store.conversations.get(&canonical) {
            out.panel.push(PanelEvent::ConversationUpdated {
                device_id: self.device_id,
                conversation: conv.clone(),
            });
        }
    }

    fn apply_chat_metadata(&mut self, chat: ChatMetadata, out: &mut Applied) {
        if ident::is_broadcast(&chat.id) {
            return;
        }
        let canonical = resolve(&mut self.store, &chat.id);
        let conv = self.store.conversation_entry(&canonical);
        if let Some(subject) = chat.subject {
            conv.name = Some(subject);
        }
        if let Some(unread) = chat.unread {
            conv.unread = unread;
        }
        if let Some(ts) = chat.timestamp {
            conv.last_activity = conv.last_activity.max(ts);
        }
        out.panel.push(PanelEvent::ConversationUpdated {
            device_id: self.device_id,
            conversation: conv.clone(),
        });
    }

    /// A conversation seen for the first time has no subject or photo
    /// yet; ask the protocol client for both. Groups get a subject fetch,
    /// everything gets a profile-photo fetch.
    fn request_metadata(&self, canonical: &str, out: &mut Applied) {
        if ident::is_group(canonical) {
            out.commands.push(ProtocolCommand::FetchGroupSubject {
                device_id: self.device_id,
                chat_id: canonical.to_string(),
            });
        }
        out.commands.push(ProtocolCommand::FetchProfilePhoto {
            device_id: self.device_id,
            chat_id: canonical.to_string(),
        });
    }

    /// Record an equivalence when an event asserts two identifier forms
    /// together, whichever side carried which. A linked↔phone pair goes
    /// into the mapping table; two phone forms pick a canonical side by
    /// the rank policy and merge immediately.
    fn learn_pair(&mut self, a: &str, b: &str) {
        match (ident::classify(a), ident::classify(b)) {
            (IdClass::Linked, IdClass::Phone { .. }) => {
                self.store.linked_phone.assert_pair(a, b);
            }
            (IdClass::Phone { .. }, IdClass::Linked) => {
                self.store.linked_phone.assert_pair(b, a);
            }
            (IdClass::Phone { .. }, IdClass::Phone { .. }) => {
                let winner = ident::preferred_canonical(a, b).to_string();
                let loser = if winner == a { b } else { a };
                self.store.merge(loser, &winner);
            }
            _ => {}
        }
    }

    /// Replay one persisted record at activation. Mirrors what ingestion
    /// did when the record was first written: ids are already canonical,
    /// payloads already projected.
    pub fn hydrate_record(&mut self, record: LogRecord, cutoff_ms: i64) {
        if record.message.timestamp < cutoff_ms {
            return;
        }
        if let Some(id) = record.message.message_id.as_deref() {
            if !self.recent.insert(id) {
                return;
            }
        }
        let ts = record.message.timestamp;
        if !self
            .store
            .append_message(&record.conversation_id, record.message)
        {
            return;
        }
        let conv = self.store.conversation_entry(&record.conversation_id);
        conv.is_group = record.is_group;
        conv.last_activity = conv.last_activity.max(ts);
        if conv.name.is_none() {
            conv.name = record.display_name;
        }
    }
}

fn project_payload(
    payload: MessagePayload,
) -> (Option<String>, Option<MediaRef>, Option<GeoPoint>) {
    match payload {
        MessagePayload::Text { body } => (Some(body), None, None),
        MessagePayload::Media {
            media_kind,
            path,
            mime,
            caption,
        } => (
            caption,
            Some(MediaRef {
                kind: media_kind,
                path,
                mime,
            }),
            None,
        ),
        MessagePayload::Location {
            latitude,
            longitude,
            name,
        } => (
            None,
            None,
            Some(GeoPoint {
                latitude,
                longitude,
                name,
            }),
        ),
        // filtered out by is_content before we get here
        _ => (None, None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingSend;
    use courier_types::models::{LinkState, MediaKind};

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn state() -> DeviceState {
        DeviceState::new(Uuid::new_v4(), 90)
    }

    fn text_upsert(chat: &str, id: Option<&str>, ts: i64, body: &str) -> MessageUpsert {
        MessageUpsert {
            chat_id: chat.to_string(),
            alt_chat_id: None,
            message_id: id.map(String::from),
            from_self: false,
            timestamp: ts,
            payload: MessagePayload::Text {
                body: body.to_string(),
            },
        }
    }

    fn now() -> i64 {
        100 * DAY_MS
    }

    #[test]
    fn broadcast_events_are_discarded() {
        let mut s = state();
        let out = s.apply_event(
            ProtocolEvent::Message(text_upsert("status@broadcast", Some("m1"), now(), "x")),
            now(),
        );
        assert!(out.panel.is_empty());
        assert!(s.store.conversations.is_empty());
    }

    #[test]
    fn non_content_subtypes_are_discarded() {
        let mut s = state();
        for payload in [
            MessagePayload::Receipt,
            MessagePayload::KeyDistribution,
            MessagePayload::Reaction,
            MessagePayload::PollUpdate,
        ] {
            let out = s.apply_event(
                ProtocolEvent::Message(MessageUpsert {
                    chat_id: "123@msg".into(),
                    alt_chat_id: None,
                    message_id: Some("m1".into()),
                    from_self: false,
                    timestamp: now(),
                    payload,
                }),
                now(),
            );
            assert!(out.panel.is_empty());
        }
        assert!(s.store.messages.is_empty());
    }

    #[test]
    fn expired_messages_are_discarded_at_ingestion() {
        let mut s = state();
        let out = s.apply_event(
            ProtocolEvent::Message(text_upsert("123@msg", Some("m1"), 5 * DAY_MS, "old")),
            now(),
        );
        assert!(out.records.is_empty());
        assert!(s.store.messages.is_empty());
    }

    #[test]
    fn duplicate_message_ids_produce_one_record() {
        let mut s = state();
        let first = s.apply_event(
            ProtocolEvent::Message(text_upsert("123@msg", Some("m1"), now(), "hi")),
            now(),
        );
        let second = s.apply_event(
            ProtocolEvent::Message(text_upsert("123@msg", Some("m1"), now(), "hi")),
            now(),
        );
        assert_eq!(first.records.len(), 1);
        assert!(second.records.is_empty());
        assert_eq!(s.store.messages.get("123@msg").unwrap().len(), 1);
    }

    #[test]
    fn normalized_events_carry_the_canonical_id() {
        let mut s = state();
        let out = s.apply_event(
            ProtocolEvent::Message(text_upsert("123:7@msg", Some("m1"), now(), "hi")),
            now(),
        );
        match &out.panel[0] {
            PanelEvent::MessageNew {
                conversation_id, ..
            } => assert_eq!(conversation_id, "123@msg"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(out.aliases_changed);
        assert_eq!(out.records[0].conversation_id, "123@msg");
    }

    #[test]
    fn live_contact_message_bumps_unread_history_does_not() {
        let mut s = state();
        s.apply_event(
            ProtocolEvent::Message(text_upsert("123@msg", Some("m1"), now(), "live")),
            now(),
        );
        assert_eq!(s.store.conversations.get("123@msg").unwrap().unread, 1);

        s.apply_event(
            ProtocolEvent::HistorySnapshot {
                chats: vec![],
                contacts: vec![],
                messages: vec![text_upsert("123@msg", Some("m2"), now(), "history")],
            },
            now(),
        );
        assert_eq!(s.store.conversations.get("123@msg").unwrap().unread, 1);
        assert_eq!(s.store.messages.get("123@msg").unwrap().len(), 2);
    }

    #[test]
    fn self_send_attribution_consumes_pending_entry() {
        let mut s = state();
        s.ledger.push(PendingSend {
            conversation_id: "c@msg".into(),
            message_id: None,
            text: Some("hola".into()),
            sent_at: now() + 1000,
        });

        let mut self_upsert = text_upsert("c@msg", None, now() + 1010, "hola");
        self_upsert.from_self = true;
        s.apply_event(ProtocolEvent::Message(self_upsert), now());
        let msgs = s.store.messages.get("c@msg").unwrap();
        assert_eq!(msgs[0].origin, MessageOrigin::Panel);

        // identical text much later: the entry is gone, so it's the device
        let mut late = text_upsert("c@msg", None, now() + 20_000, "hola");
        late.from_self = true;
        s.apply_event(ProtocolEvent::Message(late), now());
        let msgs = s.store.messages.get("c@msg").unwrap();
        assert_eq!(msgs[1].origin, MessageOrigin::Device);
    }

    #[test]
    fn alt_id_evidence_merges_linked_into_phone() {
        let mut s = state();
        // linked-only traffic first
        s.apply_event(
            ProtocolEvent::Message(text_upsert("abc@linked", Some("m1"), now(), "one")),
            now(),
        );
        assert!(s.store.conversations.contains_key("abc@linked"));

        // now an event asserts both forms together
        let mut both = text_upsert("abc@linked", Some("m2"), now() + 1, "two");
        both.alt_chat_id = Some("777@msg".into());
        let out = s.apply_event(ProtocolEvent::Message(both), now());

        assert!(!s.store.conversations.contains_key("abc@linked"));
        let msgs = s.store.messages.get("777@msg").unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(out.aliases_changed);
    }

    #[test]
    fn media_payload_projects_reference_and_caption() {
        let mut s = state();
        s.apply_event(
            ProtocolEvent::Message(MessageUpsert {
                chat_id: "123@msg".into(),
                alt_chat_id: None,
                message_id: Some("m1".into()),
                from_self: false,
                timestamp: now(),
                payload: MessagePayload::Media {
                    media_kind: MediaKind::Image,
                    path: "media/abc.jpg".into(),
                    mime: Some("image/jpeg".into()),
                    caption: Some("look at this".into()),
                },
            }),
            now(),
        );

        let msg = &s.store.messages.get("123@msg").unwrap()[0];
        assert_eq!(msg.text.as_deref(), Some("look at this"));
        let media = msg.media.as_ref().unwrap();
        assert_eq!(media.kind, MediaKind::Image);
        assert_eq!(media.path, "media/abc.jpg");
    }

    #[test]
    fn first_sight_of_a_conversation_requests_metadata() {
        let mut s = state();
        let out = s.apply_event(
            ProtocolEvent::Message(text_upsert("team@group", Some("m1"), now(), "x")),
            now(),
        );
        assert!(out
            .commands
            .iter()
            .any(|c| matches!(c, ProtocolCommand::FetchGroupSubject { .. })));
        assert!(out
            .commands
            .iter()
            .any(|c| matches!(c, ProtocolCommand::FetchProfilePhoto { .. })));

        // a known conversation is not asked again
        let out = s.apply_event(
            ProtocolEvent::Message(text_upsert("team@group", Some("m2"), now(), "y")),
            now(),
        );
        assert!(out.commands.is_empty());
    }

    #[test]
    fn two_phone_forms_asserted_together_pick_the_ranked_winner() {
        let mut s = state();
        s.apply_event(
            ProtocolEvent::Message(text_upsert("777:3@msg", Some("m1"), now(), "one")),
            now(),
        );
        // suffixed form arrives carrying the unsuffixed one
        let mut both = text_upsert("777:3@msg", Some("m2"), now() + 1, "two");
        both.alt_chat_id = Some("777@msg".into());
        s.apply_event(ProtocolEvent::Message(both), now());

        assert_eq!(s.store.conversations.len(), 1);
        assert!(s.store.conversations.contains_key("777@msg"));
        assert_eq!(s.store.aliases.get("777:3@msg"), Some("777@msg"));
    }

    #[test]
    fn contact_with_phone_evidence_names_the_phone_conversation() {
        let mut s = state();
        s.apply_event(
            ProtocolEvent::Contact(ContactUpsert {
                id: "abc@linked".into(),
                display_name: Some("Ana".into()),
                phone_id: Some("777@msg".into()),
                photo: None,
            }),
            now(),
        );
        assert_eq!(
            s.store.contact_names.get("777@msg").map(String::as_str),
            Some("Ana")
        );
    }

    #[test]
    fn chat_metadata_updates_conversation() {
        let mut s = state();
        let out = s.apply_event(
            ProtocolEvent::ChatMetadata(ChatMetadata {
                id: "team@group".into(),
                subject: Some("Platform".into()),
                unread: Some(4),
                timestamp: Some(now()),
            }),
            now(),
        );
        let conv = s.store.conversations.get("team@group").unwrap();
        assert!(conv.is_group);
        assert_eq!(conv.name.as_deref(), Some("Platform"));
        assert_eq!(conv.unread, 4);
        assert_eq!(out.panel.len(), 1);
    }

    #[test]
    fn connection_state_becomes_device_state_event() {
        let mut s = state();
        let out = s.apply_event(
            ProtocolEvent::ConnectionState {
                state: LinkState::Open,
            },
            now(),
        );
        assert!(matches!(
            out.panel[0],
            PanelEvent::DeviceState {
                state: LinkState::Open,
                ..
            }
        ));
    }

    #[test]
    fn hydration_reproduces_pruned_live_state() {
        // build live state, prune, persist records, replay into a fresh
        // state: the two must match
        let mut live = state();
        for (id, ts) in [("m1", now() - DAY_MS), ("m2", now())] {
            live.apply_event(
                ProtocolEvent::Message(text_upsert("123@msg", Some(id), ts, "x")),
                now(),
            );
        }
        let cutoff = now() - 12 * 60 * 60 * 1000;
        crate::retention::prune_store(&mut live.store, cutoff);

        let mut replayed = state();
        for rec in [
            LogRecord {
                conversation_id: "123@msg".into(),
                display_name: None,
                is_group: false,
                message: StoredMessage {
                    message_id: Some("m1".into()),
                    from_self: false,
                    timestamp: now() - DAY_MS,
                    text: Some("x".into()),
                    media: None,
                    location: None,
                    origin: MessageOrigin::Contact,
                },
            },
            LogRecord {
                conversation_id: "123@msg".into(),
                display_name: None,
                is_group: false,
                message: StoredMessage {
                    message_id: Some("m2".into()),
                    from_self: false,
                    timestamp: now(),
                    text: Some("x".into()),
                    media: None,
                    location: None,
                    origin: MessageOrigin::Contact,
                },
            },
        ] {
            replayed.hydrate_record(rec, cutoff);
        }

        assert_eq!(
            live.store.messages.get("123@msg").unwrap(),
            replayed.store.messages.get("123@msg").unwrap()
        );
    }
}
