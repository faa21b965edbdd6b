//! Per-device actor.
//!
//! Each device runs one task that owns its [`DeviceState`] outright.
//! Protocol events and panel requests arrive on the same channel and are
//! handled to completion one at a time; persistence goes through the
//! device's write queue and is the only work that runs in the background.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use courier_db::{BackfillStats, Database};
use courier_types::api::{ConversationSummary, SearchFilter, SearchHit};
use courier_types::events::{PanelEvent, ProtocolCommand, ProtocolEvent};
use courier_types::models::{DeviceInfo, MediaKind, StoredMessage};

use crate::ingest::DeviceState;
use crate::pending::PendingSend;
use crate::persist::{
    AliasFile, AliasSnapshot, MessageLog, StorageBackend, WriterHandle, spawn_writer,
};
use crate::{CoreConfig, CoreError, StorageMode, now_ms};

const DEFAULT_SEARCH_LIMIT: usize = 100;

pub enum DeviceCommand {
    Event(ProtocolEvent),
    ListConversations {
        reply: oneshot::Sender<Vec<ConversationSummary>>,
    },
    GetMessages {
        conversation_id: String,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<StoredMessage>, CoreError>>,
    },
    Search {
        filter: SearchFilter,
        reply: oneshot::Sender<Vec<SearchHit>>,
    },
    MarkRead {
        conversation_id: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Rename {
        conversation_id: String,
        name: String,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    SendText {
        conversation_id: String,
        body: String,
        reply: oneshot::Sender<()>,
    },
    SendMedia {
        conversation_id: String,
        media_kind: MediaKind,
        path: String,
        caption: Option<String>,
        reply: oneshot::Sender<()>,
    },
    ResetCache {
        reply: oneshot::Sender<()>,
    },
    Prune {
        cutoff_ms: i64,
    },
    Backfill {
        reply: oneshot::Sender<Result<BackfillStats, CoreError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap cloneable handle to a device actor. All access to device state
/// goes through here as message passing; there is no shared mutable state.
#[derive(Clone)]
pub struct DeviceHandle {
    pub info: DeviceInfo,
    tx: mpsc::UnboundedSender<DeviceCommand>,
}

impl DeviceHandle {
    pub fn deliver(&self, event: ProtocolEvent) -> Result<(), CoreError> {
        self.tx
            .send(DeviceCommand::Event(event))
            .map_err(|_| CoreError::DeviceClosed)
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, CoreError> {
        self.request(|reply| DeviceCommand::ListConversations { reply })
            .await
    }

    pub async fn get_messages(
        &self,
        conversation_id: String,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, CoreError> {
        self.request(|reply| DeviceCommand::GetMessages {
            conversation_id,
            limit,
            reply,
        })
        .await?
    }

    pub async fn search(&self, filter: SearchFilter) -> Result<Vec<SearchHit>, CoreError> {
        self.request(|reply| DeviceCommand::Search { filter, reply })
            .await
    }

    pub async fn mark_read(&self, conversation_id: String) -> Result<(), CoreError> {
        self.request(|reply| DeviceCommand::MarkRead {
            conversation_id,
            reply,
        })
        .await?
    }

    pub async fn rename(&self, conversation_id: String, name: String) -> Result<(), CoreError> {
        self.request(|reply| DeviceCommand::Rename {
            conversation_id,
            name,
            reply,
        })
        .await?
    }

    pub async fn send_text(&self, conversation_id: String, body: String) -> Result<(), CoreError> {
        self.request(|reply| DeviceCommand::SendText {
            conversation_id,
            body,
            reply,
        })
        .await
    }

    pub async fn send_media(
        &self,
        conversation_id: String,
        media_kind: MediaKind,
        path: String,
        caption: Option<String>,
    ) -> Result<(), CoreError> {
        self.request(|reply| DeviceCommand::SendMedia {
            conversation_id,
            media_kind,
            path,
            caption,
            reply,
        })
        .await
    }

    pub async fn reset_cache(&self) -> Result<(), CoreError> {
        self.request(|reply| DeviceCommand::ResetCache { reply })
            .await
    }

    pub fn prune(&self, cutoff_ms: i64) -> Result<(), CoreError> {
        self.tx
            .send(DeviceCommand::Prune { cutoff_ms })
            .map_err(|_| CoreError::DeviceClosed)
    }

    pub async fn backfill(&self) -> Result<BackfillStats, CoreError> {
        self.request(|reply| DeviceCommand::Backfill { reply })
            .await?
    }

    /// Stop the actor after draining its write queue. Safe to call more
    /// than once; later calls resolve immediately.
    pub async fn shutdown(&self) {
        let _ = self
            .request(|reply| DeviceCommand::Shutdown { reply })
            .await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DeviceCommand,
    ) -> Result<T, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| CoreError::DeviceClosed)?;
        rx.await.map_err(|_| CoreError::DeviceClosed)
    }
}

struct DeviceWorker {
    state: DeviceState,
    writer: WriterHandle,
    panel_tx: broadcast::Sender<PanelEvent>,
    proto_tx: mpsc::UnboundedSender<ProtocolCommand>,
    db: Option<Arc<Database>>,
}

/// Spawn the actor (and its writer) for one device, hydrating state from
/// whichever storage mode is the system of record.
pub async fn spawn_device(
    info: DeviceInfo,
    config: &CoreConfig,
    panel_tx: broadcast::Sender<PanelEvent>,
    proto_tx: mpsc::UnboundedSender<ProtocolCommand>,
    db: Option<Arc<Database>>,
) -> DeviceHandle {
    let mut state = DeviceState::new(info.id, config.retention_days);
    let cutoff = config.cutoff_ms(now_ms());

    let writer = match config.storage {
        StorageMode::FileLog => {
            let log = MessageLog::new(&config.data_dir, info.id);
            let aliases = AliasFile::new(&config.data_dir, info.id);
            hydrate_from_log(&mut state, &log, &aliases, cutoff);
            spawn_writer(StorageBackend::Log { log, aliases })
        }
        StorageMode::Relational => {
            let db = db.clone().expect("relational mode requires a database");
            hydrate_from_db(&mut state, &db, info.id).await;
            spawn_writer(StorageBackend::Relational {
                db,
                device_id: info.id,
            })
        }
    };

    let worker = DeviceWorker {
        state,
        writer,
        panel_tx,
        proto_tx,
        db,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let label = info.label.clone();
    tokio::spawn(async move {
        info!("device actor started: {}", label);
        worker.run(rx).await;
        info!("device actor stopped: {}", label);
    });

    DeviceHandle { info, tx }
}

/// Replay the persisted log forward, exactly as ingestion would have
/// built the state, skipping anything past the retention horizon.
fn hydrate_from_log(state: &mut DeviceState, log: &MessageLog, aliases: &AliasFile, cutoff: i64) {
    match aliases.load() {
        Ok(Some(snapshot)) => {
            state.store.aliases.replace(snapshot.aliases);
            for (linked, phone) in &snapshot.linked_phone {
                state.store.linked_phone.assert_pair(linked, phone);
            }
        }
        Ok(None) => {}
        Err(e) => warn!("alias snapshot load failed: {}", e),
    }

    match log.read_all() {
        Ok(records) => {
            let total = records.len();
            for record in records {
                state.hydrate_record(record, cutoff);
            }
            info!(
                "hydrated device {} from log: {} records, {} conversations",
                state.device_id,
                total,
                state.store.conversations.len()
            );
        }
        Err(e) => warn!("log hydration failed for {}: {}", state.device_id, e),
    }
}

/// Relational mode: the database is the system of record, so the log
/// replay is skipped entirely. Only the persisted alias rows are read, to
/// seed the alias table and the linked↔phone map.
async fn hydrate_from_db(state: &mut DeviceState, db: &Arc<Database>, device_id: Uuid) {
    let db = db.clone();
    let did = device_id.to_string();
    let loaded = tokio::task::spawn_blocking(move || db.load_aliases(&did)).await;
    match loaded {
        Ok(Ok((aliases, pairs))) => {
            state.store.aliases.replace(aliases);
            for (linked, phone) in &pairs {
                state.store.linked_phone.assert_pair(linked, phone);
            }
        }
        Ok(Err(e)) => warn!("alias row load failed for {}: {}", device_id, e),
        Err(e) => warn!("alias hydration join error: {}", e),
    }
}

impl DeviceWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DeviceCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                DeviceCommand::Event(event) => self.handle_event(event),
                DeviceCommand::ListConversations { reply } => {
                    let _ = reply.send(self.state.store.summaries());
                }
                DeviceCommand::GetMessages {
                    conversation_id,
                    limit,
                    reply,
                } => {
                    let _ = reply.send(self.get_messages(&conversation_id, limit));
                }
                DeviceCommand::Search { filter, reply } => {
                    let _ = reply.send(self.search(filter));
                }
                DeviceCommand::MarkRead {
                    conversation_id,
                    reply,
                } => {
                    let _ = reply.send(self.mark_read(&conversation_id));
                }
                DeviceCommand::Rename {
                    conversation_id,
                    name,
                    reply,
                } => {
                    let _ = reply.send(self.rename(&conversation_id, name));
                }
                DeviceCommand::SendText {
                    conversation_id,
                    body,
                    reply,
                } => {
                    self.send_text(conversation_id, body);
                    let _ = reply.send(());
                }
                DeviceCommand::SendMedia {
                    conversation_id,
                    media_kind,
                    path,
                    caption,
                    reply,
                } => {
                    self.send_media(conversation_id, media_kind, path, caption);
                    let _ = reply.send(());
                }
                DeviceCommand::ResetCache { reply } => {
                    self.reset_cache();
                    let _ = reply.send(());
                }
                DeviceCommand::Prune { cutoff_ms } => {
                    let removed = crate::retention::prune_store(&mut self.state.store, cutoff_ms);
                    if removed > 0 {
                        info!(
                            "pruned {} expired messages from device {}",
                            removed, self.state.device_id
                        );
                    }
                    self.writer.compact(cutoff_ms);
                }
                DeviceCommand::Backfill { reply } => {
                    let _ = reply.send(self.backfill().await);
                }
                DeviceCommand::Shutdown { reply } => {
                    // drain pending writes before releasing the device
                    self.writer.flush().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn handle_event(&mut self, event: ProtocolEvent) {
        let applied = self.state.apply_event(event, now_ms());

        for record in applied.records {
            self.writer.append(record);
        }
        if applied.aliases_changed {
            self.writer.save_aliases(self.alias_snapshot());
        }
        for command in applied.commands {
            let _ = self.proto_tx.send(command);
        }
        for event in applied.panel {
            // no panel clients connected is fine
            let _ = self.panel_tx.send(event);
        }
    }

    fn canonical_of(&self, conversation_id: &str) -> String {
        self.state
            .store
            .aliases
            .get(conversation_id)
            .unwrap_or(conversation_id)
            .to_string()
    }

    fn get_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, CoreError> {
        let canonical = self.canonical_of(conversation_id);
        if !self.state.store.conversations.contains_key(&canonical) {
            return Err(CoreError::ConversationNotFound(conversation_id.to_string()));
        }
        let list = self
            .state
            .store
            .messages
            .get(&canonical)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let start = list.len().saturating_sub(limit);
        Ok(list[start..].to_vec())
    }

    fn search(&self, filter: SearchFilter) -> Vec<SearchHit> {
        let query = filter.q.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }
        let limit = filter.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let conversation = filter.conversation.as_deref().map(|c| self.canonical_of(c));

        let mut hits: Vec<SearchHit> = Vec::new();
        for (conv_id, messages) in &self.state.store.messages {
            if let Some(wanted) = conversation.as_deref() {
                if conv_id != wanted {
                    continue;
                }
            }
            for message in messages {
                if let Some(origin) = filter.origin {
                    if message.origin != origin {
                        continue;
                    }
                }
                let matched = message
                    .text
                    .as_deref()
                    .is_some_and(|t| t.to_lowercase().contains(&query));
                if matched {
                    hits.push(SearchHit {
                        conversation_id: conv_id.clone(),
                        message: message.clone(),
                    });
                }
            }
        }
        hits.sort_by(|a, b| b.message.timestamp.cmp(&a.message.timestamp));
        hits.truncate(limit);
        hits
    }

    fn mark_read(&mut self, conversation_id: &str) -> Result<(), CoreError> {
        let canonical = self.canonical_of(conversation_id);
        let device_id = self.state.device_id;
        let conv = self
            .state
            .store
            .conversations
            .get_mut(&canonical)
            .ok_or_else(|| CoreError::ConversationNotFound(conversation_id.to_string()))?;
        conv.unread = 0;
        let _ = self.panel_tx.send(PanelEvent::ConversationUpdated {
            device_id,
            conversation: conv.clone(),
        });
        Ok(())
    }

    fn rename(&mut self, conversation_id: &str, name: String) -> Result<(), CoreError> {
        let canonical = self.canonical_of(conversation_id);
        let device_id = self.state.device_id;
        let conv = self
            .state
            .store
            .conversations
            .get_mut(&canonical)
            .ok_or_else(|| CoreError::ConversationNotFound(conversation_id.to_string()))?;
        conv.name_override = Some(name);
        let _ = self.panel_tx.send(PanelEvent::ConversationUpdated {
            device_id,
            conversation: conv.clone(),
        });
        Ok(())
    }

    /// Record the send in the ledger first, then hand the command to the
    /// protocol client. The message itself is only stored once the client
    /// echoes it back as a self-sent event — which the ledger entry will
    /// then attribute to the panel.
    fn send_text(&mut self, conversation_id: String, body: String) {
        let canonical = self.canonical_of(&conversation_id);
        self.state.ledger.push(PendingSend {
            conversation_id: canonical.clone(),
            message_id: None,
            text: Some(body.clone()),
            sent_at: now_ms(),
        });
        let _ = self.proto_tx.send(ProtocolCommand::SendText {
            device_id: self.state.device_id,
            chat_id: canonical,
            body,
        });
    }

    /// Same flow as a text send: ledger entry first, the caption doing
    /// the duty of the matchable text, then the command to the client.
    fn send_media(
        &mut self,
        conversation_id: String,
        media_kind: MediaKind,
        path: String,
        caption: Option<String>,
    ) {
        let canonical = self.canonical_of(&conversation_id);
        self.state.ledger.push(PendingSend {
            conversation_id: canonical.clone(),
            message_id: None,
            text: caption.clone(),
            sent_at: now_ms(),
        });
        let _ = self.proto_tx.send(ProtocolCommand::SendMedia {
            device_id: self.state.device_id,
            chat_id: canonical,
            media_kind,
            path,
            caption,
        });
    }

    fn reset_cache(&mut self) {
        self.state.store.clear();
        self.state.ledger.clear();
        self.state.recent.clear();
        self.writer.truncate();
        self.writer.save_aliases(AliasSnapshot::default());
        info!("cache reset for device {}", self.state.device_id);
    }

    async fn backfill(&mut self) -> Result<BackfillStats, CoreError> {
        let Some(db) = self.db.clone() else {
            return Err(CoreError::BackfillUnavailable);
        };

        // every identifier we know for a conversation gets an alias row
        let mut known: Vec<(String, String)> = self
            .state
            .store
            .aliases
            .iter()
            .map(|(raw, canonical)| (raw.to_string(), canonical.to_string()))
            .collect();
        for id in self.state.store.conversations.keys() {
            known.push((id.clone(), id.clone()));
        }

        let did = self.state.device_id.to_string();
        let result =
            tokio::task::spawn_blocking(move || db.backfill_aliases(&did, &known)).await;
        match result {
            Ok(Ok(stats)) => {
                info!(
                    "alias backfill for device {}: {} rows written, {} conversations merged",
                    self.state.device_id, stats.aliases_written, stats.conversations_merged
                );
                Ok(stats)
            }
            Ok(Err(e)) => {
                warn!("alias backfill failed: {}", e);
                Ok(BackfillStats::default())
            }
            Err(_) => Err(CoreError::DeviceClosed),
        }
    }

    fn alias_snapshot(&self) -> AliasSnapshot {
        AliasSnapshot {
            aliases: self.state.store.aliases.snapshot(),
            linked_phone: self
                .state
                .store
                .linked_phone
                .pairs()
                .map(|(l, p)| (l.to_string(), p.to_string()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::events::{MessagePayload, MessageUpsert};
    use courier_types::models::MessageOrigin;

    fn test_config(dir: &std::path::Path) -> CoreConfig {
        CoreConfig {
            data_dir: dir.to_path_buf(),
            retention_days: 90,
            storage: StorageMode::FileLog,
        }
    }

    fn device_info() -> DeviceInfo {
        DeviceInfo {
            id: Uuid::new_v4(),
            label: "test".into(),
            created_at: chrono::Utc::now(),
        }
    }

    fn text_event(chat: &str, id: &str, ts: i64, body: &str) -> ProtocolEvent {
        ProtocolEvent::Message(MessageUpsert {
            chat_id: chat.to_string(),
            alt_chat_id: None,
            message_id: Some(id.to_string()),
            from_self: false,
            timestamp: ts,
            payload: MessagePayload::Text {
                body: body.to_string(),
            },
        })
    }

    #[tokio::test]
    async fn events_flow_into_conversations_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (panel_tx, mut panel_rx) = broadcast::channel(64);
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();
        let info = device_info();

        let handle = spawn_device(info.clone(), &config, panel_tx, proto_tx, None).await;
        let ts = now_ms();
        handle.deliver(text_event("123:5@msg", "m1", ts, "hello")).unwrap();

        let convs = handle.list_conversations().await.unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].id, "123@msg");
        assert_eq!(convs[0].unread, 1);

        // normalized event out, canonical id only
        match panel_rx.recv().await.unwrap() {
            PanelEvent::MessageNew {
                conversation_id, ..
            } => assert_eq!(conversation_id, "123@msg"),
            other => panic!("unexpected {other:?}"),
        }

        // restart the device: hydration rebuilds the same state
        handle.shutdown().await;
        let (panel_tx2, _rx2) = broadcast::channel(64);
        let (proto_tx2, _prx2) = mpsc::unbounded_channel();
        let revived = spawn_device(info, &config, panel_tx2, proto_tx2, None).await;
        let msgs = revived.get_messages("123@msg".into(), 50).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].message_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn panel_send_is_attributed_on_echo() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (panel_tx, _panel_rx) = broadcast::channel(64);
        let (proto_tx, mut proto_rx) = mpsc::unbounded_channel();

        let handle = spawn_device(device_info(), &config, panel_tx, proto_tx, None).await;
        handle
            .send_text("123@msg".into(), "hola".into())
            .await
            .unwrap();

        // the command went out to the protocol client
        match proto_rx.recv().await.unwrap() {
            ProtocolCommand::SendText { chat_id, body, .. } => {
                assert_eq!(chat_id, "123@msg");
                assert_eq!(body, "hola");
            }
            other => panic!("unexpected {other:?}"),
        }

        // the echo comes back as a self-sent event without a message id
        let echo = ProtocolEvent::Message(MessageUpsert {
            chat_id: "123@msg".into(),
            alt_chat_id: None,
            message_id: Some("m9".into()),
            from_self: true,
            timestamp: now_ms(),
            payload: MessagePayload::Text {
                body: "hola".into(),
            },
        });
        handle.deliver(echo).unwrap();

        let msgs = handle.get_messages("123@msg".into(), 10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].origin, MessageOrigin::Panel);
    }

    #[tokio::test]
    async fn linked_phone_evidence_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (panel_tx, _panel_rx) = broadcast::channel(64);
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();
        let info = device_info();

        let handle = spawn_device(info.clone(), &config, panel_tx, proto_tx, None).await;
        // one event asserts both identifier forms together
        let mut upsert = MessageUpsert {
            chat_id: "abc@linked".into(),
            alt_chat_id: Some("777@msg".into()),
            message_id: Some("m1".into()),
            from_self: false,
            timestamp: now_ms(),
            payload: MessagePayload::Text { body: "hi".into() },
        };
        handle.deliver(ProtocolEvent::Message(upsert.clone())).unwrap();
        handle.shutdown().await;

        // after a restart the pair comes back from the persisted aliases,
        // so a linked-only event still lands in the phone conversation
        let (panel_tx2, _rx2) = broadcast::channel(64);
        let (proto_tx2, _prx2) = mpsc::unbounded_channel();
        let revived = spawn_device(info, &config, panel_tx2, proto_tx2, None).await;

        upsert.alt_chat_id = None;
        upsert.message_id = Some("m2".into());
        revived.deliver(ProtocolEvent::Message(upsert)).unwrap();

        let convs = revived.list_conversations().await.unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].id, "777@msg");
        let msgs = revived.get_messages("777@msg".into(), 10).await.unwrap();
        assert_eq!(msgs.len(), 2);
    }

    #[tokio::test]
    async fn unknown_conversation_is_a_typed_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (panel_tx, _panel_rx) = broadcast::channel(64);
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();

        let handle = spawn_device(device_info(), &config, panel_tx, proto_tx, None).await;
        let err = handle.get_messages("nope@msg".into(), 10).await.unwrap_err();
        assert!(matches!(err, CoreError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn mark_read_and_rename_update_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (panel_tx, _panel_rx) = broadcast::channel(64);
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();

        let handle = spawn_device(device_info(), &config, panel_tx, proto_tx, None).await;
        handle
            .deliver(text_event("123@msg", "m1", now_ms(), "hey"))
            .unwrap();

        handle.mark_read("123@msg".into()).await.unwrap();
        handle
            .rename("123@msg".into(), "Support line".into())
            .await
            .unwrap();

        let convs = handle.list_conversations().await.unwrap();
        assert_eq!(convs[0].unread, 0);
        assert_eq!(convs[0].display_name, "Support line");
    }

    #[tokio::test]
    async fn search_filters_by_text_and_origin() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (panel_tx, _panel_rx) = broadcast::channel(64);
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();

        let handle = spawn_device(device_info(), &config, panel_tx, proto_tx, None).await;
        let ts = now_ms();
        handle.deliver(text_event("a@msg", "m1", ts, "deploy went fine")).unwrap();
        handle.deliver(text_event("b@msg", "m2", ts + 1, "Deploy broke")).unwrap();
        handle.deliver(text_event("b@msg", "m3", ts + 2, "unrelated")).unwrap();

        let hits = handle
            .search(SearchFilter {
                q: "deploy".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        // newest first
        assert_eq!(hits[0].message.message_id.as_deref(), Some("m2"));

        let scoped = handle
            .search(SearchFilter {
                q: "deploy".into(),
                conversation: Some("a@msg".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);

        let none = handle
            .search(SearchFilter {
                q: "deploy".into(),
                origin: Some(MessageOrigin::Panel),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn reset_cache_clears_state_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (panel_tx, _panel_rx) = broadcast::channel(64);
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();
        let info = device_info();

        let handle = spawn_device(info.clone(), &config, panel_tx, proto_tx, None).await;
        handle
            .deliver(text_event("123@msg", "m1", now_ms(), "hey"))
            .unwrap();
        handle.reset_cache().await.unwrap();

        assert!(handle.list_conversations().await.unwrap().is_empty());

        // nothing comes back after a restart either
        handle.shutdown().await;
        let (panel_tx2, _rx2) = broadcast::channel(64);
        let (proto_tx2, _prx2) = mpsc::unbounded_channel();
        let revived = spawn_device(info, &config, panel_tx2, proto_tx2, None).await;
        assert!(revived.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_removes_from_memory_and_compacted_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (panel_tx, _panel_rx) = broadcast::channel(64);
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();
        let info = device_info();

        let handle = spawn_device(info.clone(), &config, panel_tx, proto_tx, None).await;
        let old_ts = now_ms() - 24 * 60 * 60 * 1000;
        handle.deliver(text_event("123@msg", "old", old_ts, "stale")).unwrap();
        handle.deliver(text_event("123@msg", "new", now_ms(), "fresh")).unwrap();

        handle.prune(now_ms() - 60 * 60 * 1000).unwrap();

        let msgs = handle.get_messages("123@msg".into(), 10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].message_id.as_deref(), Some("new"));

        // shutdown drains the queued compaction; the log agrees
        handle.shutdown().await;
        let log = MessageLog::new(dir.path(), info.id);
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message.message_id.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn backfill_requires_relational_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (panel_tx, _panel_rx) = broadcast::channel(64);
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();

        let handle = spawn_device(device_info(), &config, panel_tx, proto_tx, None).await;
        let err = handle.backfill().await.unwrap_err();
        assert!(matches!(err, CoreError::BackfillUnavailable));
    }
}
