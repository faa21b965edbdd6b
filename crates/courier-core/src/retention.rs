//! Periodic retention pruning.
//!
//! Runs on an interval, removes in-memory messages older than the
//! horizon and schedules log compaction behind each device's write queue.
//! Cooperative: a pass never blocks event ingestion, and devices are
//! handled independently.

use std::time::Duration;

use tracing::info;

use courier_types::models::StoredMessage;

use crate::registry::DeviceRegistry;
use crate::store::DeviceStore;

/// Drop every message older than the cutoff. A conversation left with no
/// messages loses its entry in the message map but keeps its metadata.
/// Returns how many messages were removed.
pub fn prune_store(store: &mut DeviceStore, cutoff_ms: i64) -> usize {
    let mut removed = 0;
    store.messages.retain(|_, list: &mut Vec<StoredMessage>| {
        let before = list.len();
        list.retain(|m| m.timestamp >= cutoff_ms);
        removed += before - list.len();
        !list.is_empty()
    });
    removed
}

/// Background task that prunes expired messages across all devices.
pub async fn run_retention_loop(registry: DeviceRegistry, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        let pruned_devices = registry.run_retention_pass().await;
        if pruned_devices > 0 {
            info!("retention pass scheduled for {} devices", pruned_devices);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::models::MessageOrigin;

    fn msg(id: &str, ts: i64) -> StoredMessage {
        StoredMessage {
            message_id: Some(id.to_string()),
            from_self: false,
            timestamp: ts,
            text: None,
            media: None,
            location: None,
            origin: MessageOrigin::Contact,
        }
    }

    #[test]
    fn prune_removes_only_expired_messages() {
        let mut store = DeviceStore::default();
        store.conversation_entry("a@msg");
        store.append_message("a@msg", msg("m1", 100));
        store.append_message("a@msg", msg("m2", 2000));
        store.append_message("a@msg", msg("m3", 3000));

        let removed = prune_store(&mut store, 2000);
        assert_eq!(removed, 1);

        let msgs = store.messages.get("a@msg").unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m.timestamp >= 2000));
    }

    #[test]
    fn emptied_conversation_keeps_metadata_only() {
        let mut store = DeviceStore::default();
        store.conversation_entry("a@msg").unread = 3;
        store.append_message("a@msg", msg("m1", 100));

        prune_store(&mut store, 1000);
        assert!(!store.messages.contains_key("a@msg"));
        assert!(store.conversations.contains_key("a@msg"));
    }
}
