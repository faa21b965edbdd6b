//! Conversation identity resolution and persistence core.
//!
//! Each managed device owns one in-memory [`store::DeviceStore`], one
//! pending-send ledger and one persisted log/alias partition. A single
//! actor task per device consumes protocol events to completion, one at a
//! time, so the store never sees concurrent writers; persistence runs in
//! the background through a per-device single-consumer write queue.

pub mod alias;
pub mod device;
pub mod ingest;
pub mod pending;
pub mod persist;
pub mod recent;
pub mod registry;
pub mod resolver;
pub mod retention;
pub mod store;

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("device not found: {0}")]
    DeviceNotFound(Uuid),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("alias backfill requires the relational storage mode")]
    BackfillUnavailable,
    #[error("device is shutting down")]
    DeviceClosed,
}

/// Which durable store is the system of record for a device. The two are
/// mutually exclusive; a device never writes both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Append-only newline-delimited JSON log per device, replayed at
    /// activation.
    FileLog,
    /// Relational rows in sqlite; no local log is written or replayed.
    Relational,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub retention_days: i64,
    pub storage: StorageMode,
}

impl CoreConfig {
    /// Retention cutoff in epoch milliseconds for a given "now".
    pub fn cutoff_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.retention_days * 24 * 60 * 60 * 1000
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
