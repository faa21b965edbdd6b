//! Durable storage behind a per-device write queue.
//!
//! All writes for a device — appends, alias snapshots, compaction,
//! truncation — go through one single-consumer queue, so a compaction can
//! never race an append and a later write always lands after an earlier
//! one. Write failures are logged and swallowed: the in-memory store stays
//! authoritative for the session, a failed write only risks losing that
//! one record on crash.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_db::Database;
use courier_types::models::StoredMessage;

/// One line of the append-only per-device message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub conversation_id: String,
    /// Display-name context at write time, used to rebuild conversation
    /// metadata on replay.
    pub display_name: Option<String>,
    pub is_group: bool,
    pub message: StoredMessage,
}

/// Newline-delimited JSON log, one per device.
#[derive(Debug, Clone)]
pub struct MessageLog {
    path: PathBuf,
}

impl MessageLog {
    pub fn new(data_dir: &Path, device_id: Uuid) -> Self {
        Self {
            path: data_dir.join(format!("{device_id}.log")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &LogRecord) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read the whole log forward. Malformed lines are skipped with a
    /// warning rather than poisoning the replay.
    pub fn read_all(&self) -> anyhow::Result<Vec<LogRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(rec) => records.push(rec),
                Err(e) => warn!(
                    "skipping malformed log line {} in {}: {}",
                    lineno + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }

    /// Rewrite the log keeping only records at or after the cutoff. The
    /// replacement is written to a temporary file and atomically renamed
    /// over the original. Returns how many records were dropped.
    pub fn compact(&self, cutoff_ms: i64) -> anyhow::Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let records = self.read_all()?;
        let before = records.len();
        let kept: Vec<&LogRecord> = records
            .iter()
            .filter(|r| r.message.timestamp >= cutoff_ms)
            .collect();
        let dropped = before - kept.len();
        if dropped == 0 {
            return Ok(0);
        }

        let tmp = self.path.with_extension("log.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for rec in &kept {
                let line = serde_json::to_string(rec)?;
                writeln!(file, "{line}")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(dropped)
    }

    pub fn truncate(&self) -> anyhow::Result<()> {
        fs::write(&self.path, b"")?;
        Ok(())
    }

    pub fn delete(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Durable copy of the alias table and the linked↔phone pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasSnapshot {
    pub aliases: HashMap<String, String>,
    pub linked_phone: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct AliasFile {
    path: PathBuf,
}

impl AliasFile {
    pub fn new(data_dir: &Path, device_id: Uuid) -> Self {
        Self {
            path: data_dir.join(format!("{device_id}.aliases.json")),
        }
    }

    pub fn save(&self, snapshot: &AliasSnapshot) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn load(&self) -> anyhow::Result<Option<AliasSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn delete(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Jobs accepted by a device's write queue.
#[derive(Debug)]
pub enum WriteJob {
    Append(LogRecord),
    SaveAliases(AliasSnapshot),
    Compact { cutoff_ms: i64 },
    Truncate,
    /// Completes once every previously enqueued job has run.
    Flush(oneshot::Sender<()>),
}

/// Where a device's writes land. The two modes are mutually exclusive; a
/// device never writes both.
pub enum StorageBackend {
    Log { log: MessageLog, aliases: AliasFile },
    Relational { db: Arc<Database>, device_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl WriterHandle {
    pub fn append(&self, record: LogRecord) {
        let _ = self.tx.send(WriteJob::Append(record));
    }

    pub fn save_aliases(&self, snapshot: AliasSnapshot) {
        let _ = self.tx.send(WriteJob::SaveAliases(snapshot));
    }

    pub fn compact(&self, cutoff_ms: i64) {
        let _ = self.tx.send(WriteJob::Compact { cutoff_ms });
    }

    pub fn truncate(&self) {
        let _ = self.tx.send(WriteJob::Truncate);
    }

    /// Wait for the queue to drain. Used by shutdown and tests; there is
    /// no cancellation for in-flight writes, they run to completion.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriteJob::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the single-consumer writer task for one device.
pub fn spawn_writer(backend: StorageBackend) -> WriterHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match &backend {
                StorageBackend::Log { log, aliases } => run_log_job(log, aliases, job),
                StorageBackend::Relational { db, device_id } => {
                    run_db_job(db, *device_id, job).await;
                }
            }
        }
        debug!("writer queue closed");
    });
    WriterHandle { tx }
}

fn run_log_job(log: &MessageLog, aliases: &AliasFile, job: WriteJob) {
    match job {
        WriteJob::Append(record) => {
            if let Err(e) = log.append(&record) {
                warn!("log append failed for {}: {}", log.path().display(), e);
            }
        }
        WriteJob::SaveAliases(snapshot) => {
            if let Err(e) = aliases.save(&snapshot) {
                warn!("alias snapshot write failed: {}", e);
            }
        }
        WriteJob::Compact { cutoff_ms } => match log.compact(cutoff_ms) {
            Ok(0) => {}
            Ok(dropped) => info!(
                "compacted {}: dropped {} expired records",
                log.path().display(),
                dropped
            ),
            Err(e) => warn!("compaction failed for {}: {}", log.path().display(), e),
        },
        WriteJob::Truncate => {
            if let Err(e) = log.truncate() {
                warn!("log truncate failed: {}", e);
            }
        }
        WriteJob::Flush(done) => {
            let _ = done.send(());
        }
    }
}

async fn run_db_job(db: &Arc<Database>, device_id: Uuid, job: WriteJob) {
    // rusqlite is blocking; run each job off the async runtime, awaited
    // in turn so the per-device ordering still holds
    let db = db.clone();
    let did = device_id.to_string();
    match job {
        WriteJob::Append(record) => {
            let res = tokio::task::spawn_blocking(move || {
                db.store_message(
                    &did,
                    &record.conversation_id,
                    record.display_name.as_deref(),
                    record.is_group,
                    &record.message,
                )
            })
            .await;
            match res {
                Ok(Err(e)) => warn!("db message insert failed: {}", e),
                Err(e) => warn!("db writer join error: {}", e),
                Ok(Ok(_)) => {}
            }
        }
        WriteJob::SaveAliases(snapshot) => {
            let res = tokio::task::spawn_blocking(move || {
                db.replace_aliases(&did, &snapshot.aliases, &snapshot.linked_phone)
            })
            .await;
            match res {
                Ok(Err(e)) => warn!("db alias write failed: {}", e),
                Err(e) => warn!("db writer join error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        WriteJob::Compact { cutoff_ms } => {
            let res =
                tokio::task::spawn_blocking(move || db.prune_messages(&did, cutoff_ms)).await;
            match res {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => info!("pruned {} expired message rows for device {}", n, device_id),
                Ok(Err(e)) => warn!("db prune failed: {}", e),
                Err(e) => warn!("db writer join error: {}", e),
            }
        }
        WriteJob::Truncate => {
            let res = tokio::task::spawn_blocking(move || db.clear_device_state(&did)).await;
            match res {
                Ok(Err(e)) => warn!("db clear failed: {}", e),
                Err(e) => warn!("db writer join error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        WriteJob::Flush(done) => {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::models::{MessageOrigin, StoredMessage};

    fn record(conv: &str, id: &str, ts: i64) -> LogRecord {
        LogRecord {
            conversation_id: conv.to_string(),
            display_name: None,
            is_group: false,
            message: StoredMessage {
                message_id: Some(id.to_string()),
                from_self: false,
                timestamp: ts,
                text: Some("hello".into()),
                media: None,
                location: None,
                origin: MessageOrigin::Contact,
            },
        }
    }

    #[test]
    fn append_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::new(dir.path(), Uuid::new_v4());
        log.append(&record("c@msg", "m1", 100)).unwrap();
        log.append(&record("c@msg", "m2", 200)).unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message.message_id.as_deref(), Some("m1"));
        assert_eq!(records[1].message.timestamp, 200);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::new(dir.path(), Uuid::new_v4());
        log.append(&record("c@msg", "m1", 100)).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
            writeln!(f, "{{not json").unwrap();
        }
        log.append(&record("c@msg", "m2", 200)).unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn compact_drops_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::new(dir.path(), Uuid::new_v4());
        log.append(&record("c@msg", "old", 100)).unwrap();
        log.append(&record("c@msg", "new", 5000)).unwrap();

        let dropped = log.compact(1000).unwrap();
        assert_eq!(dropped, 1);

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message.message_id.as_deref(), Some("new"));

        // nothing left to drop: second pass rewrites nothing
        assert_eq!(log.compact(1000).unwrap(), 0);
    }

    #[test]
    fn alias_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = AliasFile::new(dir.path(), Uuid::new_v4());
        assert!(file.load().unwrap().is_none());

        let mut snapshot = AliasSnapshot::default();
        snapshot
            .aliases
            .insert("123:2@msg".into(), "123@msg".into());
        snapshot
            .linked_phone
            .push(("abc@linked".into(), "123@msg".into()));
        file.save(&snapshot).unwrap();

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.aliases.get("123:2@msg").unwrap(), "123@msg");
        assert_eq!(loaded.linked_phone.len(), 1);
    }

    #[tokio::test]
    async fn writer_preserves_order_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let device_id = Uuid::new_v4();
        let log = MessageLog::new(dir.path(), device_id);
        let aliases = AliasFile::new(dir.path(), device_id);
        let writer = spawn_writer(StorageBackend::Log {
            log: log.clone(),
            aliases,
        });

        writer.append(record("c@msg", "old", 10));
        writer.append(record("c@msg", "new", 10_000));
        // compaction is queued behind the appends, never racing them
        writer.compact(1000);
        writer.flush().await;

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message.message_id.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn truncate_empties_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let device_id = Uuid::new_v4();
        let log = MessageLog::new(dir.path(), device_id);
        let aliases = AliasFile::new(dir.path(), device_id);
        let writer = spawn_writer(StorageBackend::Log {
            log: log.clone(),
            aliases,
        });

        writer.append(record("c@msg", "m1", 10));
        writer.truncate();
        writer.flush().await;
        assert!(log.read_all().unwrap().is_empty());
    }
}
