//! Device registry.
//!
//! One registry per process, constructed in `main` and passed by handle to
//! whoever needs it — there is no ambient global state. The registry owns
//! the panel broadcast channel and the protocol command sink, and persists
//! device metadata so devices come back after a restart.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use courier_db::Database;
use courier_types::events::{PanelEvent, ProtocolCommand};
use courier_types::models::DeviceInfo;

use crate::device::{DeviceHandle, spawn_device};
use crate::persist::{AliasFile, MessageLog};
use crate::{CoreConfig, CoreError, StorageMode, now_ms};

const PANEL_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: CoreConfig,
    devices: RwLock<HashMap<Uuid, DeviceHandle>>,
    panel_tx: broadcast::Sender<PanelEvent>,
    proto_tx: mpsc::UnboundedSender<ProtocolCommand>,
    db: Option<Arc<Database>>,
}

impl DeviceRegistry {
    /// Open the registry: prepare the data directory, open the database
    /// when the relational mode is configured, and revive every persisted
    /// device.
    pub async fn open(
        config: CoreConfig,
        proto_tx: mpsc::UnboundedSender<ProtocolCommand>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

        let db = match config.storage {
            StorageMode::Relational => {
                let path = config.data_dir.join("courier.db");
                Some(Arc::new(Database::open(&path)?))
            }
            StorageMode::FileLog => None,
        };

        let (panel_tx, _) = broadcast::channel(PANEL_CHANNEL_CAPACITY);
        let registry = Self {
            inner: Arc::new(RegistryInner {
                config,
                devices: RwLock::new(HashMap::new()),
                panel_tx,
                proto_tx,
                db,
            }),
        };

        for info in registry.load_device_metadata()? {
            registry.activate(info).await;
        }

        let count = registry.inner.devices.read().await.len();
        info!("device registry ready with {} device(s)", count);
        Ok(registry)
    }

    /// Subscribe to the normalized panel event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.inner.panel_tx.subscribe()
    }

    pub fn panel_sender(&self) -> broadcast::Sender<PanelEvent> {
        self.inner.panel_tx.clone()
    }

    pub async fn list(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .inner
            .devices
            .read()
            .await
            .values()
            .map(|h| h.info.clone())
            .collect();
        devices.sort_by_key(|d| d.created_at);
        devices
    }

    pub async fn get(&self, id: Uuid) -> Result<DeviceHandle, CoreError> {
        self.inner
            .devices
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoreError::DeviceNotFound(id))
    }

    pub async fn add_device(&self, label: String) -> Result<DeviceInfo> {
        let info = DeviceInfo {
            id: Uuid::new_v4(),
            label,
            created_at: chrono::Utc::now(),
        };
        self.persist_device_metadata(&info)?;
        self.activate(info.clone()).await;
        info!("device added: {} ({})", info.label, info.id);
        Ok(info)
    }

    /// Tear a device down: wait for its queue to drain, then delete all
    /// derived state.
    pub async fn remove_device(&self, id: Uuid) -> Result<(), CoreError> {
        let handle = {
            let mut devices = self.inner.devices.write().await;
            devices.remove(&id).ok_or(CoreError::DeviceNotFound(id))?
        };
        handle.shutdown().await;

        match self.inner.config.storage {
            StorageMode::FileLog => {
                let log = MessageLog::new(&self.inner.config.data_dir, id);
                let aliases = AliasFile::new(&self.inner.config.data_dir, id);
                if let Err(e) = log.delete() {
                    warn!("failed deleting log for {}: {}", id, e);
                }
                if let Err(e) = aliases.delete() {
                    warn!("failed deleting alias file for {}: {}", id, e);
                }
                if let Err(e) = self.rewrite_metadata_without(id) {
                    warn!("failed rewriting device metadata: {}", e);
                }
            }
            StorageMode::Relational => {
                if let Some(db) = self.inner.db.clone() {
                    let did = id.to_string();
                    let res =
                        tokio::task::spawn_blocking(move || db.delete_device(&did)).await;
                    if let Ok(Err(e)) = res {
                        warn!("failed deleting device rows for {}: {}", id, e);
                    }
                }
            }
        }
        info!("device removed: {}", id);
        Ok(())
    }

    /// One retention pass: prune in-memory state and schedule compaction
    /// on every device. Returns the number of devices touched.
    pub async fn run_retention_pass(&self) -> usize {
        let cutoff = self.inner.config.cutoff_ms(now_ms());
        let devices = self.inner.devices.read().await;
        for handle in devices.values() {
            let _ = handle.prune(cutoff);
        }
        devices.len()
    }

    /// Drain every device's queue. Used at process shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<DeviceHandle> = {
            let devices = self.inner.devices.read().await;
            devices.values().cloned().collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    async fn activate(&self, info: DeviceInfo) {
        let handle = spawn_device(
            info.clone(),
            &self.inner.config,
            self.inner.panel_tx.clone(),
            self.inner.proto_tx.clone(),
            self.inner.db.clone(),
        )
        .await;

        // relational mode runs the alias backfill once per activation
        if self.inner.db.is_some() {
            if let Err(e) = handle.backfill().await {
                warn!("activation backfill failed for {}: {}", info.id, e);
            }
        }

        self.inner.devices.write().await.insert(info.id, handle);
    }

    fn metadata_path(&self) -> PathBuf {
        self.inner.config.data_dir.join("devices.json")
    }

    fn load_device_metadata(&self) -> Result<Vec<DeviceInfo>> {
        if let Some(db) = &self.inner.db {
            let rows = db.list_devices()?;
            return Ok(rows
                .into_iter()
                .filter_map(|row| {
                    let id = row.id.parse().ok()?;
                    let created_at = row.created_at.parse().ok()?;
                    Some(DeviceInfo {
                        id,
                        label: row.label,
                        created_at,
                    })
                })
                .collect());
        }

        let path = self.metadata_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn persist_device_metadata(&self, info: &DeviceInfo) -> Result<()> {
        if let Some(db) = &self.inner.db {
            db.insert_device(
                &info.id.to_string(),
                &info.label,
                &info.created_at.to_rfc3339(),
            )?;
            return Ok(());
        }

        let mut all = self.load_device_metadata()?;
        all.push(info.clone());
        fs::write(self.metadata_path(), serde_json::to_vec_pretty(&all)?)?;
        Ok(())
    }

    fn rewrite_metadata_without(&self, id: Uuid) -> Result<()> {
        let all: Vec<DeviceInfo> = self
            .load_device_metadata()?
            .into_iter()
            .filter(|d| d.id != id)
            .collect();
        fs::write(self.metadata_path(), serde_json::to_vec_pretty(&all)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::events::{MessagePayload, MessageUpsert, ProtocolEvent};

    fn config(dir: &std::path::Path) -> CoreConfig {
        CoreConfig {
            data_dir: dir.to_path_buf(),
            retention_days: 90,
            storage: StorageMode::FileLog,
        }
    }

    #[tokio::test]
    async fn devices_survive_registry_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::open(config(dir.path()), proto_tx)
            .await
            .unwrap();

        let info = registry.add_device("desk phone".into()).await.unwrap();
        let handle = registry.get(info.id).await.unwrap();
        handle
            .deliver(ProtocolEvent::Message(MessageUpsert {
                chat_id: "123@msg".into(),
                alt_chat_id: None,
                message_id: Some("m1".into()),
                from_self: false,
                timestamp: now_ms(),
                payload: MessagePayload::Text { body: "hi".into() },
            }))
            .unwrap();
        registry.shutdown().await;

        let (proto_tx2, _proto_rx2) = mpsc::unbounded_channel();
        let revived = DeviceRegistry::open(config(dir.path()), proto_tx2)
            .await
            .unwrap();
        let devices = revived.list().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].label, "desk phone");

        let handle = revived.get(info.id).await.unwrap();
        let convs = handle.list_conversations().await.unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].id, "123@msg");
    }

    #[tokio::test]
    async fn remove_device_deletes_derived_state() {
        let dir = tempfile::tempdir().unwrap();
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::open(config(dir.path()), proto_tx)
            .await
            .unwrap();

        let info = registry.add_device("old phone".into()).await.unwrap();
        registry.remove_device(info.id).await.unwrap();

        assert!(matches!(
            registry.get(info.id).await,
            Err(CoreError::DeviceNotFound(_))
        ));
        assert!(!dir.path().join(format!("{}.log", info.id)).exists());

        // gone after a restart too
        let (proto_tx2, _proto_rx2) = mpsc::unbounded_channel();
        let revived = DeviceRegistry::open(config(dir.path()), proto_tx2)
            .await
            .unwrap();
        assert!(revived.list().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_device_is_a_typed_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (proto_tx, _proto_rx) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::open(config(dir.path()), proto_tx)
            .await
            .unwrap();
        assert!(matches!(
            registry.get(Uuid::new_v4()).await,
            Err(CoreError::DeviceNotFound(_))
        ));
    }
}
