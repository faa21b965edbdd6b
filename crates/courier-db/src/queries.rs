use std::collections::HashMap;

use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

use courier_types::ident;
use courier_types::models::StoredMessage;

use crate::Database;
use crate::models::{BackfillStats, ConversationRow, DeviceRow};

impl Database {
    // -- Devices --

    pub fn insert_device(&self, id: &str, label: &str, created_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO devices (id, label, created_at) VALUES (?1, ?2, ?3)",
                (id, label, created_at),
            )?;
            Ok(())
        })
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, label, created_at FROM devices ORDER BY created_at")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(DeviceRow {
                        id: row.get(0)?,
                        label: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Remove the device row and every row derived from it.
    pub fn delete_device(&self, device_id: &str) -> Result<()> {
        self.clear_device_state(device_id)?;
        self.with_conn(|conn| {
            conn.execute("DELETE FROM devices WHERE id = ?1", [device_id])?;
            Ok(())
        })
    }

    pub fn clear_device_state(&self, device_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM messages WHERE device_id = ?1", [device_id])?;
            conn.execute("DELETE FROM conversations WHERE device_id = ?1", [device_id])?;
            conn.execute("DELETE FROM aliases WHERE device_id = ?1", [device_id])?;
            conn.execute("DELETE FROM linked_phone WHERE device_id = ?1", [device_id])?;
            Ok(())
        })
    }

    // -- Messages --

    /// Insert one message and keep its conversation row current.
    /// Idempotent by message id: a duplicate insert is ignored and
    /// reported as false.
    pub fn store_message(
        &self,
        device_id: &str,
        conversation_id: &str,
        display_name: Option<&str>,
        is_group: bool,
        message: &StoredMessage,
    ) -> Result<bool> {
        let media = message
            .media
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let location = message
            .location
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let origin = serde_json::to_value(message.origin)?
            .as_str()
            .unwrap_or("contact")
            .to_string();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (device_id, id, name, is_group, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (device_id, id) DO UPDATE SET
                     last_activity = max(conversations.last_activity, excluded.last_activity),
                     name = coalesce(conversations.name, excluded.name)",
                rusqlite::params![
                    device_id,
                    conversation_id,
                    display_name,
                    is_group,
                    message.timestamp
                ],
            )?;

            let inserted = conn.execute(
                "INSERT OR IGNORE INTO messages
                     (device_id, conversation_id, message_id, from_self, timestamp, text, media, location, origin)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    device_id,
                    conversation_id,
                    message.message_id,
                    message.from_self,
                    message.timestamp,
                    message.text,
                    media,
                    location,
                    origin
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn prune_messages(&self, device_id: &str, cutoff_ms: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM messages WHERE device_id = ?1 AND timestamp < ?2",
                rusqlite::params![device_id, cutoff_ms],
            )?;
            Ok(deleted)
        })
    }

    // -- Aliases --

    /// Overwrite the persisted alias table with the in-memory snapshot.
    pub fn replace_aliases(
        &self,
        device_id: &str,
        aliases: &HashMap<String, String>,
        linked_phone: &[(String, String)],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM aliases WHERE device_id = ?1", [device_id])?;
            tx.execute("DELETE FROM linked_phone WHERE device_id = ?1", [device_id])?;
            for (raw, canonical) in aliases {
                tx.execute(
                    "INSERT INTO aliases (device_id, raw_id, canonical_id) VALUES (?1, ?2, ?3)",
                    rusqlite::params![device_id, raw, canonical],
                )?;
            }
            for (linked, phone) in linked_phone {
                tx.execute(
                    "INSERT INTO linked_phone (device_id, linked_id, phone_id) VALUES (?1, ?2, ?3)",
                    rusqlite::params![device_id, linked, phone],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn load_aliases(
        &self,
        device_id: &str,
    ) -> Result<(HashMap<String, String>, Vec<(String, String)>)> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT raw_id, canonical_id FROM aliases WHERE device_id = ?1")?;
            let aliases = stmt
                .query_map([device_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<HashMap<_, _>, _>>()?;

            let mut stmt =
                conn.prepare("SELECT linked_id, phone_id FROM linked_phone WHERE device_id = ?1")?;
            let pairs = stmt
                .query_map([device_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok((aliases, pairs))
        })
    }

    // -- Backfill --

    /// One-shot per-activation backfill: make sure every known identifier
    /// has an alias row, then merge conversation rows that share a
    /// normalized phone key into the most-recently-active row.
    pub fn backfill_aliases(
        &self,
        device_id: &str,
        known: &[(String, String)],
    ) -> Result<BackfillStats> {
        let mut stats = BackfillStats::default();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for (raw, canonical) in known {
                let written = tx.execute(
                    "INSERT INTO aliases (device_id, raw_id, canonical_id) VALUES (?1, ?2, ?3)
                     ON CONFLICT (device_id, raw_id) DO UPDATE SET canonical_id = excluded.canonical_id
                     WHERE canonical_id != excluded.canonical_id",
                    rusqlite::params![device_id, raw, canonical],
                )?;
                stats.aliases_written += written;
            }
            tx.commit()?;
            Ok(())
        })?;

        let conversations = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, last_activity FROM conversations WHERE device_id = ?1",
            )?;
            let rows = stmt
                .query_map([device_id], |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        last_activity: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        // group durable rows by phone key; rows with no key never merge
        let mut by_key: HashMap<String, Vec<&ConversationRow>> = HashMap::new();
        for row in &conversations {
            if let Some(key) = ident::normalized_phone_key(&row.id) {
                by_key.entry(key).or_default().push(row);
            }
        }

        for (key, mut rows) in by_key {
            if rows.len() < 2 {
                continue;
            }
            rows.sort_by_key(|r| std::cmp::Reverse(r.last_activity));
            let winner = rows[0].id.clone();
            debug!("merging {} duplicate rows for phone key {}", rows.len() - 1, key);

            self.with_conn_mut(|conn| {
                let tx = conn.transaction()?;
                for loser in &rows[1..] {
                    tx.execute(
                        "UPDATE messages SET conversation_id = ?1
                         WHERE device_id = ?2 AND conversation_id = ?3",
                        rusqlite::params![winner, device_id, loser.id],
                    )?;
                    tx.execute(
                        "UPDATE aliases SET canonical_id = ?1
                         WHERE device_id = ?2 AND canonical_id = ?3",
                        rusqlite::params![winner, device_id, loser.id],
                    )?;
                    tx.execute(
                        "INSERT INTO aliases (device_id, raw_id, canonical_id) VALUES (?1, ?2, ?3)
                         ON CONFLICT (device_id, raw_id) DO UPDATE SET canonical_id = excluded.canonical_id",
                        rusqlite::params![device_id, loser.id, winner],
                    )?;
                    tx.execute(
                        "DELETE FROM conversations WHERE device_id = ?1 AND id = ?2",
                        rusqlite::params![device_id, loser.id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })?;
            stats.conversations_merged += rows.len() - 1;
        }

        Ok(stats)
    }
}
