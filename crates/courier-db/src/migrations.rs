use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS devices (
            id          TEXT PRIMARY KEY,
            label       TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            device_id       TEXT NOT NULL REFERENCES devices(id),
            id              TEXT NOT NULL,
            name            TEXT,
            is_group        INTEGER NOT NULL DEFAULT 0,
            last_activity   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (device_id, id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            device_id       TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            message_id      TEXT,
            from_self       INTEGER NOT NULL DEFAULT 0,
            timestamp       INTEGER NOT NULL,
            text            TEXT,
            media           TEXT,
            location        TEXT,
            origin          TEXT NOT NULL,
            UNIQUE (device_id, message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(device_id, conversation_id, timestamp);

        CREATE TABLE IF NOT EXISTS aliases (
            device_id       TEXT NOT NULL,
            raw_id          TEXT NOT NULL,
            canonical_id    TEXT NOT NULL,
            PRIMARY KEY (device_id, raw_id)
        );

        CREATE TABLE IF NOT EXISTS linked_phone (
            device_id   TEXT NOT NULL,
            linked_id   TEXT NOT NULL,
            phone_id    TEXT NOT NULL,
            PRIMARY KEY (device_id, linked_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
