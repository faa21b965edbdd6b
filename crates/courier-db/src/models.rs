/// Database row types — these map directly to SQLite rows.
/// Distinct from courier-types API models to keep the DB layer
/// independent.

pub struct DeviceRow {
    pub id: String,
    pub label: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub last_activity: i64,
}

/// Result of a one-shot alias backfill pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackfillStats {
    pub aliases_written: usize,
    pub conversations_merged: usize,
}
