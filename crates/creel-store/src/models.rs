//! Database row types — these map directly to SQLite rows.
//! Distinct from the shared `creel-types` models so the storage layer owns
//! its own parsing and corruption handling.

use chrono::{DateTime, Utc};

use creel_types::models::Message;

use crate::StoreError;

pub struct MessageRow {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub namespace: String,
    pub thread_root: String,
    pub parent: Option<String>,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub created_at: String,
    pub read_at: Option<String>,
    pub is_read: bool,
    pub deleted_by_sender: bool,
    pub deleted_by_recipient: bool,
    pub archived_by_sender: bool,
    pub archived_by_recipient: bool,
}

fn parse_timestamp(field: &str, raw: &str, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("{field} '{raw}' on message '{id}': {e}")))
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let parse_id = |field: &str, value: &str| {
            value.parse().map_err(|e| {
                StoreError::CorruptRow(format!("{field} '{value}' on message '{}': {e}", row.id))
            })
        };

        Ok(Message {
            id: parse_id("id", &row.id)?,
            sender: parse_id("sender", &row.sender)?,
            recipient: parse_id("recipient", &row.recipient)?,
            namespace: row.namespace.parse().map_err(|e| {
                StoreError::CorruptRow(format!("namespace on message '{}': {e}", row.id))
            })?,
            thread_root: parse_id("thread_root", &row.thread_root)?,
            parent: row
                .parent
                .as_deref()
                .map(|p| parse_id("parent", p))
                .transpose()?,
            created_at: parse_timestamp("created_at", &row.created_at, &row.id)?,
            read_at: row
                .read_at
                .as_deref()
                .map(|t| parse_timestamp("read_at", t, &row.id))
                .transpose()?,
            ciphertext: row.ciphertext,
            nonce: row.nonce,
            is_read: row.is_read,
            deleted_by_sender: row.deleted_by_sender,
            deleted_by_recipient: row.deleted_by_recipient,
            archived_by_sender: row.archived_by_sender,
            archived_by_recipient: row.archived_by_recipient,
        })
    }
}
