use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use creel_types::models::{Message, Namespace};

use crate::models::MessageRow;
use crate::{Database, Result, StoreError};

const SELECT_COLUMNS: &str = "id, sender, recipient, namespace, thread_root, parent, \
     ciphertext, nonce, created_at, read_at, is_read, \
     deleted_by_sender, deleted_by_recipient, archived_by_sender, archived_by_recipient";

fn now_rfc3339() -> String {
    // Microsecond precision keeps lexicographic order chronological.
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    /// Insert the first message of a new conversation. The message's own id
    /// becomes the thread root for every later reply.
    pub fn create_root(
        &self,
        sender: Uuid,
        recipient: Uuid,
        namespace: Namespace,
        ciphertext: &[u8],
        nonce: &[u8],
    ) -> Result<Message> {
        let id = Uuid::new_v4();
        let created_at = now_rfc3339();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO private_messages \
                     (id, sender, recipient, namespace, thread_root, parent, ciphertext, nonce, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?1, NULL, ?5, ?6, ?7)",
                rusqlite::params![
                    id.to_string(),
                    sender.to_string(),
                    recipient.to_string(),
                    namespace.as_str(),
                    ciphertext,
                    nonce,
                    created_at,
                ],
            )?;
            query_message(conn, id)?.ok_or(StoreError::NotFound)
        })
    }

    /// Append a reply to an existing thread. The reply's parent is the
    /// latest message in the thread; namespace is inherited from the root.
    pub fn append_reply(
        &self,
        thread_root: Uuid,
        sender: Uuid,
        recipient: Uuid,
        ciphertext: &[u8],
        nonce: &[u8],
    ) -> Result<Message> {
        let id = Uuid::new_v4();
        let created_at = now_rfc3339();

        self.with_conn(|conn| {
            let latest: Option<(String, String)> = conn
                .query_row(
                    "SELECT id, namespace FROM private_messages \
                     WHERE thread_root = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                    [thread_root.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (parent, namespace) = latest.ok_or(StoreError::NotFound)?;

            conn.execute(
                "INSERT INTO private_messages \
                     (id, sender, recipient, namespace, thread_root, parent, ciphertext, nonce, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.to_string(),
                    sender.to_string(),
                    recipient.to_string(),
                    namespace,
                    thread_root.to_string(),
                    parent,
                    ciphertext,
                    nonce,
                    created_at,
                ],
            )?;
            query_message(conn, id)?.ok_or(StoreError::NotFound)
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        self.with_conn(|conn| query_message(conn, id)?.ok_or(StoreError::NotFound))
    }

    /// Latest surviving message per thread for the account's listing,
    /// newest thread first. Messages the caller soft-deleted never appear;
    /// messages the caller archived appear only with `include_archived`.
    pub fn list_conversations(
        &self,
        account: Uuid,
        namespace: Namespace,
        include_archived: bool,
    ) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM private_messages \
                 WHERE namespace = ?1 \
                   AND ((sender = ?2 AND deleted_by_sender = 0 \
                         AND (?3 OR archived_by_sender = 0)) \
                     OR (recipient = ?2 AND deleted_by_recipient = 0 \
                         AND (?3 OR archived_by_recipient = 0))) \
                 ORDER BY created_at DESC, id DESC"
            ))?;

            let rows = stmt
                .query_map(
                    rusqlite::params![namespace.as_str(), account.to_string(), include_archived],
                    row_to_message_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        // Rows arrive newest-first; the first row seen per thread is the
        // thread's latest surviving message.
        let mut seen = HashSet::new();
        let mut summaries = Vec::new();
        for row in rows {
            if seen.insert(row.thread_root.clone()) {
                summaries.push(Message::try_from(row)?);
            }
        }
        Ok(summaries)
    }

    /// Full ordered history of one thread, oldest first. Purged threads
    /// come back empty.
    pub fn load_thread(&self, thread_root: Uuid) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM private_messages \
                 WHERE thread_root = ?1 ORDER BY created_at ASC, id ASC"
            ))?;

            let rows = stmt
                .query_map([thread_root.to_string()], row_to_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(Message::try_from).collect()
    }

    /// Mark a message read by its recipient. Idempotent: a second call, a
    /// call by the sender, or a call on a missing message changes nothing.
    /// Returns the read timestamp if this call actually marked the message.
    pub fn mark_read(&self, message_id: Uuid, reader: Uuid) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let stamp = now.to_rfc3339_opts(SecondsFormat::Micros, true);

        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE private_messages SET is_read = 1, read_at = ?1 \
                 WHERE id = ?2 AND recipient = ?3 AND is_read = 0",
                rusqlite::params![stamp, message_id.to_string(), reader.to_string()],
            )?;
            Ok((changed > 0).then_some(now))
        })
    }

    /// Flip the actor's archive flag on a single message. Reversible.
    pub fn set_archived(&self, message_id: Uuid, actor: Uuid, value: bool) -> Result<()> {
        self.with_conn(|conn| {
            let as_sender = conn.execute(
                "UPDATE private_messages SET archived_by_sender = ?1 \
                 WHERE id = ?2 AND sender = ?3",
                rusqlite::params![value, message_id.to_string(), actor.to_string()],
            )?;
            let as_recipient = conn.execute(
                "UPDATE private_messages SET archived_by_recipient = ?1 \
                 WHERE id = ?2 AND recipient = ?3",
                rusqlite::params![value, message_id.to_string(), actor.to_string()],
            )?;

            if as_sender + as_recipient == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Flip the actor's archive flag across a whole thread, so the thread
    /// disappears from (or returns to) the actor's default listing as one
    /// unit.
    pub fn set_archived_thread(&self, thread_root: Uuid, actor: Uuid, value: bool) -> Result<()> {
        self.with_conn(|conn| {
            let as_sender = conn.execute(
                "UPDATE private_messages SET archived_by_sender = ?1 \
                 WHERE thread_root = ?2 AND sender = ?3",
                rusqlite::params![value, thread_root.to_string(), actor.to_string()],
            )?;
            let as_recipient = conn.execute(
                "UPDATE private_messages SET archived_by_recipient = ?1 \
                 WHERE thread_root = ?2 AND recipient = ?3",
                rusqlite::params![value, thread_root.to_string(), actor.to_string()],
            )?;

            if as_sender + as_recipient == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    /// Soft-delete the actor's side of every message in the thread, then
    /// physically purge the messages now deleted by both sides. The purge
    /// is the only hard-delete path in the system; if it fails the soft
    /// flags stay committed and the purge is retried on the next deletion.
    /// Returns the number of purged rows.
    pub fn set_deleted(&self, thread_root: Uuid, actor: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let root = thread_root.to_string();
            let who = actor.to_string();

            // Flags first, atomically. The connection mutex serializes
            // concurrent deletions of the same thread.
            let tx = conn.unchecked_transaction()?;
            let as_sender = tx.execute(
                "UPDATE private_messages SET deleted_by_sender = 1 \
                 WHERE thread_root = ?1 AND sender = ?2",
                rusqlite::params![root, who],
            )?;
            let as_recipient = tx.execute(
                "UPDATE private_messages SET deleted_by_recipient = 1 \
                 WHERE thread_root = ?1 AND recipient = ?2",
                rusqlite::params![root, who],
            )?;
            if as_sender + as_recipient == 0 {
                return Err(StoreError::NotFound);
            }
            tx.commit()?;

            // Purge runs after the flags are durable; a purge failure is
            // eventual-consistency territory, not a rollback.
            match conn.execute(
                "DELETE FROM private_messages \
                 WHERE thread_root = ?1 AND deleted_by_sender = 1 AND deleted_by_recipient = 1",
                [&root],
            ) {
                Ok(purged) => Ok(purged),
                Err(e) => {
                    warn!("purge failed for thread {thread_root}: {e}");
                    Ok(0)
                }
            }
        })
    }

    /// Unread inbox messages for an account in a namespace, excluding
    /// anything the recipient has soft-deleted or archived.
    pub fn count_unread(&self, account: Uuid, namespace: Namespace) -> Result<u64> {
        self.with_conn(|conn| {
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM private_messages \
                 WHERE recipient = ?1 AND namespace = ?2 AND is_read = 0 \
                   AND deleted_by_recipient = 0 AND archived_by_recipient = 0",
                rusqlite::params![account.to_string(), namespace.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

fn query_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM private_messages WHERE id = ?1"
    ))?;

    let row = stmt
        .query_row([id.to_string()], row_to_message_row)
        .optional()?;

    row.map(Message::try_from).transpose()
}

fn row_to_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender: row.get(1)?,
        recipient: row.get(2)?,
        namespace: row.get(3)?,
        thread_root: row.get(4)?,
        parent: row.get(5)?,
        ciphertext: row.get(6)?,
        nonce: row.get(7)?,
        created_at: row.get(8)?,
        read_at: row.get(9)?,
        is_read: row.get(10)?,
        deleted_by_sender: row.get(11)?,
        deleted_by_recipient: row.get(12)?,
        archived_by_sender: row.get(13)?,
        archived_by_recipient: row.get(14)?,
    })
}
