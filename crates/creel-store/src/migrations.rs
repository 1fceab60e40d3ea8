use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS private_messages (
            id                      TEXT PRIMARY KEY,
            sender                  TEXT NOT NULL,
            recipient               TEXT NOT NULL,
            namespace               TEXT NOT NULL CHECK (namespace IN ('site', 'forum')),
            thread_root             TEXT NOT NULL,
            parent                  TEXT,
            ciphertext              BLOB NOT NULL,
            nonce                   BLOB NOT NULL,
            created_at              TEXT NOT NULL,
            read_at                 TEXT,
            is_read                 INTEGER NOT NULL DEFAULT 0,
            deleted_by_sender       INTEGER NOT NULL DEFAULT 0,
            deleted_by_recipient    INTEGER NOT NULL DEFAULT 0,
            archived_by_sender      INTEGER NOT NULL DEFAULT 0,
            archived_by_recipient   INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON private_messages(namespace, thread_root, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_recipient
            ON private_messages(recipient, namespace);

        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON private_messages(sender, namespace);
        ",
    )?;

    info!("message store migrations complete");
    Ok(())
}
