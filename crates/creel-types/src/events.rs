use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Namespace};

/// Events pushed from the store side to open sessions and WebSocket clients.
///
/// Delivery is at-least-once: a message a session just sent can come back to
/// it as a `MessageCreated` event, and the same event can arrive twice.
/// Consumers must deduplicate by message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEvent {
    /// A new encrypted message was appended to the store.
    MessageCreated { message: Message },

    /// A recipient marked a message read. Lets the sender's open view flip
    /// its read marker without reloading the thread.
    MessageRead {
        message_id: Uuid,
        thread_root: Uuid,
        namespace: Namespace,
        sender: Uuid,
        recipient: Uuid,
        read_at: DateTime<Utc>,
    },
}

impl RealtimeEvent {
    /// Whether the event involves the given account as sender or recipient.
    /// Events that don't are never delivered to that account's session.
    pub fn involves(&self, account: Uuid) -> bool {
        match self {
            Self::MessageCreated { message } => message.is_participant(account),
            Self::MessageRead {
                sender, recipient, ..
            } => *sender == account || *recipient == account,
        }
    }
}
