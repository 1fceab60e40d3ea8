use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Namespace;

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub recipient: Uuid,
    /// Omitted for the first message of a new conversation; the created
    /// root's own id becomes the thread root from then on.
    pub thread_root: Option<Uuid>,
    pub content: String,
}

/// A message with its body already decrypted (or substituted by the
/// fail-closed placeholder). This is the only shape presentation code sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    pub sender: Uuid,
    pub recipient: Uuid,
    pub namespace: Namespace,
    pub thread_root: Uuid,
    pub parent: Option<Uuid>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub is_read: bool,
}

// -- Archive --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetArchivedRequest {
    pub archived: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    #[serde(default)]
    pub include_archived: bool,
}

// -- Unread count --

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub count: u64,
}
