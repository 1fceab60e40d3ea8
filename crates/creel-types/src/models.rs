use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Isolation boundary for conversations. A thread never spans namespaces:
/// the same pair of accounts can hold one conversation on the site and an
/// entirely separate one on the forum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Site,
    Forum,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Forum => "forum",
        }
    }
}

impl FromStr for Namespace {
    type Err = UnknownNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "site" => Ok(Self::Site),
            "forum" => Ok(Self::Forum),
            other => Err(UnknownNamespace(other.to_string())),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown namespace: {0}")]
pub struct UnknownNamespace(pub String);

/// Which side of a conversation an account sits on for a given message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Sender,
    Recipient,
}

/// Messages stored in creel are always encrypted. Plaintext exists only in
/// memory, reconstructed on read — it is never part of this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: Uuid,
    pub recipient: Uuid,
    pub namespace: Namespace,
    /// Id of the conversation's first message. For the root itself,
    /// `thread_root == id`.
    pub thread_root: Uuid,
    /// The message being replied to. `None` for thread roots.
    pub parent: Option<Uuid>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub deleted_by_sender: bool,
    pub deleted_by_recipient: bool,
    pub archived_by_sender: bool,
    pub archived_by_recipient: bool,
}

impl Message {
    /// Side the account occupies on this message, or `None` for outsiders.
    pub fn side_of(&self, account: Uuid) -> Option<Side> {
        if account == self.sender {
            Some(Side::Sender)
        } else if account == self.recipient {
            Some(Side::Recipient)
        } else {
            None
        }
    }

    pub fn is_participant(&self, account: Uuid) -> bool {
        self.side_of(account).is_some()
    }

    /// The conversation partner from the account's point of view.
    pub fn other_party(&self, account: Uuid) -> Option<Uuid> {
        match self.side_of(account)? {
            Side::Sender => Some(self.recipient),
            Side::Recipient => Some(self.sender),
        }
    }

    pub fn deleted_by(&self, account: Uuid) -> bool {
        match self.side_of(account) {
            Some(Side::Sender) => self.deleted_by_sender,
            Some(Side::Recipient) => self.deleted_by_recipient,
            None => false,
        }
    }
}

/// Serde helper: binary fields travel as base64 strings on the wire.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        B64.decode(s).map_err(serde::de::Error::custom)
    }
}
