//! Thread engine: builds decrypted conversation views from stored rows,
//! orchestrates sends, read-marking, archiving and deletion.

pub mod engine;
pub mod view;

pub use engine::{DECRYPT_PLACEHOLDER, ThreadEngine};
pub use view::{ThreadEntry, ThreadView, ViewState};

use creel_crypto::CryptoError;
use creel_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed identifiers or empty content, rejected before any I/O.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Never escapes a view load; loads substitute the placeholder instead.
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("message or thread not found")]
    NotFound,
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::CorruptRow(msg) => Self::StoreUnavailable(msg),
        }
    }
}

impl From<CryptoError> for EngineError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidInput(msg) => Self::InvalidInput(msg.to_string()),
            CryptoError::EncryptionFailed => Self::InvalidInput("unencryptable content".into()),
            CryptoError::DecryptionFailed => Self::DecryptionFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
