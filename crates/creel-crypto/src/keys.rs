//! Conversation key derivation.
//!
//! Key derivation: HKDF-SHA256(sorted pair of account ids, fixed salt,
//! info "creel private messages") → 32-byte AES key.
//!
//! The identifiers are sorted before combining, so either participant
//! derives the identical key without a handshake or any stored key
//! material.
//!
//! Known limitation: the key is derived entirely from the two public
//! account identifiers. It keeps message bodies opaque to anyone who never
//! learns the derivation scheme, but not to an operator of the store who
//! does. A negotiated-secret scheme would be a protocol change, not a
//! drop-in replacement, and is deliberately out of scope here.

use hkdf::Hkdf;
use sha2::Sha256;
use uuid::Uuid;

use crate::{CryptoError, KEY_SIZE};

const SALT: &[u8] = b"creel-messages-v1";
const INFO: &[u8] = b"creel private messages";

/// Derive the symmetric key for the conversation between two accounts.
/// Deterministic and order-independent: `derive(a, b) == derive(b, a)`.
pub fn derive_conversation_key(a: Uuid, b: Uuid) -> Result<[u8; KEY_SIZE], CryptoError> {
    if a.is_nil() || b.is_nil() {
        return Err(CryptoError::InvalidInput("nil account id"));
    }

    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let ikm = format!("{lo}-{hi}");

    let hk = Hkdf::<Sha256>::new(Some(SALT), ikm.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    hk.expand(INFO, &mut key)
        .map_err(|_| CryptoError::InvalidInput("kdf output length"))?;

    Ok(key)
}
