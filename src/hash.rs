//! Deterministic message hashing.
//!
//! The hash of a [`SignedMessage`] is SHA-256 over a canonical JSON array
//! of its fields in a fixed order. Ciphertext maps are `BTreeMap`s, so
//! their keys always serialize sorted and two implementations agree on
//! identical content.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::models::SignedMessage;
use crate::types::{ChatChainError, Result};

/// A 32-byte SHA-256 digest, written as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChainHash([u8; 32]);

impl ChainHash {
    /// The `prev_hash` value of the first message in a chain.
    pub const ZERO: ChainHash = ChainHash([0u8; 32]);

    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hashes arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ChainHash {
    type Err = ChatChainError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(body)
            .map_err(|e| ChatChainError::InvalidEnvelope(format!("Bad hash hex: {}", e)))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            ChatChainError::InvalidEnvelope(format!("Hash must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainHash({})", self.to_hex())
    }
}

impl Serialize for ChainHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChainHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Canonical byte encoding of every hashed field of a message.
///
/// Field order: `message_id, index, participants, sender, encrypted_for,
/// encrypted_metadata_for, prev_hash, timestamp, thread_id, reply_to`.
/// `hash` and `signature` are excluded; a missing `reply_to` encodes as "".
pub fn canonical_encoding(message: &SignedMessage) -> Result<Vec<u8>> {
    let mut participants: Vec<String> = message
        .participants
        .iter()
        .map(|p| p.to_string())
        .collect();
    participants.sort_by_key(|p| p.to_ascii_lowercase());

    let fields = serde_json::json!([
        message.message_id,
        message.index,
        participants,
        message.sender.to_string(),
        serde_json::to_string(&message.encrypted_for)?,
        serde_json::to_string(&message.encrypted_metadata_for)?,
        message.prev_hash.to_hex(),
        message.timestamp,
        message.thread_id.as_str(),
        message.reply_to.as_deref().unwrap_or(""),
    ]);

    Ok(serde_json::to_vec(&fields)?)
}

/// Computes the chain hash of a message from all fields except `hash` and
/// `signature`.
pub fn compute_hash(message: &SignedMessage) -> Result<ChainHash> {
    Ok(ChainHash::digest(&canonical_encoding(message)?))
}
