//! Participant identities.
//!
//! An identity is an Ed25519 public key written in one of two textual
//! forms. The form is decided once when the string is parsed and carried
//! as the [`IdentityKind`] tag from then on:
//!
//! - **PublicKey**: 64 lowercase hex characters of the raw key.
//! - **LegacyAddress**: 58-character base32 address made of the key plus a
//!   4-byte SHA-512/256 checksum.
//!
//! Both forms name the same signing key, so signatures verify identically.
//! They are kept distinct for thread ID derivation and ciphertext lookup.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512_256};

use crate::types::{ChatChainError, Result, PUBLIC_KEY_SIZE};

/// Length of a long-form identity string.
const PUBLIC_KEY_HEX_LEN: usize = PUBLIC_KEY_SIZE * 2;

/// Length of a legacy address string.
const LEGACY_ADDRESS_LEN: usize = 58;

/// Length of the address checksum.
const CHECKSUM_LEN: usize = 4;

/// Textual form of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    /// Raw public key, hex-encoded.
    PublicKey,
    /// Base32 address with checksum.
    LegacyAddress,
}

/// A participant identity derived from an Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Long form: raw key material.
    PublicKey([u8; 32]),
    /// Short form: address-style identifier.
    LegacyAddress([u8; 32]),
}

impl Identity {
    /// Creates a long-form identity from a verifying key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self::PublicKey(key.to_bytes())
    }

    /// Returns the textual form of this identity.
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::PublicKey(_) => IdentityKind::PublicKey,
            Self::LegacyAddress(_) => IdentityKind::LegacyAddress,
        }
    }

    /// Returns the underlying Ed25519 public key bytes.
    pub fn key_bytes(&self) -> &[u8; 32] {
        match self {
            Self::PublicKey(bytes) | Self::LegacyAddress(bytes) => bytes,
        }
    }

    /// Returns the long form of the same key.
    pub fn to_public_key_form(&self) -> Self {
        Self::PublicKey(*self.key_bytes())
    }

    /// Returns the legacy short form of the same key.
    pub fn to_legacy_form(&self) -> Self {
        Self::LegacyAddress(*self.key_bytes())
    }

    /// Whether both identities name the same signing key, regardless of form.
    pub fn same_key(&self, other: &Identity) -> bool {
        self.key_bytes() == other.key_bytes()
    }

    /// Returns the Ed25519 verifying key for this identity.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(self.key_bytes()).map_err(|e| {
            ChatChainError::InvalidPublicKey(format!("Invalid Ed25519 public key: {}", e))
        })
    }

    /// Compares two identities case-insensitively by their textual form.
    pub fn cmp_canonical(&self, other: &Identity) -> Ordering {
        self.to_string()
            .to_ascii_lowercase()
            .cmp(&other.to_string().to_ascii_lowercase())
    }
}

/// Sorts identities into canonical participant order and drops duplicates.
pub fn canonical_participants(identities: &[Identity]) -> Vec<Identity> {
    let mut sorted = identities.to_vec();
    sorted.sort_by(|a, b| a.cmp_canonical(b));
    sorted.dedup();
    sorted
}

/// Computes the 4-byte address checksum for a public key.
fn address_checksum(key: &[u8; 32]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha512_256::digest(key);
    let mut checksum = [0u8; CHECKSUM_LEN];
    checksum.copy_from_slice(&digest[digest.len() - CHECKSUM_LEN..]);
    checksum
}

/// Encodes a public key as a legacy base32 address.
fn encode_address(key: &[u8; 32]) -> String {
    let mut data = Vec::with_capacity(PUBLIC_KEY_SIZE + CHECKSUM_LEN);
    data.extend_from_slice(key);
    data.extend_from_slice(&address_checksum(key));
    data_encoding::BASE32_NOPAD.encode(&data)
}

/// Decodes a legacy base32 address into its public key, checking the checksum.
fn decode_address(address: &str) -> Result<[u8; 32]> {
    let decoded = data_encoding::BASE32_NOPAD
        .decode(address.to_ascii_uppercase().as_bytes())
        .map_err(|e| ChatChainError::InvalidIdentity(format!("Bad address encoding: {}", e)))?;
    if decoded.len() != PUBLIC_KEY_SIZE + CHECKSUM_LEN {
        return Err(ChatChainError::InvalidIdentity(format!(
            "Address decodes to {} bytes",
            decoded.len()
        )));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&decoded[..PUBLIC_KEY_SIZE]);
    if decoded[PUBLIC_KEY_SIZE..] != address_checksum(&key) {
        return Err(ChatChainError::InvalidIdentity(
            "Address checksum mismatch".to_string(),
        ));
    }
    Ok(key)
}

impl FromStr for Identity {
    type Err = ChatChainError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let hex_body = s.strip_prefix("0x").unwrap_or(s);

        if hex_body.len() == PUBLIC_KEY_HEX_LEN {
            let bytes = hex::decode(hex_body)
                .map_err(|e| ChatChainError::InvalidIdentity(format!("Bad hex key: {}", e)))?;
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(Self::PublicKey(key));
        }

        if s.len() == LEGACY_ADDRESS_LEN {
            return Ok(Self::LegacyAddress(decode_address(s)?));
        }

        Err(ChatChainError::InvalidIdentity(format!(
            "Unrecognized identity length {}",
            s.len()
        )))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey(key) => f.write_str(&hex::encode(key)),
            Self::LegacyAddress(key) => f.write_str(&encode_address(key)),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self)
    }
}

impl Serialize for Identity {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn random_identity() -> Identity {
        Identity::from_verifying_key(&SigningKey::generate(&mut OsRng).verifying_key())
    }

    #[test]
    fn test_public_key_form_roundtrip() {
        let identity = random_identity();
        let text = identity.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<Identity>().unwrap(), identity);
    }

    #[test]
    fn test_legacy_form_roundtrip() {
        let identity = random_identity().to_legacy_form();
        let text = identity.to_string();
        assert_eq!(text.len(), LEGACY_ADDRESS_LEN);
        assert_eq!(text.parse::<Identity>().unwrap(), identity);
        assert_eq!(identity.kind(), IdentityKind::LegacyAddress);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let identity = random_identity();
        let upper = identity.to_string().to_ascii_uppercase();
        assert_eq!(upper.parse::<Identity>().unwrap(), identity);

        let legacy = identity.to_legacy_form();
        let lower = legacy.to_string().to_ascii_lowercase();
        assert_eq!(lower.parse::<Identity>().unwrap(), legacy);
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let legacy = random_identity().to_legacy_form().to_string();
        let mut chars: Vec<char> = legacy.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();
        assert!(matches!(
            tampered.parse::<Identity>(),
            Err(ChatChainError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_same_key_across_forms() {
        let identity = random_identity();
        let legacy = identity.to_legacy_form();
        assert_ne!(identity, legacy);
        assert!(identity.same_key(&legacy));
    }

    #[test]
    fn test_canonical_participants_sorted_and_deduped() {
        let a = random_identity();
        let b = random_identity();
        let sorted = canonical_participants(&[b, a, b]);
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted, canonical_participants(&[a, b]));
        assert!(sorted[0].cmp_canonical(&sorted[1]) == Ordering::Less);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!("not-an-identity".parse::<Identity>().is_err());
        assert!("".parse::<Identity>().is_err());
    }
}
