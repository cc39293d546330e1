//! Deterministic conversation identifiers.

use sha2::{Digest, Sha256};

use crate::identity::{canonical_participants, Identity};
use crate::models::ThreadId;
use crate::types::THREAD_ID_DOMAIN;

/// Tag byte for raw public-key identities.
const KIND_PUBLIC_KEY: u8 = 0x01;

/// Tag byte for legacy address identities.
const KIND_LEGACY_ADDRESS: u8 = 0x02;

/// Derives the thread ID for a set of participants.
///
/// Identities are sorted case-insensitively and duplicates dropped, so any
/// ordering of the same set yields the same ID. Each identity is packed
/// according to its kind: public keys as a tag byte plus the 32 raw key
/// bytes, legacy addresses as a different tag byte, a length byte, and the
/// address text. The two packings can never produce the same byte stream.
pub fn derive_thread_id(participants: &[Identity]) -> ThreadId {
    let sorted = canonical_participants(participants);

    let mut hasher = Sha256::new();
    hasher.update(THREAD_ID_DOMAIN);
    hasher.update((sorted.len() as u32).to_be_bytes());

    for identity in &sorted {
        match identity {
            Identity::PublicKey(key) => {
                hasher.update([KIND_PUBLIC_KEY]);
                hasher.update(key);
            }
            Identity::LegacyAddress(_) => {
                let address = identity.to_string();
                hasher.update([KIND_LEGACY_ADDRESS, address.len() as u8]);
                hasher.update(address.as_bytes());
            }
        }
    }

    ThreadId::new(hex::encode(hasher.finalize()))
}
