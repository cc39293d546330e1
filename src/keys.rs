//! Key derivation and local key material.

use std::fmt;

use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::identity::Identity;
use crate::types::{ChatChainError, Result, KEY_DERIVATION_INFO, KEY_DERIVATION_SALT};

/// Derive X25519 key pair from a 32-byte seed using HKDF-SHA256.
///
/// # Arguments
/// * `seed` - 32-byte seed (the same seed that backs the signing key)
///
/// # Returns
/// Tuple of (private_key, public_key)
pub fn derive_keys_from_seed(seed: &[u8]) -> Result<(StaticSecret, PublicKey)> {
    let seed: &[u8; 32] = seed
        .try_into()
        .map_err(|_| ChatChainError::InvalidSeedLength(seed.len()))?;
    Ok(derive_encryption_keys(seed))
}

fn derive_encryption_keys(seed: &[u8; 32]) -> (StaticSecret, PublicKey) {
    let hkdf = Hkdf::<Sha256>::new(Some(KEY_DERIVATION_SALT), seed);
    let mut derived_key = [0u8; 32];
    hkdf.expand(KEY_DERIVATION_INFO, &mut derived_key)
        .expect("32 bytes is a valid length for HKDF-SHA256");

    let private_key = StaticSecret::from(derived_key);
    let public_key = PublicKey::from(&private_key);
    (private_key, public_key)
}

/// Generate a random ephemeral X25519 key pair for message encryption.
pub fn generate_ephemeral_keypair() -> (StaticSecret, PublicKey) {
    let private_key = StaticSecret::random_from_rng(rand::thread_rng());
    let public_key = PublicKey::from(&private_key);
    (private_key, public_key)
}

/// Perform X25519 ECDH key exchange.
pub fn x25519_ecdh(private_key: &StaticSecret, public_key: &PublicKey) -> [u8; 32] {
    private_key.diffie_hellman(public_key).to_bytes()
}

/// The local participant's signing and encryption keys.
///
/// Both key pairs come from one 32-byte seed: the seed is the Ed25519
/// signing key, and the X25519 encryption key is HKDF-derived from it.
pub struct LocalIdentity {
    signing_key: SigningKey,
    encryption_private_key: StaticSecret,
    encryption_public_key: PublicKey,
}

impl LocalIdentity {
    /// Creates the local identity from a 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let seed_bytes: [u8; 32] = seed
            .try_into()
            .map_err(|_| ChatChainError::InvalidSeedLength(seed.len()))?;
        let (encryption_private_key, encryption_public_key) = derive_encryption_keys(&seed_bytes);

        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed_bytes),
            encryption_private_key,
            encryption_public_key,
        })
    }

    /// Creates a fresh random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let (encryption_private_key, encryption_public_key) =
            derive_encryption_keys(&signing_key.to_bytes());

        Self {
            signing_key,
            encryption_private_key,
            encryption_public_key,
        }
    }

    /// Long-form identity of this participant.
    pub fn identity(&self) -> Identity {
        Identity::from_verifying_key(&self.signing_key.verifying_key())
    }

    /// Legacy short-form identity of the same key.
    pub fn legacy_identity(&self) -> Identity {
        self.identity().to_legacy_form()
    }

    /// The Ed25519 signing key.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// The X25519 encryption private key.
    pub fn encryption_private_key(&self) -> &StaticSecret {
        &self.encryption_private_key
    }

    /// The X25519 encryption public key as bytes.
    pub fn encryption_public_key(&self) -> [u8; 32] {
        *self.encryption_public_key.as_bytes()
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("identity", &self.identity())
            .field("encryption_public_key", &hex::encode(self.encryption_public_key()))
            .finish_non_exhaustive()
    }
}
