//! Per-recipient encryption.
//!
//! The [`MessageCipher`] trait is the encryption collaborator the rest of
//! the crate talks to. [`EnvelopeCipher`] is the default implementation:
//! an ephemeral X25519 exchange with the recipient, HKDF-SHA256, and
//! ChaCha20-Poly1305, plus a copy of the symmetric key sealed for the
//! sender so the author can read their own messages.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::envelope::ChatEnvelope;
use crate::keys::{generate_ephemeral_keypair, x25519_ecdh};
use crate::models::MessageMetadata;
use crate::types::{
    ChatChainError, Result, ENCRYPTION_INFO_PREFIX, MAX_CONTENT_SIZE, NONCE_SIZE, PROTOCOL_ID,
    PROTOCOL_VERSION, SENDER_KEY_INFO_PREFIX,
};

/// Encryption collaborator.
///
/// Implementations must encrypt independently per recipient, and decrypt
/// using only the caller's own private material.
#[async_trait::async_trait]
pub trait MessageCipher: Send + Sync {
    /// Encrypt `plaintext` for one recipient.
    async fn encrypt_for(
        &self,
        plaintext: &[u8],
        recipient_public_key: &[u8; 32],
        sender_private_key: &StaticSecret,
    ) -> Result<String>;

    /// Decrypt a ciphertext addressed to the caller.
    ///
    /// `metadata_ciphertext` is the matching metadata envelope, if the
    /// message carries one for the caller.
    async fn decrypt_from(
        &self,
        ciphertext: &str,
        metadata_ciphertext: Option<&str>,
        own_private_key: &StaticSecret,
    ) -> Result<Vec<u8>>;
}

/// Default [`MessageCipher`] using [`ChatEnvelope`]s.
#[derive(Debug, Clone)]
pub struct EnvelopeCipher {
    max_content_size: usize,
}

impl EnvelopeCipher {
    /// Creates a cipher with the default plaintext limit.
    pub fn new() -> Self {
        Self {
            max_content_size: MAX_CONTENT_SIZE,
        }
    }

    /// Creates a cipher with a custom plaintext limit.
    pub fn with_max_content_size(max_content_size: usize) -> Self {
        Self { max_content_size }
    }
}

impl Default for EnvelopeCipher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageCipher for EnvelopeCipher {
    async fn encrypt_for(
        &self,
        plaintext: &[u8],
        recipient_public_key: &[u8; 32],
        sender_private_key: &StaticSecret,
    ) -> Result<String> {
        if plaintext.len() > self.max_content_size {
            return Err(ChatChainError::MessageTooLarge {
                size: plaintext.len(),
                max: self.max_content_size,
            });
        }

        let recipient = PublicKey::from(*recipient_public_key);
        Ok(seal(plaintext, sender_private_key, &recipient)?.to_text())
    }

    async fn decrypt_from(
        &self,
        ciphertext: &str,
        metadata_ciphertext: Option<&str>,
        own_private_key: &StaticSecret,
    ) -> Result<Vec<u8>> {
        let envelope = ChatEnvelope::from_text(ciphertext)?;

        if let Some(metadata_text) = metadata_ciphertext {
            let metadata_envelope = ChatEnvelope::from_text(metadata_text)?;
            let metadata: MessageMetadata =
                serde_json::from_slice(&open(&metadata_envelope, own_private_key)?)?;
            if metadata.sender_encryption_key != hex::encode(envelope.sender_public_key) {
                return Err(ChatChainError::DecryptionError(
                    "Metadata sender key does not match envelope".to_string(),
                ));
            }
        }

        open(&envelope, own_private_key)
    }
}

/// Builds the HKDF info string: prefix followed by the given keys.
fn hkdf_info(prefix: &[u8], keys: &[&[u8; 32]]) -> Vec<u8> {
    let mut info = Vec::with_capacity(prefix.len() + keys.len() * 32);
    info.extend_from_slice(prefix);
    for key in keys {
        info.extend_from_slice(*key);
    }
    info
}

/// Derives a 32-byte key from an ECDH secret, salted with the ephemeral key.
fn derive_key(shared_secret: &[u8; 32], ephemeral: &[u8; 32], info: &[u8]) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(Some(ephemeral), shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|e| ChatChainError::EncryptionError(format!("HKDF expand failed: {}", e)))?;
    Ok(key)
}

fn cipher_for(key: &[u8]) -> Result<ChaCha20Poly1305> {
    ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| ChatChainError::EncryptionError(format!("Cipher init failed: {}", e)))
}

/// Encrypts `plaintext` for `recipient` into an envelope.
pub fn seal(
    plaintext: &[u8],
    sender_private_key: &StaticSecret,
    recipient: &PublicKey,
) -> Result<ChatEnvelope> {
    let sender_public = PublicKey::from(sender_private_key);
    let (ephemeral_private, ephemeral_public) = generate_ephemeral_keypair();

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let message_key = derive_key(
        &x25519_ecdh(&ephemeral_private, recipient),
        ephemeral_public.as_bytes(),
        &hkdf_info(
            ENCRYPTION_INFO_PREFIX,
            &[sender_public.as_bytes(), recipient.as_bytes()],
        ),
    )?;
    let ciphertext = cipher_for(&message_key)?
        .encrypt(nonce, plaintext)
        .map_err(|e| ChatChainError::EncryptionError(format!("Encryption failed: {}", e)))?;

    let sender_key = derive_key(
        &x25519_ecdh(&ephemeral_private, &sender_public),
        ephemeral_public.as_bytes(),
        &hkdf_info(SENDER_KEY_INFO_PREFIX, &[sender_public.as_bytes()]),
    )?;
    let encrypted_sender_key = cipher_for(&sender_key)?
        .encrypt(nonce, message_key.as_slice())
        .map_err(|e| {
            ChatChainError::EncryptionError(format!("Sender key encryption failed: {}", e))
        })?;

    Ok(ChatEnvelope {
        version: PROTOCOL_VERSION,
        protocol_id: PROTOCOL_ID,
        sender_public_key: *sender_public.as_bytes(),
        ephemeral_public_key: *ephemeral_public.as_bytes(),
        nonce: nonce_bytes,
        encrypted_sender_key,
        ciphertext,
    })
}

/// Decrypts an envelope with our private key, as recipient or as sender.
pub fn open(envelope: &ChatEnvelope, own_private_key: &StaticSecret) -> Result<Vec<u8>> {
    let own_public = PublicKey::from(own_private_key);
    let ephemeral = PublicKey::from(envelope.ephemeral_public_key);
    let shared_secret = x25519_ecdh(own_private_key, &ephemeral);
    let nonce = Nonce::from_slice(&envelope.nonce);

    let recipient_key = derive_key(
        &shared_secret,
        &envelope.ephemeral_public_key,
        &hkdf_info(
            ENCRYPTION_INFO_PREFIX,
            &[&envelope.sender_public_key, own_public.as_bytes()],
        ),
    )?;
    if let Ok(plaintext) = cipher_for(&recipient_key)?.decrypt(nonce, envelope.ciphertext.as_slice())
    {
        return Ok(plaintext);
    }

    // Self-addressed and sent envelopes both open through the sender key.
    if own_public.as_bytes() != &envelope.sender_public_key {
        return Err(ChatChainError::DecryptionError(
            "Envelope is not addressed to this key".to_string(),
        ));
    }

    let sender_key = derive_key(
        &shared_secret,
        &envelope.ephemeral_public_key,
        &hkdf_info(SENDER_KEY_INFO_PREFIX, &[own_public.as_bytes()]),
    )?;
    let message_key = cipher_for(&sender_key)?
        .decrypt(nonce, envelope.encrypted_sender_key.as_slice())
        .map_err(|e| {
            ChatChainError::DecryptionError(format!("Sender key decryption failed: {}", e))
        })?;

    cipher_for(&message_key)?
        .decrypt(nonce, envelope.ciphertext.as_slice())
        .map_err(|e| ChatChainError::DecryptionError(format!("Message decryption failed: {}", e)))
}
