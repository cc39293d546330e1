//! Per-recipient ciphertext envelope.
//!
//! Each value in a message's `encrypted_for` and `encrypted_metadata_for`
//! maps is one [`ChatEnvelope`] in base64 text form. The binary form is a
//! fixed header followed by the AEAD output:
//!
//! ```text
//! offset  len  field
//!      0    1  version
//!      1    1  protocol id
//!      2   32  sender X25519 key
//!     34   32  ephemeral X25519 key
//!     66   12  nonce
//!     78   48  sealed content key (sender copy)
//!    126    *  ciphertext || tag
//! ```

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::types::{
    ChatChainError, Result, ENCRYPTED_SENDER_KEY_SIZE, HEADER_SIZE, NONCE_SIZE, PROTOCOL_ID,
    PROTOCOL_VERSION, PUBLIC_KEY_SIZE, TAG_SIZE,
};

/// One sealed payload for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEnvelope {
    /// Format version, always [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Protocol tag, always [`PROTOCOL_ID`].
    pub protocol_id: u8,
    /// Sender's long-term encryption key, so the recipient can derive the
    /// shared secret and the sender can recognise its own envelopes.
    pub sender_public_key: [u8; 32],
    /// One-time key for this envelope.
    pub ephemeral_public_key: [u8; 32],
    /// AEAD nonce shared by both sealed parts.
    pub nonce: [u8; 12],
    /// Content key sealed to the sender, letting the sender reopen what
    /// it wrote.
    pub encrypted_sender_key: Vec<u8>,
    /// Ciphertext with its trailing authentication tag.
    pub ciphertext: Vec<u8>,
}

/// Splits a fixed-size field off the front of `rest`.
fn take<const N: usize>(rest: &mut &[u8]) -> [u8; N] {
    let (head, tail) = rest.split_at(N);
    *rest = tail;
    let mut field = [0u8; N];
    field.copy_from_slice(head);
    field
}

impl ChatEnvelope {
    /// Binary form of the envelope.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        out.extend_from_slice(&[self.version, self.protocol_id]);
        for part in [
            self.sender_public_key.as_slice(),
            self.ephemeral_public_key.as_slice(),
            self.nonce.as_slice(),
            self.encrypted_sender_key.as_slice(),
            self.ciphertext.as_slice(),
        ] {
            out.extend_from_slice(part);
        }
        out
    }

    /// Parses the binary form.
    ///
    /// Anything shorter than a header plus an authentication tag is
    /// rejected before the version and protocol bytes are looked at.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let minimum = HEADER_SIZE + TAG_SIZE;
        if bytes.len() < minimum {
            return Err(ChatChainError::InvalidEnvelope(format!(
                "envelope is {} bytes, need at least {}",
                bytes.len(),
                minimum
            )));
        }

        let (version, protocol_id) = (bytes[0], bytes[1]);
        if version != PROTOCOL_VERSION {
            return Err(ChatChainError::UnknownVersion(version));
        }
        if protocol_id != PROTOCOL_ID {
            return Err(ChatChainError::UnknownProtocolId(protocol_id));
        }

        let mut rest = &bytes[2..];
        let sender_public_key = take::<PUBLIC_KEY_SIZE>(&mut rest);
        let ephemeral_public_key = take::<PUBLIC_KEY_SIZE>(&mut rest);
        let nonce = take::<NONCE_SIZE>(&mut rest);
        let encrypted_sender_key = take::<ENCRYPTED_SENDER_KEY_SIZE>(&mut rest).to_vec();

        Ok(Self {
            version,
            protocol_id,
            sender_public_key,
            ephemeral_public_key,
            nonce,
            encrypted_sender_key,
            ciphertext: rest.to_vec(),
        })
    }

    /// Base64 text form, as stored in ciphertext maps.
    pub fn to_text(&self) -> String {
        STANDARD.encode(self.encode())
    }

    /// Parses the base64 text form. Surrounding whitespace is ignored.
    pub fn from_text(text: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|e| ChatChainError::InvalidEnvelope(format!("not base64: {}", e)))?;
        Self::decode(&bytes)
    }
}
