//! Data models for ChatChain.
//!
//! This module defines the chain entries, the off-chain thread file, the
//! decrypted view of a message, and the small value types exchanged with
//! the ledger and storage collaborators.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::hash::ChainHash;
use crate::identity::{canonical_participants, Identity};
use crate::types::{ChatChainError, Result, THREAD_FILE_VERSION};

/// Identifier of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Wraps a thread identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pointer to content in the off-chain storage network (e.g. a CID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentPointer(String);

impl ContentPointer {
    /// Wraps a content pointer string.
    pub fn new(pointer: impl Into<String>) -> Self {
        Self(pointer.into())
    }

    /// Returns the pointer as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry in a conversation's hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    /// Unique identifier assigned at creation.
    pub message_id: String,
    /// Zero-based position in the chain.
    pub index: u64,
    /// Canonically sorted participant identities.
    pub participants: Vec<Identity>,
    /// Author of the message.
    pub sender: Identity,
    /// Ciphertext of the content per participant identity.
    pub encrypted_for: BTreeMap<String, String>,
    /// Ciphertext of the metadata envelope per participant identity.
    pub encrypted_metadata_for: BTreeMap<String, String>,
    /// Hash of the previous message, or [`ChainHash::ZERO`] for the first.
    pub prev_hash: ChainHash,
    /// Hash over every other field except `signature`.
    pub hash: ChainHash,
    /// Hex Ed25519 signature over `hash` by `sender`.
    pub signature: String,
    /// Creation time in Unix milliseconds. Advisory only.
    pub timestamp: u64,
    /// The conversation this message belongs to.
    pub thread_id: ThreadId,
    /// Optional reference to another message.
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// The unsigned content of a new message, before it is linked into a chain.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    /// Unique identifier for the new message.
    pub message_id: String,
    /// Thread participants, in any order.
    pub participants: Vec<Identity>,
    /// Author of the message.
    pub sender: Identity,
    /// Ciphertext of the content per participant identity.
    pub encrypted_for: BTreeMap<String, String>,
    /// Ciphertext of the metadata envelope per participant identity.
    pub encrypted_metadata_for: BTreeMap<String, String>,
    /// Creation time in Unix milliseconds.
    pub timestamp: u64,
    /// The conversation this message belongs to.
    pub thread_id: ThreadId,
    /// Optional reference to another message.
    pub reply_to: Option<String>,
}

impl MessageDraft {
    /// Creates a draft with a fresh message ID and the current time.
    pub fn new(thread_id: ThreadId, participants: Vec<Identity>, sender: Identity) -> Self {
        Self {
            message_id: new_message_id(),
            participants,
            sender,
            encrypted_for: BTreeMap::new(),
            encrypted_metadata_for: BTreeMap::new(),
            timestamp: now_millis(),
            thread_id,
            reply_to: None,
        }
    }

    /// Adds the content and metadata ciphertexts for one participant.
    pub fn with_ciphertext(
        mut self,
        recipient: &Identity,
        content: impl Into<String>,
        metadata: impl Into<String>,
    ) -> Self {
        self.encrypted_for.insert(recipient.to_string(), content.into());
        self.encrypted_metadata_for
            .insert(recipient.to_string(), metadata.into());
        self
    }

    /// Sets the reply reference.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// The off-chain persisted log of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadFile {
    /// The conversation identifier.
    pub thread_id: ThreadId,
    /// Canonically sorted participants.
    pub participants: Vec<Identity>,
    /// Messages in chain order. May run ahead of the ledger.
    pub messages: Vec<SignedMessage>,
    /// File format version.
    pub version: u32,
    /// Last modification time in Unix milliseconds.
    pub last_updated: u64,
}

impl ThreadFile {
    /// Creates an empty thread file.
    pub fn new(thread_id: ThreadId, participants: &[Identity]) -> Self {
        Self {
            thread_id,
            participants: canonical_participants(participants),
            messages: Vec::new(),
            version: THREAD_FILE_VERSION,
            last_updated: now_millis(),
        }
    }

    /// Appends a message that extends the chain by exactly one position.
    pub fn append(&mut self, message: SignedMessage) -> Result<()> {
        if message.thread_id != self.thread_id {
            return Err(ChatChainError::ThreadMismatch {
                expected: self.thread_id.to_string(),
                found: message.thread_id.to_string(),
            });
        }

        let expected = self.messages.len() as u64;
        if message.index != expected {
            return Err(ChatChainError::OutOfOrder {
                expected,
                found: message.index,
            });
        }

        self.messages.push(message);
        self.last_updated = now_millis();
        Ok(())
    }

    /// Returns at most the first `count` messages.
    pub fn confirmed_prefix(&self, count: u64) -> &[SignedMessage] {
        let end = usize::try_from(count)
            .unwrap_or(usize::MAX)
            .min(self.messages.len());
        &self.messages[..end]
    }

    /// Number of messages in the file.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the file holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Per-message verification outcome shown alongside decrypted content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    /// No CRITICAL error at this position.
    Valid,
    /// At least one CRITICAL error at this position.
    Invalid,
    /// Verification was not run.
    Unchecked,
}

/// Why a readable message has no decrypted content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum DecryptFailure {
    /// The message carries no ciphertext for the reader.
    NoCiphertext,
    /// Decryption was attempted and failed.
    Failed(String),
}

/// Plaintext of the per-recipient metadata envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Sender's X25519 encryption public key (hex).
    pub sender_encryption_key: String,
    /// Content type of the message body.
    pub content_type: String,
}

impl MessageMetadata {
    /// Metadata for a plain-text message.
    pub fn text(sender_encryption_key: &[u8; 32]) -> Self {
        Self {
            sender_encryption_key: hex::encode(sender_encryption_key),
            content_type: "text/plain".to_string(),
        }
    }
}

/// A chain message together with what the reader could make of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessage {
    /// The message as recorded in the chain.
    #[serde(flatten)]
    pub message: SignedMessage,
    /// Decrypted content, when readable and decryptable.
    pub decrypted_content: Option<String>,
    /// Decrypted metadata envelope, when present and decryptable.
    pub decrypted_metadata: Option<MessageMetadata>,
    /// False for messages before the reader joined.
    pub can_read: bool,
    /// Whether the message predates the reader's join index.
    pub is_before_join_time: bool,
    /// Chain verification status at this position.
    pub verification_status: VerificationStatus,
    /// Reason the content is absent for a readable message.
    pub decryption_error: Option<DecryptFailure>,
}

impl DecryptedMessage {
    /// The message's chain index.
    pub fn index(&self) -> u64 {
        self.message.index
    }

    /// Whether content was successfully decrypted.
    pub fn is_decrypted(&self) -> bool {
        self.decrypted_content.is_some()
    }
}

/// Ledger state of a thread from one participant's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedState {
    /// Number of messages the ledger has recorded.
    pub confirmed_count: u64,
    /// First index the participant may read.
    pub joined_at_index: u64,
    /// Messages the participant has not acknowledged.
    pub unread_count: u64,
}

/// A participant's read position, as recorded on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// Highest message index the participant has read, if any.
    pub last_read_index: Option<u64>,
    /// Messages the participant has not acknowledged.
    pub unread_count: u64,
    /// When the receipt was last updated (Unix milliseconds).
    pub updated_at: u64,
}

/// Receipt for a recorded ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    /// Transaction ID.
    pub txid: String,
    /// Confirmed message count after this record, if known.
    pub confirmed_count: Option<u64>,
}

/// Options for sending a message.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Ask recipients to acknowledge the message on the ledger.
    pub ack_required: bool,
    /// Message this one replies to.
    pub reply_to: Option<String>,
}

impl SendOptions {
    /// Requires an on-ledger acknowledgement.
    pub fn acknowledged() -> Self {
        Self {
            ack_required: true,
            ..Default::default()
        }
    }

    /// Create options for replying to a message.
    pub fn replying_to(message: &SignedMessage) -> Self {
        Self {
            reply_to: Some(message.message_id.clone()),
            ..Default::default()
        }
    }

    /// Set the reply reference.
    pub fn with_reply(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// Result of a successful send operation.
#[derive(Debug, Clone)]
pub struct SendResult {
    /// The signed message that was published.
    pub message: SignedMessage,
    /// Where the updated thread file was stored.
    pub content_pointer: ContentPointer,
    /// The ledger transaction recording the message.
    pub receipt: TxReceipt,
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Generate a random UUID v4 string for message IDs.
pub fn new_message_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();

    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        u16::from_be_bytes([bytes[4], bytes[5]]),
        (u16::from_be_bytes([bytes[6], bytes[7]]) & 0x0fff) | 0x4000,
        (u16::from_be_bytes([bytes[8], bytes[9]]) & 0x3fff) | 0x8000,
        u64::from_be_bytes([
            0, 0, bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ])
    )
}
