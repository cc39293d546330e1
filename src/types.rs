//! Type definitions and protocol constants for ChatChain.

use thiserror::Error;

/// Envelope version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Envelope protocol ID byte.
pub const PROTOCOL_ID: u8 = 0x02;

/// Size of the envelope header in bytes.
pub const HEADER_SIZE: usize = 126;

/// Size of the authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Size of the encrypted sender key (32-byte key + 16-byte tag).
pub const ENCRYPTED_SENDER_KEY_SIZE: usize = 48;

/// Default maximum plaintext size in bytes.
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Size of the nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of a public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Key derivation salt.
pub const KEY_DERIVATION_SALT: &[u8] = b"ChatChain-v1-encryption";

/// Key derivation info.
pub const KEY_DERIVATION_INFO: &[u8] = b"x25519-key";

/// Encryption info prefix for message encryption.
pub const ENCRYPTION_INFO_PREFIX: &[u8] = b"ChatChainV1";

/// Sender key info prefix for bidirectional decryption.
pub const SENDER_KEY_INFO_PREFIX: &[u8] = b"ChatChainV1-SenderKey";

/// Domain separator for thread identifiers.
pub const THREAD_ID_DOMAIN: &[u8] = b"ChatChain-thread-v1";

/// Format version written into every [`ThreadFile`](crate::ThreadFile).
pub const THREAD_FILE_VERSION: u32 = 1;

/// Format version of exported archives.
pub const ARCHIVE_VERSION: u32 = 1;

/// Format tag of exported archives.
pub const ARCHIVE_FORMAT: &str = "chatchain-archive";

/// Format version of local backups.
pub const BACKUP_VERSION: u32 = 1;

/// Errors that can occur during ChatChain operations.
#[derive(Error, Debug)]
pub enum ChatChainError {
    // Key and identity errors
    /// Invalid seed length.
    #[error("Invalid seed length: expected 32 bytes, got {0}")]
    InvalidSeedLength(usize),

    /// Identity string could not be parsed.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Invalid public key format.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature bytes are malformed.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Could not find an encryption key for an identity.
    #[error("Encryption key not found for identity: {0}")]
    PublicKeyNotFound(String),

    // Encryption errors
    /// Message too large.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// Decryption failed.
    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    /// The message carries no ciphertext addressed to the reader.
    #[error("No ciphertext addressed to {0}")]
    NoCiphertext(String),

    // Envelope errors
    /// Invalid envelope data.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Unknown protocol version.
    #[error("Unknown protocol version: {0}")]
    UnknownVersion(u8),

    /// Unknown protocol ID.
    #[error("Unknown protocol ID: {0}")]
    UnknownProtocolId(u8),

    // Chain construction errors
    /// Sender is not one of the thread participants.
    #[error("{0} is not a participant of this thread")]
    NotAParticipant(String),

    /// Signing key does not belong to the claimed sender.
    #[error("Signing key does not match sender {0}")]
    SignerMismatch(String),

    /// Message or file belongs to another thread.
    #[error("Thread mismatch: expected {expected}, got {found}")]
    ThreadMismatch { expected: String, found: String },

    /// Message index does not extend the chain.
    #[error("Out-of-order append: expected index {expected}, got {found}")]
    OutOfOrder { expected: u64, found: u64 },

    /// The confirmed tail's index leaves no room for another message.
    #[error("Chain index overflow after index {0}")]
    IndexOverflow(u64),

    /// The off-chain log is shorter than the ledger's confirmed count.
    #[error("Confirmed prefix missing for {thread_id}: ledger confirms {confirmed}, off-chain log has {available}")]
    ConfirmedPrefixMissing {
        thread_id: String,
        confirmed: u64,
        available: u64,
    },

    /// The ledger marks this thread as terminated.
    #[error("Thread terminated: {0}")]
    ThreadTerminated(String),

    // Collaborator errors
    /// Ledger or storage could not be reached.
    #[error("Transport failed: {0}")]
    Transport(String),

    /// No storage source could produce the thread file.
    #[error("Thread unavailable after all storage fallbacks: {0}")]
    ThreadUnavailable(String),

    /// Storage operation failed.
    #[error("Storage failed: {0}")]
    StorageFailed(String),

    // Format errors
    /// A backup document is missing required fields or is malformed.
    #[error("Invalid backup format: {0}")]
    BackupFormat(String),

    /// Serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem operation failed.
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatChainError>;
