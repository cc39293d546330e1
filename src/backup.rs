//! Local plaintext backups of threads.
//!
//! A backup holds what the current identity could read, with every
//! ciphertext map stripped. Backups are keyed by thread ID, superseded by
//! re-export, and never shared with other participants.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::hash::ChainHash;
use crate::identity::Identity;
use crate::models::{
    now_millis, DecryptFailure, DecryptedMessage, MessageMetadata, ThreadId, VerificationStatus,
};
use crate::types::{ChatChainError, Result, BACKUP_VERSION};

/// One message of a backup: chain fields and plaintext, no ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMessage {
    /// Unique message ID.
    pub message_id: String,
    /// Position in the chain.
    pub index: u64,
    /// Who sent the message.
    pub sender: Identity,
    /// Hash of the previous message.
    pub prev_hash: ChainHash,
    /// Chain hash of this message.
    pub hash: ChainHash,
    /// Sender's signature over `hash` (hex).
    pub signature: String,
    /// Creation time in Unix milliseconds.
    pub timestamp: u64,
    /// Message being replied to, if any.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Plaintext, when the owner could read it.
    pub decrypted_content: Option<String>,
    /// Decrypted metadata envelope.
    pub decrypted_metadata: Option<MessageMetadata>,
    /// Whether the owner was allowed to read the message.
    pub can_read: bool,
    /// Whether the message predates the owner's join index.
    pub is_before_join_time: bool,
    /// Chain verification outcome at export time.
    pub verification_status: VerificationStatus,
    /// Why decryption failed, if it did.
    #[serde(default)]
    pub decryption_error: Option<DecryptFailure>,
}

impl From<&DecryptedMessage> for BackupMessage {
    fn from(m: &DecryptedMessage) -> Self {
        Self {
            message_id: m.message.message_id.clone(),
            index: m.message.index,
            sender: m.message.sender,
            prev_hash: m.message.prev_hash,
            hash: m.message.hash,
            signature: m.message.signature.clone(),
            timestamp: m.message.timestamp,
            reply_to: m.message.reply_to.clone(),
            decrypted_content: m.decrypted_content.clone(),
            decrypted_metadata: m.decrypted_metadata.clone(),
            can_read: m.can_read,
            is_before_join_time: m.is_before_join_time,
            verification_status: m.verification_status,
            decryption_error: m.decryption_error.clone(),
        }
    }
}

/// A decrypted snapshot of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadBackup {
    /// Backup format version.
    pub version: u32,
    /// The backed-up thread.
    pub thread_id: ThreadId,
    /// Canonically sorted participants.
    #[serde(default)]
    pub participants: Vec<Identity>,
    /// Export time in Unix milliseconds.
    #[serde(default)]
    pub exported_at: u64,
    /// Messages in index order.
    pub messages: Vec<BackupMessage>,
}

impl ThreadBackup {
    /// Serializes the backup as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Builds a backup from decrypted messages, in chain order.
pub fn export_backup(
    thread_id: &ThreadId,
    participants: &[Identity],
    messages: &[DecryptedMessage],
) -> ThreadBackup {
    let mut messages: Vec<BackupMessage> = messages.iter().map(BackupMessage::from).collect();
    messages.sort_by_key(|m| m.index);

    ThreadBackup {
        version: BACKUP_VERSION,
        thread_id: thread_id.clone(),
        participants: participants.to_vec(),
        exported_at: now_millis(),
        messages,
    }
}

/// Parses a backup document.
///
/// # Errors
/// [`ChatChainError::BackupFormat`] if the document is not JSON, lacks
/// `version`, `thread_id` or `messages`, has an unsupported version, or
/// does not match the backup structure.
pub fn restore_backup(json: &str) -> Result<ThreadBackup> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ChatChainError::BackupFormat(format!("not a JSON document: {}", e)))?;

    let Some(object) = value.as_object() else {
        return Err(ChatChainError::BackupFormat(
            "backup must be a JSON object".to_string(),
        ));
    };
    for field in ["version", "thread_id", "messages"] {
        if !object.contains_key(field) {
            return Err(ChatChainError::BackupFormat(format!(
                "missing required field `{}`",
                field
            )));
        }
    }

    let backup: ThreadBackup = serde_json::from_value(value)
        .map_err(|e| ChatChainError::BackupFormat(e.to_string()))?;
    if backup.version != BACKUP_VERSION {
        return Err(ChatChainError::BackupFormat(format!(
            "unsupported backup version {}",
            backup.version
        )));
    }
    Ok(backup)
}

/// Local storage for backups, keyed by thread ID.
#[async_trait::async_trait]
pub trait BackupStore: Send + Sync {
    /// Save a backup, replacing any previous one for the same thread.
    async fn save(&self, backup: &ThreadBackup) -> Result<()>;

    /// Load the backup for a thread.
    async fn load(&self, thread_id: &ThreadId) -> Result<Option<ThreadBackup>>;

    /// Delete the backup for a thread.
    async fn delete(&self, thread_id: &ThreadId) -> Result<()>;

    /// List threads that have a backup.
    async fn list(&self) -> Result<Vec<ThreadId>>;
}

/// In-memory backup store.
#[derive(Default, Clone)]
pub struct InMemoryBackupStore {
    backups: Arc<RwLock<HashMap<ThreadId, String>>>,
}

impl InMemoryBackupStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BackupStore for InMemoryBackupStore {
    async fn save(&self, backup: &ThreadBackup) -> Result<()> {
        let json = backup.to_json()?;
        self.backups
            .write()
            .await
            .insert(backup.thread_id.clone(), json);
        Ok(())
    }

    async fn load(&self, thread_id: &ThreadId) -> Result<Option<ThreadBackup>> {
        let backups = self.backups.read().await;
        backups.get(thread_id).map(|json| restore_backup(json)).transpose()
    }

    async fn delete(&self, thread_id: &ThreadId) -> Result<()> {
        self.backups.write().await.remove(thread_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ThreadId>> {
        let mut ids: Vec<ThreadId> = self.backups.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Backup store writing one JSON file per thread into a directory.
#[derive(Debug, Clone)]
pub struct FileBackupStore {
    dir: PathBuf,
}

const BACKUP_EXTENSION: &str = "json";

impl FileBackupStore {
    /// Creates a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The backing directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, thread_id: &ThreadId) -> Result<PathBuf> {
        let id = thread_id.as_str();
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ChatChainError::StorageFailed(format!(
                "thread ID not usable as a file name: {}",
                id
            )));
        }
        Ok(self.dir.join(format!("{}.{}", id, BACKUP_EXTENSION)))
    }
}

#[async_trait::async_trait]
impl BackupStore for FileBackupStore {
    async fn save(&self, backup: &ThreadBackup) -> Result<()> {
        let path = self.path_for(&backup.thread_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, backup.to_json()?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(thread_id = %backup.thread_id, path = %path.display(), "backup saved");
        Ok(())
    }

    async fn load(&self, thread_id: &ThreadId) -> Result<Option<ThreadBackup>> {
        let path = self.path_for(thread_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => restore_backup(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, thread_id: &ThreadId) -> Result<()> {
        let path = self.path_for(thread_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ThreadId>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BACKUP_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(ThreadId::new(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }
}
