//! Main ChatChain client.
//!
//! This module ties the collaborators together into the high-level flows:
//! opening a thread, publishing a new message, and exporting archives and
//! backups.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::archive::{ArchiveExporter, ThreadArchive};
use crate::backup::{export_backup, BackupStore, ThreadBackup};
use crate::builder::create_signed_message;
use crate::crypto::{EnvelopeCipher, MessageCipher};
use crate::identity::{canonical_participants, Identity};
use crate::keys::LocalIdentity;
use crate::ledger::{LedgerClient, RecordRequest};
use crate::models::{MessageDraft, MessageMetadata, SendOptions, SendResult, ThreadFile, ThreadId};
use crate::reconcile::{ThreadReconciler, ThreadView};
use crate::storage::{CachedKeyDirectory, ContentNetwork, KeyDirectory, ThreadStore};
use crate::thread_id::derive_thread_id;
use crate::types::{ChatChainError, Result, MAX_CONTENT_SIZE};

/// Configuration for the ChatChain client.
#[derive(Debug, Clone)]
pub struct ChatChainConfig {
    /// Maximum concurrent decryptions while opening a thread.
    pub decrypt_concurrency: usize,
    /// Maximum concurrent read receipt lookups while exporting.
    pub receipt_concurrency: usize,
    /// Whether to verify the confirmed chain when opening a thread.
    pub verify_chain: bool,
    /// How long a locally cached content pointer stays usable.
    pub pointer_cache_ttl: Duration,
    /// How long a participant's encryption key stays cached.
    pub key_cache_ttl: Duration,
    /// Maximum plaintext size per message.
    pub max_content_size: usize,
}

impl ChatChainConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            decrypt_concurrency: 8,
            receipt_concurrency: 4,
            verify_chain: true,
            pointer_cache_ttl: Duration::from_secs(3600),
            key_cache_ttl: Duration::from_secs(86400),
            max_content_size: MAX_CONTENT_SIZE,
        }
    }

    /// Sets the decryption fan-out.
    pub fn with_decrypt_concurrency(mut self, n: usize) -> Self {
        self.decrypt_concurrency = n;
        self
    }

    /// Sets the read receipt fan-out.
    pub fn with_receipt_concurrency(mut self, n: usize) -> Self {
        self.receipt_concurrency = n;
        self
    }

    /// Enables or disables chain verification on open.
    pub fn with_verify_chain(mut self, verify: bool) -> Self {
        self.verify_chain = verify;
        self
    }

    /// Sets the content pointer cache TTL.
    pub fn with_pointer_cache_ttl(mut self, ttl: Duration) -> Self {
        self.pointer_cache_ttl = ttl;
        self
    }

    /// Sets the encryption key cache TTL.
    pub fn with_key_cache_ttl(mut self, ttl: Duration) -> Self {
        self.key_cache_ttl = ttl;
        self
    }

    /// Sets the maximum plaintext size.
    pub fn with_max_content_size(mut self, max: usize) -> Self {
        self.max_content_size = max;
        self
    }
}

impl Default for ChatChainConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The main ChatChain client.
///
/// All collaborators are passed in explicitly; the client holds no global
/// state beyond its caches.
pub struct ChatChain {
    identity: LocalIdentity,
    config: ChatChainConfig,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn ThreadStore>,
    keys: CachedKeyDirectory,
    cipher: Arc<dyn MessageCipher>,
    reconciler: ThreadReconciler,
    archives: ArchiveExporter,
    backups: Option<Arc<dyn BackupStore>>,
}

impl ChatChain {
    /// Creates a client using the default envelope cipher.
    pub fn new(
        identity: LocalIdentity,
        config: ChatChainConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn ThreadStore>,
        network: Arc<dyn ContentNetwork>,
        keys: Arc<dyn KeyDirectory>,
    ) -> Self {
        let cipher: Arc<dyn MessageCipher> =
            Arc::new(EnvelopeCipher::with_max_content_size(config.max_content_size));
        Self::with_cipher(identity, config, ledger, store, network, keys, cipher)
    }

    /// Creates a client with a custom encryption collaborator.
    pub fn with_cipher(
        identity: LocalIdentity,
        config: ChatChainConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn ThreadStore>,
        network: Arc<dyn ContentNetwork>,
        keys: Arc<dyn KeyDirectory>,
        cipher: Arc<dyn MessageCipher>,
    ) -> Self {
        let reconciler = ThreadReconciler::new(
            ledger.clone(),
            store.clone(),
            network,
            cipher.clone(),
            config.clone(),
        );
        Self {
            keys: CachedKeyDirectory::new(keys, config.key_cache_ttl),
            archives: ArchiveExporter::new(ledger.clone(), config.receipt_concurrency),
            identity,
            ledger,
            store,
            cipher,
            reconciler,
            backups: None,
            config,
        }
    }

    /// Attaches a local backup store.
    pub fn with_backup_store(mut self, backups: Arc<dyn BackupStore>) -> Self {
        self.backups = Some(backups);
        self
    }

    /// The local identity.
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// The client configuration.
    pub fn config(&self) -> &ChatChainConfig {
        &self.config
    }

    /// The reconciliation service.
    pub fn reconciler(&self) -> &ThreadReconciler {
        &self.reconciler
    }

    /// Thread ID for a conversation with `participants`.
    pub fn thread_id_for(&self, participants: &[Identity]) -> ThreadId {
        derive_thread_id(participants)
    }

    /// Opens a thread as the local identity.
    pub async fn open_thread(&self, thread_id: &ThreadId) -> Result<ThreadView> {
        self.reconciler.open_thread(thread_id, &self.identity).await
    }

    /// Encrypts, signs and publishes a message to `participants`.
    ///
    /// The new message links to the ledger-confirmed tail of the thread.
    /// Any unconfirmed tail in the off-chain log is dropped from the
    /// published file.
    pub async fn send_message(
        &self,
        participants: &[Identity],
        content: &str,
        options: SendOptions,
    ) -> Result<SendResult> {
        let participants = canonical_participants(participants);
        let me = self.identity.identity();
        let sender = participants
            .iter()
            .copied()
            .find(|p| p.same_key(&me))
            .ok_or_else(|| ChatChainError::NotAParticipant(me.to_string()))?;

        let thread_id = derive_thread_id(&participants);
        if self.ledger.is_thread_terminated(&thread_id).await? {
            return Err(ChatChainError::ThreadTerminated(thread_id.to_string()));
        }

        let chain = self.reconciler.confirmed_chain(&thread_id, &sender).await?;

        let mut draft = MessageDraft::new(thread_id.clone(), participants.clone(), sender);
        if let Some(reply_to) = options.reply_to {
            draft = draft.with_reply_to(reply_to);
        }

        let own_key = self.identity.encryption_public_key();
        let metadata = serde_json::to_vec(&MessageMetadata::text(&own_key))?;
        for participant in &participants {
            let recipient_key = if participant.same_key(&me) {
                own_key
            } else {
                self.keys
                    .encryption_key(participant)
                    .await?
                    .ok_or_else(|| ChatChainError::PublicKeyNotFound(participant.to_string()))?
            };

            let private_key = self.identity.encryption_private_key();
            let content_ct = self
                .cipher
                .encrypt_for(content.as_bytes(), &recipient_key, private_key)
                .await?;
            let metadata_ct = self
                .cipher
                .encrypt_for(&metadata, &recipient_key, private_key)
                .await?;
            draft = draft.with_ciphertext(&participant.to_public_key_form(), content_ct, metadata_ct);
        }

        let message = create_signed_message(draft, chain.tail(), self.identity.signing_key())?;

        // The confirmed prefix is carried as the ledger accepted it; index
        // anomalies in it are reported by verification, not rejected here.
        let position = chain.len() as u64;
        let mut file = ThreadFile::new(thread_id.clone(), &participants);
        file.messages = chain.into_messages();
        file.messages.push(message.clone());

        let prev_confirmed_pointer = self.ledger.get_content_pointer(&thread_id).await?;
        let content_pointer = self.store.put_thread(&thread_id, &file).await?;
        self.reconciler
            .remember_pointer(&thread_id, content_pointer.clone())
            .await;

        let receipt = self
            .ledger
            .record_new_message(RecordRequest {
                thread_id: thread_id.clone(),
                prev_confirmed_pointer,
                new_content_pointer: content_pointer.clone(),
                ack_required: options.ack_required,
                message_hash: message.hash,
                position,
            })
            .await?;

        info!(
            thread_id = %thread_id,
            index = message.index,
            pointer = %content_pointer,
            txid = %receipt.txid,
            "message published"
        );

        Ok(SendResult {
            message,
            content_pointer,
            receipt,
        })
    }

    /// Exports the full off-chain log of a thread as a signed archive.
    pub async fn export_archive(&self, thread_id: &ThreadId) -> Result<ThreadArchive> {
        let me = self.identity.identity();
        let confirmed = self
            .ledger
            .get_confirmed_state(thread_id, &me)
            .await?
            .map(|s| s.confirmed_count)
            .unwrap_or(0);
        let file = self.reconciler.fetch_thread(thread_id, confirmed).await?;
        self.archives
            .export(&file, &me, self.identity.signing_key())
            .await
    }

    /// Builds a plaintext backup of what the local identity can read.
    pub async fn export_backup(&self, thread_id: &ThreadId) -> Result<ThreadBackup> {
        let view = self.open_thread(thread_id).await?;
        let participants = view
            .messages
            .first()
            .map(|m| m.message.participants.clone())
            .unwrap_or_default();
        Ok(export_backup(thread_id, &participants, &view.messages))
    }

    /// Exports a backup and saves it to the attached backup store.
    pub async fn save_backup(&self, thread_id: &ThreadId) -> Result<ThreadBackup> {
        let store = self.backup_store()?;
        let backup = self.export_backup(thread_id).await?;
        store.save(&backup).await?;
        debug!(thread_id = %thread_id, messages = backup.messages.len(), "backup stored");
        Ok(backup)
    }

    /// Loads a saved backup from the attached backup store.
    pub async fn restore_backup(&self, thread_id: &ThreadId) -> Result<Option<ThreadBackup>> {
        self.backup_store()?.load(thread_id).await
    }

    fn backup_store(&self) -> Result<&Arc<dyn BackupStore>> {
        self.backups
            .as_ref()
            .ok_or_else(|| ChatChainError::StorageFailed("no backup store configured".to_string()))
    }
}
