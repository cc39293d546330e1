//! Thread reconciliation.
//!
//! The off-chain log may run ahead of the ledger: a holder can append a
//! message that is never confirmed. Reconciliation slices the log to the
//! ledger's confirmed count before anything is displayed, verified, or
//! used as the link target for a new message.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::builder::ConfirmedChain;
use crate::client::ChatChainConfig;
use crate::crypto::MessageCipher;
use crate::identity::Identity;
use crate::keys::LocalIdentity;
use crate::ledger::LedgerClient;
use crate::models::{
    ConfirmedState, ContentPointer, DecryptFailure, DecryptedMessage, MessageMetadata,
    SignedMessage, ThreadFile, ThreadId, VerificationStatus,
};
use crate::storage::{ContentNetwork, PointerCache, ThreadStore};
use crate::types::{ChatChainError, Result};
use crate::verifier::{verify_chain, ChainVerificationResult};

/// What a participant sees when opening a thread.
#[derive(Debug, Clone)]
pub struct ThreadView {
    /// The thread that was opened.
    pub thread_id: ThreadId,
    /// Ledger state for the reader, or `None` if the ledger has no record.
    pub state: Option<ConfirmedState>,
    /// Verification of the confirmed prefix, unless disabled.
    pub verification: Option<ChainVerificationResult>,
    /// Confirmed messages in chain order.
    pub messages: Vec<DecryptedMessage>,
}

impl ThreadView {
    fn empty(thread_id: ThreadId, state: Option<ConfirmedState>) -> Self {
        Self {
            thread_id,
            state,
            verification: None,
            messages: Vec::new(),
        }
    }

    /// Messages ordered by their chain index.
    pub fn sorted_by_index(&self) -> Vec<&DecryptedMessage> {
        let mut sorted: Vec<&DecryptedMessage> = self.messages.iter().collect();
        sorted.sort_by_key(|m| m.index());
        sorted
    }

    /// Messages the reader was allowed to read.
    pub fn readable(&self) -> impl Iterator<Item = &DecryptedMessage> {
        self.messages.iter().filter(|m| m.can_read)
    }

    /// Unread count reported by the ledger.
    pub fn unread_count(&self) -> u64 {
        self.state.map(|s| s.unread_count).unwrap_or(0)
    }

    /// Whether no confirmed message exists.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Reconciles off-chain thread files with the ledger.
pub struct ThreadReconciler {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn ThreadStore>,
    network: Arc<dyn ContentNetwork>,
    cipher: Arc<dyn MessageCipher>,
    pointers: PointerCache,
    config: ChatChainConfig,
}

impl ThreadReconciler {
    /// Creates a reconciler over the given collaborators.
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn ThreadStore>,
        network: Arc<dyn ContentNetwork>,
        cipher: Arc<dyn MessageCipher>,
        config: ChatChainConfig,
    ) -> Self {
        Self {
            pointers: PointerCache::new(config.pointer_cache_ttl),
            ledger,
            store,
            network,
            cipher,
            config,
        }
    }

    /// Remembers the last content pointer seen for a thread.
    pub async fn remember_pointer(&self, thread_id: &ThreadId, pointer: ContentPointer) {
        self.pointers.store(thread_id.clone(), pointer).await;
    }

    /// The locally cached content pointer for a thread, if still fresh.
    pub async fn cached_pointer(&self, thread_id: &ThreadId) -> Option<ContentPointer> {
        self.pointers.retrieve(thread_id).await
    }

    /// Fetches a thread file holding at least `min_len` messages.
    ///
    /// Sources are tried in order: the primary storage service, the locally
    /// cached content pointer, then the ledger-recorded content pointer
    /// resolved against the content network. A source that fails, returns
    /// nothing, returns another thread's file, or returns a file shorter
    /// than `min_len` is skipped.
    ///
    /// # Errors
    /// - [`ChatChainError::ConfirmedPrefixMissing`] if some source answered
    ///   but none held `min_len` messages
    /// - [`ChatChainError::ThreadUnavailable`] if no source answered
    pub async fn fetch_thread(&self, thread_id: &ThreadId, min_len: u64) -> Result<ThreadFile> {
        let mut longest: Option<ThreadFile> = None;

        match self.store.get_thread(thread_id).await {
            Ok(Some(file)) => {
                if let Some(file) = accept(thread_id, file, min_len, &mut longest, "primary") {
                    return Ok(file);
                }
            }
            Ok(None) => debug!(thread_id = %thread_id, "primary storage has no thread file"),
            Err(e) => warn!(thread_id = %thread_id, error = %e, "primary storage fetch failed"),
        }

        if let Some(pointer) = self.pointers.retrieve(thread_id).await {
            if let Some(file) = self.resolve(thread_id, &pointer, "cached pointer").await {
                if let Some(file) = accept(thread_id, file, min_len, &mut longest, "cached pointer")
                {
                    return Ok(file);
                }
            }
        }

        match self.ledger.get_content_pointer(thread_id).await {
            Ok(Some(pointer)) => {
                if let Some(file) = self.resolve(thread_id, &pointer, "ledger pointer").await {
                    if let Some(file) =
                        accept(thread_id, file, min_len, &mut longest, "ledger pointer")
                    {
                        self.remember_pointer(thread_id, pointer).await;
                        return Ok(file);
                    }
                }
            }
            Ok(None) => debug!(thread_id = %thread_id, "ledger has no content pointer"),
            Err(e) => warn!(thread_id = %thread_id, error = %e, "ledger pointer lookup failed"),
        }

        match longest {
            Some(file) => Err(ChatChainError::ConfirmedPrefixMissing {
                thread_id: thread_id.to_string(),
                confirmed: min_len,
                available: file.len() as u64,
            }),
            None => Err(ChatChainError::ThreadUnavailable(thread_id.to_string())),
        }
    }

    async fn resolve(
        &self,
        thread_id: &ThreadId,
        pointer: &ContentPointer,
        source: &'static str,
    ) -> Option<ThreadFile> {
        match self.network.resolve(pointer).await {
            Ok(Some(file)) => Some(file),
            Ok(None) => {
                debug!(thread_id = %thread_id, pointer = %pointer, source, "pointer did not resolve");
                None
            }
            Err(e) => {
                warn!(thread_id = %thread_id, pointer = %pointer, source, error = %e, "content network fetch failed");
                None
            }
        }
    }

    /// Loads the confirmed prefix for `identity`'s view of the thread.
    async fn load_confirmed(
        &self,
        thread_id: &ThreadId,
        identity: &Identity,
    ) -> Result<(Option<ConfirmedState>, Vec<SignedMessage>)> {
        let state = self.ledger.get_confirmed_state(thread_id, identity).await?;
        let confirmed_count = match state {
            Some(s) if s.confirmed_count > 0 => s.confirmed_count,
            _ => return Ok((state, Vec::new())),
        };

        let file = self.fetch_thread(thread_id, confirmed_count).await?;
        let prefix = file.confirmed_prefix(confirmed_count).to_vec();
        debug!(
            thread_id = %thread_id,
            confirmed = confirmed_count,
            off_chain = file.len(),
            "reconciled thread against ledger"
        );
        Ok((state, prefix))
    }

    /// The ledger-confirmed chain, ready to link a new message against.
    pub async fn confirmed_chain(
        &self,
        thread_id: &ThreadId,
        identity: &Identity,
    ) -> Result<ConfirmedChain> {
        let (_, prefix) = self.load_confirmed(thread_id, identity).await?;
        if prefix.is_empty() {
            return Ok(ConfirmedChain::empty(thread_id.clone()));
        }
        Ok(ConfirmedChain::from_confirmed(thread_id.clone(), prefix))
    }

    /// Opens a thread as `reader`: confirmed messages only, verified and
    /// decrypted where the reader is allowed to read them.
    pub async fn open_thread(&self, thread_id: &ThreadId, reader: &LocalIdentity) -> Result<ThreadView> {
        let (state, prefix) = self.load_confirmed(thread_id, &reader.identity()).await?;
        let Some(confirmed) = state else {
            return Ok(ThreadView::empty(thread_id.clone(), None));
        };
        if prefix.is_empty() {
            return Ok(ThreadView::empty(thread_id.clone(), state));
        }

        let verification = self.config.verify_chain.then(|| verify_chain(&prefix));
        let joined_at = confirmed.joined_at_index;

        let messages: Vec<DecryptedMessage> = stream::iter(prefix.into_iter().enumerate())
            .map(|(position, message)| {
                let status = match &verification {
                    Some(v) if v.has_critical_at(position as u64) => VerificationStatus::Invalid,
                    Some(_) => VerificationStatus::Valid,
                    None => VerificationStatus::Unchecked,
                };
                self.decrypt_message(message, position as u64, joined_at, status, reader)
            })
            .buffered(self.config.decrypt_concurrency.max(1))
            .collect()
            .await;

        Ok(ThreadView {
            thread_id: thread_id.clone(),
            state,
            verification,
            messages,
        })
    }

    async fn decrypt_message(
        &self,
        message: SignedMessage,
        position: u64,
        joined_at: u64,
        verification_status: VerificationStatus,
        reader: &LocalIdentity,
    ) -> DecryptedMessage {
        let is_before_join_time = position < joined_at;
        let (decrypted_content, decrypted_metadata, decryption_error) = if is_before_join_time {
            (None, None, None)
        } else {
            self.decrypt_for(&message, position, reader).await
        };

        DecryptedMessage {
            message,
            decrypted_content,
            decrypted_metadata,
            can_read: !is_before_join_time,
            is_before_join_time,
            verification_status,
            decryption_error,
        }
    }

    async fn decrypt_for(
        &self,
        message: &SignedMessage,
        position: u64,
        reader: &LocalIdentity,
    ) -> (Option<String>, Option<MessageMetadata>, Option<DecryptFailure>) {
        let identity = reader.identity();
        let key = reader.encryption_private_key();
        let Some(content_ct) = lookup_ciphertext(&message.encrypted_for, &identity) else {
            return (None, None, Some(DecryptFailure::NoCiphertext));
        };
        let metadata_ct = lookup_ciphertext(&message.encrypted_metadata_for, &identity);

        let mut metadata = None;
        if let Some(metadata_ct) = metadata_ct {
            match self.cipher.decrypt_from(metadata_ct, None, key).await {
                Ok(bytes) => metadata = serde_json::from_slice::<MessageMetadata>(&bytes).ok(),
                Err(e) => {
                    debug!(message_id = %message.message_id, error = %e, "metadata not decryptable")
                }
            }
        }

        let result = self
            .cipher
            .decrypt_from(content_ct, metadata_ct, key)
            .await
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| ChatChainError::DecryptionError("content is not UTF-8".to_string()))
            });
        match result {
            Ok(content) => (Some(content), metadata, None),
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    index = position,
                    error = %e,
                    "message could not be decrypted"
                );
                (None, metadata, Some(DecryptFailure::Failed(e.to_string())))
            }
        }
    }
}

/// Checks a fetched file and keeps the longest candidate seen so far.
fn accept(
    thread_id: &ThreadId,
    file: ThreadFile,
    min_len: u64,
    longest: &mut Option<ThreadFile>,
    source: &'static str,
) -> Option<ThreadFile> {
    if &file.thread_id != thread_id {
        warn!(thread_id = %thread_id, found = %file.thread_id, source, "storage returned another thread");
        return None;
    }
    if file.len() as u64 >= min_len {
        debug!(thread_id = %thread_id, source, messages = file.len(), "thread file fetched");
        return Some(file);
    }

    debug!(thread_id = %thread_id, source, messages = file.len(), min_len, "thread file behind ledger");
    if longest.as_ref().map_or(true, |l| l.len() < file.len()) {
        *longest = Some(file);
    }
    None
}

/// Finds `identity`'s entry in a ciphertext map.
///
/// Tries the long public-key form first, then the legacy address form,
/// both compared case-insensitively.
pub fn lookup_ciphertext<'a>(map: &'a BTreeMap<String, String>, identity: &Identity) -> Option<&'a str> {
    [identity.to_public_key_form(), identity.to_legacy_form()]
        .iter()
        .find_map(|form| {
            let wanted = form.to_string();
            map.get(&wanted)
                .or_else(|| {
                    map.iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(&wanted))
                        .map(|(_, v)| v)
                })
                .map(String::as_str)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_prefers_long_form() {
        let identity = Identity::PublicKey([4u8; 32]);
        let mut map = BTreeMap::new();
        map.insert(identity.to_legacy_form().to_string(), "legacy".to_string());
        map.insert(identity.to_string(), "long".to_string());
        assert_eq!(lookup_ciphertext(&map, &identity), Some("long"));
    }

    #[test]
    fn test_lookup_falls_back_to_legacy() {
        let identity = Identity::PublicKey([4u8; 32]);
        let mut map = BTreeMap::new();
        map.insert(identity.to_legacy_form().to_string(), "legacy".to_string());
        assert_eq!(lookup_ciphertext(&map, &identity), Some("legacy"));
        assert_eq!(
            lookup_ciphertext(&map, &identity.to_legacy_form()),
            Some("legacy")
        );
    }

    #[test]
    fn test_lookup_ignores_case() {
        let identity = Identity::PublicKey([0xabu8; 32]);
        let mut map = BTreeMap::new();
        map.insert(identity.to_string().to_uppercase(), "upper".to_string());
        assert_eq!(lookup_ciphertext(&map, &identity), Some("upper"));
    }

    #[test]
    fn test_lookup_missing() {
        let map = BTreeMap::new();
        assert_eq!(lookup_ciphertext(&map, &Identity::PublicKey([1u8; 32])), None);
    }
}
