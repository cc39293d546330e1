//! Portable, independently verifiable thread archives.
//!
//! An archive carries the full message log of a thread plus a signature by
//! the exporter over `(exporter, exported_at, thread_id, message_count)`.
//! [`verify_archive`] checks that signature and, separately, re-verifies the
//! chain, so a consumer can tell a forged export from a faithful export of
//! already-broken data.

use std::collections::BTreeMap;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hash::ChainHash;
use crate::identity::Identity;
use crate::ledger::LedgerClient;
use crate::models::{now_millis, ReadReceipt, SignedMessage, ThreadFile, ThreadId};
use crate::signature::{sign_hash, verify_hash_signature};
use crate::types::{ChatChainError, Result, ARCHIVE_FORMAT, ARCHIVE_VERSION};
use crate::verifier::{verify_chain, ChainVerificationResult};

/// A signed export of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadArchive {
    /// Identity that produced the archive.
    pub exported_by: Identity,
    /// Export time in Unix milliseconds.
    pub exported_at: u64,
    /// The exported thread.
    pub thread_id: ThreadId,
    /// Thread participants.
    pub participants: Vec<Identity>,
    /// Verification result at export time.
    pub chain_verification: ChainVerificationResult,
    /// Every message of the thread file.
    pub messages: Vec<SignedMessage>,
    /// Read receipts per participant, for those that could be fetched.
    pub read_receipts: Option<BTreeMap<String, ReadReceipt>>,
    /// Hash over exporter, export time, thread and message count.
    pub archive_hash: ChainHash,
    /// Exporter's signature over `archive_hash`.
    pub archive_signature: String,
    /// Archive format version.
    pub version: u32,
    /// Archive format tag.
    pub format: String,
}

impl ThreadArchive {
    /// Serializes the archive as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses an archive document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Outcome of [`verify_archive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveVerification {
    /// The exporter's signature covers this exact archive.
    pub archive_valid: bool,
    /// The archived chain has no CRITICAL error.
    pub chain_valid: bool,
    /// Every problem found, flattened to text.
    pub errors: Vec<String>,
}

/// Computes the archive hash.
pub fn compute_archive_hash(
    exported_by: &Identity,
    exported_at: u64,
    thread_id: &ThreadId,
    message_count: u64,
) -> Result<ChainHash> {
    let fields = serde_json::json!([
        exported_by.to_string(),
        exported_at,
        thread_id.as_str(),
        message_count,
    ]);
    Ok(ChainHash::digest(&serde_json::to_vec(&fields)?))
}

/// Builds archives, fetching read receipts from the ledger.
pub struct ArchiveExporter {
    ledger: Arc<dyn LedgerClient>,
    receipt_concurrency: usize,
}

impl ArchiveExporter {
    /// Creates an exporter with bounded receipt fan-out.
    pub fn new(ledger: Arc<dyn LedgerClient>, receipt_concurrency: usize) -> Self {
        Self {
            ledger,
            receipt_concurrency: receipt_concurrency.max(1),
        }
    }

    /// Exports `thread_file` as `exporter`, signing with `signing_key`.
    ///
    /// Verification runs over the whole file, confirmed or not. Read
    /// receipts are best-effort: a participant whose lookup fails is left
    /// out of the snapshot.
    pub async fn export(
        &self,
        thread_file: &ThreadFile,
        exporter: &Identity,
        signing_key: &SigningKey,
    ) -> Result<ThreadArchive> {
        let signer = Identity::from_verifying_key(&signing_key.verifying_key());
        if !signer.same_key(exporter) {
            return Err(ChatChainError::SignerMismatch(exporter.to_string()));
        }

        let chain_verification = verify_chain(&thread_file.messages);
        let read_receipts = self.read_receipts(thread_file).await;

        let exported_at = now_millis();
        let message_count = thread_file.messages.len() as u64;
        let archive_hash =
            compute_archive_hash(exporter, exported_at, &thread_file.thread_id, message_count)?;

        debug!(
            thread_id = %thread_file.thread_id,
            messages = message_count,
            valid = chain_verification.valid,
            "exported thread archive"
        );

        Ok(ThreadArchive {
            exported_by: *exporter,
            exported_at,
            thread_id: thread_file.thread_id.clone(),
            participants: thread_file.participants.clone(),
            chain_verification,
            messages: thread_file.messages.clone(),
            read_receipts,
            archive_hash,
            archive_signature: sign_hash(&archive_hash, signing_key),
            version: ARCHIVE_VERSION,
            format: ARCHIVE_FORMAT.to_string(),
        })
    }

    async fn read_receipts(&self, thread_file: &ThreadFile) -> Option<BTreeMap<String, ReadReceipt>> {
        let thread_id = &thread_file.thread_id;
        let results: Vec<(Identity, Result<Option<ReadReceipt>>)> =
            stream::iter(thread_file.participants.iter().copied())
                .map(|participant| async move {
                    let result = self.ledger.get_read_receipt(thread_id, &participant).await;
                    (participant, result)
                })
                .buffered(self.receipt_concurrency)
                .collect()
                .await;

        let mut receipts = BTreeMap::new();
        for (participant, result) in results {
            match result {
                Ok(Some(receipt)) => {
                    receipts.insert(participant.to_string(), receipt);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    thread_id = %thread_id,
                    participant = %participant,
                    error = %e,
                    "read receipt unavailable, omitting from archive"
                ),
            }
        }

        (!receipts.is_empty()).then_some(receipts)
    }
}

/// Verifies an archive's exporter signature and its chain independently.
pub fn verify_archive(archive: &ThreadArchive) -> ArchiveVerification {
    let mut errors = Vec::new();
    let mut archive_valid = true;

    if archive.format != ARCHIVE_FORMAT || archive.version != ARCHIVE_VERSION {
        archive_valid = false;
        errors.push(format!(
            "Unsupported archive format {} v{}",
            archive.format, archive.version
        ));
    }

    match compute_archive_hash(
        &archive.exported_by,
        archive.exported_at,
        &archive.thread_id,
        archive.messages.len() as u64,
    ) {
        Ok(expected) => {
            if expected != archive.archive_hash {
                archive_valid = false;
                errors.push("Archive hash does not match archive contents".to_string());
            }
            match verify_hash_signature(&expected, &archive.archive_signature, &archive.exported_by) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    archive_valid = false;
                    errors.push(format!(
                        "Archive signature is not by {}",
                        archive.exported_by
                    ));
                }
            }
        }
        Err(e) => {
            archive_valid = false;
            errors.push(format!("Archive hash could not be computed: {}", e));
        }
    }

    let chain = verify_chain(&archive.messages);
    errors.extend(chain.error_lines());

    ArchiveVerification {
        archive_valid,
        chain_valid: chain.valid,
        errors,
    }
}
