//! Ledger collaborator.
//!
//! The ledger is the only source of truth for how many messages a thread
//! really has. Implementations can sit on any chain or contract; the core
//! only needs the operations in [`LedgerClient`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::hash::ChainHash;
use crate::identity::Identity;
use crate::models::{now_millis, ConfirmedState, ContentPointer, ReadReceipt, ThreadId, TxReceipt};
use crate::types::{ChatChainError, Result};

/// A request to record a newly published message on the ledger.
#[derive(Debug, Clone)]
pub struct RecordRequest {
    /// Thread the message belongs to.
    pub thread_id: ThreadId,
    /// Content pointer the ledger held before this message, if any.
    pub prev_confirmed_pointer: Option<ContentPointer>,
    /// Content pointer of the thread file containing the new message.
    pub new_content_pointer: ContentPointer,
    /// Whether recipients must acknowledge the message.
    pub ack_required: bool,
    /// Hash of the new message.
    pub message_hash: ChainHash,
    /// Position of the new message in the chain, i.e. the confirmed count
    /// it extends.
    pub position: u64,
}

/// Trait for interacting with the ledger.
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    /// Confirmed state of a thread for one participant.
    ///
    /// Returns `Ok(None)` when the ledger has no record of the thread.
    async fn get_confirmed_state(
        &self,
        thread_id: &ThreadId,
        identity: &Identity,
    ) -> Result<Option<ConfirmedState>>;

    /// Record a new message.
    async fn record_new_message(&self, request: RecordRequest) -> Result<TxReceipt>;

    /// Whether the thread has been closed on the ledger.
    async fn is_thread_terminated(&self, thread_id: &ThreadId) -> Result<bool>;

    /// A participant's read receipt, if one was ever recorded.
    async fn get_read_receipt(
        &self,
        thread_id: &ThreadId,
        participant: &Identity,
    ) -> Result<Option<ReadReceipt>>;

    /// The content pointer last recorded for the thread.
    async fn get_content_pointer(&self, thread_id: &ThreadId) -> Result<Option<ContentPointer>>;
}

/// Per-thread ledger record.
#[derive(Debug, Default)]
struct ThreadRecord {
    confirmed_count: u64,
    content_pointer: Option<ContentPointer>,
    message_hashes: Vec<ChainHash>,
    joined_at: HashMap<String, u64>,
    last_read: HashMap<String, ReadReceipt>,
    terminated: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    threads: HashMap<ThreadId, ThreadRecord>,
    next_txid: u64,
    hold_confirmations: bool,
    unreachable: bool,
    failing_receipts: HashSet<String>,
}

/// In-memory ledger (for testing and local development).
///
/// Records confirm immediately unless confirmations are held with
/// [`InMemoryLedger::hold_confirmations`], in which case they are accepted
/// but leave the confirmed count and content pointer untouched.
#[derive(Default, Clone)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

fn participant_key(identity: &Identity) -> String {
    identity.to_public_key_form().to_string()
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    async fn check_reachable(&self) -> Result<()> {
        if self.state.read().await.unreachable {
            return Err(ChatChainError::Transport("ledger unreachable".to_string()));
        }
        Ok(())
    }

    /// Overwrites the confirmed count and content pointer of a thread.
    pub async fn set_confirmed(
        &self,
        thread_id: &ThreadId,
        confirmed_count: u64,
        content_pointer: Option<ContentPointer>,
    ) {
        let mut state = self.state.write().await;
        let record = state.threads.entry(thread_id.clone()).or_default();
        record.confirmed_count = confirmed_count;
        record.content_pointer = content_pointer;
    }

    /// Sets the first index a participant may read.
    pub async fn set_joined_at(&self, thread_id: &ThreadId, participant: &Identity, index: u64) {
        let mut state = self.state.write().await;
        state
            .threads
            .entry(thread_id.clone())
            .or_default()
            .joined_at
            .insert(participant_key(participant), index);
    }

    /// Records that a participant has read up to `index`.
    pub async fn mark_read(&self, thread_id: &ThreadId, participant: &Identity, index: u64) {
        let mut state = self.state.write().await;
        let record = state.threads.entry(thread_id.clone()).or_default();
        let unread_count = record.confirmed_count.saturating_sub(index + 1);
        record.last_read.insert(
            participant_key(participant),
            ReadReceipt {
                last_read_index: Some(index),
                unread_count,
                updated_at: now_millis(),
            },
        );
    }

    /// Closes a thread.
    pub async fn terminate(&self, thread_id: &ThreadId) {
        let mut state = self.state.write().await;
        state.threads.entry(thread_id.clone()).or_default().terminated = true;
    }

    /// While held, new records are accepted but never confirmed.
    pub async fn hold_confirmations(&self, hold: bool) {
        self.state.write().await.hold_confirmations = hold;
    }

    /// Makes every call fail with a transport error.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.write().await.unreachable = unreachable;
    }

    /// Makes read receipt lookups for one participant fail.
    pub async fn fail_read_receipts_for(&self, participant: &Identity) {
        self.state
            .write()
            .await
            .failing_receipts
            .insert(participant_key(participant));
    }

    /// Hashes of the confirmed messages of a thread, in order.
    pub async fn recorded_hashes(&self, thread_id: &ThreadId) -> Vec<ChainHash> {
        let state = self.state.read().await;
        state
            .threads
            .get(thread_id)
            .map(|r| r.message_hashes.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl LedgerClient for InMemoryLedger {
    async fn get_confirmed_state(
        &self,
        thread_id: &ThreadId,
        identity: &Identity,
    ) -> Result<Option<ConfirmedState>> {
        self.check_reachable().await?;
        let state = self.state.read().await;
        let Some(record) = state.threads.get(thread_id) else {
            return Ok(None);
        };

        let key = participant_key(identity);
        let unread_count = match record.last_read.get(&key).and_then(|r| r.last_read_index) {
            Some(index) => record.confirmed_count.saturating_sub(index + 1),
            None => record.confirmed_count,
        };

        Ok(Some(ConfirmedState {
            confirmed_count: record.confirmed_count,
            joined_at_index: record.joined_at.get(&key).copied().unwrap_or(0),
            unread_count,
        }))
    }

    async fn record_new_message(&self, request: RecordRequest) -> Result<TxReceipt> {
        self.check_reachable().await?;
        let mut state = self.state.write().await;
        state.next_txid += 1;
        let txid = format!("tx-{:08}", state.next_txid);
        let hold = state.hold_confirmations;

        let record = state.threads.entry(request.thread_id.clone()).or_default();
        if record.terminated {
            return Err(ChatChainError::ThreadTerminated(request.thread_id.to_string()));
        }
        if request.prev_confirmed_pointer != record.content_pointer {
            return Err(ChatChainError::Transport(format!(
                "stale content pointer for {}",
                request.thread_id
            )));
        }
        if request.position != record.confirmed_count {
            return Err(ChatChainError::OutOfOrder {
                expected: record.confirmed_count,
                found: request.position,
            });
        }

        if hold {
            return Ok(TxReceipt {
                txid,
                confirmed_count: None,
            });
        }

        record.confirmed_count += 1;
        record.content_pointer = Some(request.new_content_pointer);
        record.message_hashes.push(request.message_hash);

        Ok(TxReceipt {
            txid,
            confirmed_count: Some(record.confirmed_count),
        })
    }

    async fn is_thread_terminated(&self, thread_id: &ThreadId) -> Result<bool> {
        self.check_reachable().await?;
        let state = self.state.read().await;
        Ok(state.threads.get(thread_id).is_some_and(|r| r.terminated))
    }

    async fn get_read_receipt(
        &self,
        thread_id: &ThreadId,
        participant: &Identity,
    ) -> Result<Option<ReadReceipt>> {
        self.check_reachable().await?;
        let state = self.state.read().await;
        let key = participant_key(participant);
        if state.failing_receipts.contains(&key) {
            return Err(ChatChainError::Transport(format!(
                "read receipt lookup failed for {}",
                participant
            )));
        }
        Ok(state
            .threads
            .get(thread_id)
            .and_then(|r| r.last_read.get(&key).cloned()))
    }

    async fn get_content_pointer(&self, thread_id: &ThreadId) -> Result<Option<ContentPointer>> {
        self.check_reachable().await?;
        let state = self.state.read().await;
        Ok(state
            .threads
            .get(thread_id)
            .and_then(|r| r.content_pointer.clone()))
    }
}
