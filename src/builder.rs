//! Construction of new chain messages.
//!
//! A new message may only link to the ledger-confirmed tail of its thread.
//! [`ConfirmedTail`] can only be obtained from a [`ConfirmedChain`], and a
//! non-empty `ConfirmedChain` can only be produced by the reconciliation
//! service after it has sliced the off-chain log to the ledger's confirmed
//! count. Unconfirmed local messages therefore never reach the builder.

use ed25519_dalek::SigningKey;

use crate::hash::{compute_hash, ChainHash};
use crate::identity::{canonical_participants, Identity};
use crate::models::{MessageDraft, SignedMessage, ThreadId};
use crate::signature::sign_hash;
use crate::types::{ChatChainError, Result};

/// The ledger-confirmed prefix of a thread.
#[derive(Debug, Clone)]
pub struct ConfirmedChain {
    thread_id: ThreadId,
    messages: Vec<SignedMessage>,
}

impl ConfirmedChain {
    /// A thread with no confirmed messages yet.
    pub fn empty(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            messages: Vec::new(),
        }
    }

    /// Wraps a prefix that the caller has checked against the ledger.
    pub(crate) fn from_confirmed(thread_id: ThreadId, messages: Vec<SignedMessage>) -> Self {
        Self { thread_id, messages }
    }

    /// The thread this chain belongs to.
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// The confirmed messages in chain order.
    pub fn messages(&self) -> &[SignedMessage] {
        &self.messages
    }

    /// Number of confirmed messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing has been confirmed yet.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The last confirmed message, if any.
    pub fn tail(&self) -> Option<ConfirmedTail<'_>> {
        self.messages.last().map(ConfirmedTail)
    }

    /// Consumes the chain, returning its messages.
    pub fn into_messages(self) -> Vec<SignedMessage> {
        self.messages
    }
}

/// The last ledger-confirmed message of a thread.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmedTail<'a>(&'a SignedMessage);

impl<'a> ConfirmedTail<'a> {
    /// The confirmed message itself.
    pub fn message(&self) -> &'a SignedMessage {
        self.0
    }
}

/// Builds and signs a new message linked to `previous`.
///
/// With no previous message the new one starts the chain at index 0 with a
/// zero `prev_hash`. Participants are canonicalized before hashing.
///
/// # Errors
/// - [`ChatChainError::NotAParticipant`] if the sender is not a participant
/// - [`ChatChainError::SignerMismatch`] if `signing_key` is not the sender's
/// - [`ChatChainError::ThreadMismatch`] if `previous` is from another thread
/// - [`ChatChainError::IndexOverflow`] if `previous` already sits at `u64::MAX`
pub fn create_signed_message(
    draft: MessageDraft,
    previous: Option<ConfirmedTail<'_>>,
    signing_key: &SigningKey,
) -> Result<SignedMessage> {
    let participants = canonical_participants(&draft.participants);
    if !participants.contains(&draft.sender) {
        return Err(ChatChainError::NotAParticipant(draft.sender.to_string()));
    }

    let signer = Identity::from_verifying_key(&signing_key.verifying_key());
    if !signer.same_key(&draft.sender) {
        return Err(ChatChainError::SignerMismatch(draft.sender.to_string()));
    }

    let (index, prev_hash) = match previous {
        Some(tail) => {
            let prev = tail.message();
            if prev.thread_id != draft.thread_id {
                return Err(ChatChainError::ThreadMismatch {
                    expected: prev.thread_id.to_string(),
                    found: draft.thread_id.to_string(),
                });
            }
            let index = prev
                .index
                .checked_add(1)
                .ok_or(ChatChainError::IndexOverflow(prev.index))?;
            (index, prev.hash)
        }
        None => (0, ChainHash::ZERO),
    };

    let mut message = SignedMessage {
        message_id: draft.message_id,
        index,
        participants,
        sender: draft.sender,
        encrypted_for: draft.encrypted_for,
        encrypted_metadata_for: draft.encrypted_metadata_for,
        prev_hash,
        hash: ChainHash::ZERO,
        signature: String::new(),
        timestamp: draft.timestamp,
        thread_id: draft.thread_id,
        reply_to: draft.reply_to,
    };

    message.hash = compute_hash(&message)?;
    message.signature = sign_hash(&message.hash, signing_key);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::verify_signature;
    use crate::thread_id::derive_thread_id;
    use rand::rngs::OsRng;

    fn identity_of(key: &SigningKey) -> Identity {
        Identity::from_verifying_key(&key.verifying_key())
    }

    #[test]
    fn test_first_message_starts_chain() {
        let alice = SigningKey::generate(&mut OsRng);
        let bob = SigningKey::generate(&mut OsRng);
        let participants = vec![identity_of(&bob), identity_of(&alice)];
        let thread_id = derive_thread_id(&participants);

        let draft = MessageDraft::new(thread_id, participants, identity_of(&alice));
        let message = create_signed_message(draft, None, &alice).unwrap();

        assert_eq!(message.index, 0);
        assert!(message.prev_hash.is_zero());
        assert_eq!(message.hash, compute_hash(&message).unwrap());
        assert!(verify_signature(&message));
        assert_eq!(
            message.participants,
            canonical_participants(&[identity_of(&alice), identity_of(&bob)])
        );
    }

    #[test]
    fn test_links_to_confirmed_tail() {
        let alice = SigningKey::generate(&mut OsRng);
        let participants = vec![identity_of(&alice)];
        let thread_id = derive_thread_id(&participants);

        let first = create_signed_message(
            MessageDraft::new(thread_id.clone(), participants.clone(), identity_of(&alice)),
            None,
            &alice,
        )
        .unwrap();
        let chain = ConfirmedChain::from_confirmed(thread_id.clone(), vec![first.clone()]);

        let second = create_signed_message(
            MessageDraft::new(thread_id, participants, identity_of(&alice)),
            chain.tail(),
            &alice,
        )
        .unwrap();

        assert_eq!(second.index, 1);
        assert_eq!(second.prev_hash, first.hash);
    }

    #[test]
    fn test_sender_must_be_participant() {
        let alice = SigningKey::generate(&mut OsRng);
        let bob = SigningKey::generate(&mut OsRng);
        let participants = vec![identity_of(&bob)];
        let draft = MessageDraft::new(
            derive_thread_id(&participants),
            participants,
            identity_of(&alice),
        );

        let result = create_signed_message(draft, None, &alice);
        assert!(matches!(result, Err(ChatChainError::NotAParticipant(_))));
    }

    #[test]
    fn test_signing_key_must_match_sender() {
        let alice = SigningKey::generate(&mut OsRng);
        let bob = SigningKey::generate(&mut OsRng);
        let participants = vec![identity_of(&alice), identity_of(&bob)];
        let draft = MessageDraft::new(
            derive_thread_id(&participants),
            participants,
            identity_of(&alice),
        );

        let result = create_signed_message(draft, None, &bob);
        assert!(matches!(result, Err(ChatChainError::SignerMismatch(_))));
    }

    #[test]
    fn test_tail_from_other_thread_rejected() {
        let alice = SigningKey::generate(&mut OsRng);
        let participants = vec![identity_of(&alice)];
        let first = create_signed_message(
            MessageDraft::new(ThreadId::new("one"), participants.clone(), identity_of(&alice)),
            None,
            &alice,
        )
        .unwrap();
        let chain = ConfirmedChain::from_confirmed(ThreadId::new("one"), vec![first]);

        let result = create_signed_message(
            MessageDraft::new(ThreadId::new("two"), participants, identity_of(&alice)),
            chain.tail(),
            &alice,
        );
        assert!(matches!(result, Err(ChatChainError::ThreadMismatch { .. })));
    }

    #[test]
    fn test_tail_at_max_index_rejected() {
        let alice = SigningKey::generate(&mut OsRng);
        let participants = vec![identity_of(&alice)];
        let thread_id = derive_thread_id(&participants);

        let mut first = create_signed_message(
            MessageDraft::new(thread_id.clone(), participants.clone(), identity_of(&alice)),
            None,
            &alice,
        )
        .unwrap();
        first.index = u64::MAX;
        let chain = ConfirmedChain::from_confirmed(thread_id.clone(), vec![first]);

        let result = create_signed_message(
            MessageDraft::new(thread_id, participants, identity_of(&alice)),
            chain.tail(),
            &alice,
        );
        assert!(matches!(result, Err(ChatChainError::IndexOverflow(u64::MAX))));
    }

    #[test]
    fn test_empty_chain_has_no_tail() {
        let chain = ConfirmedChain::empty(ThreadId::new("t"));
        assert!(chain.is_empty());
        assert!(chain.tail().is_none());
    }
}
