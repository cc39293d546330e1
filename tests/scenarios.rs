//! End-to-end scenarios against the in-memory collaborators.
//!
//! These exercise the full open / send / export flows: ledger-gated
//! slicing of the off-chain log, join-time gating, storage fallbacks,
//! archives and backups.

use std::sync::Arc;

use chatchain::{
    compute_hash, sign_hash, verify_archive, ChainErrorKind, ChatChain, ChatChainConfig,
    ChatChainError, ChatEnvelope, ContentNetwork, DecryptFailure, FileBackupStore, Identity,
    InMemoryContentNetwork, InMemoryKeyDirectory, InMemoryLedger, InMemoryThreadStore,
    LocalIdentity, SendOptions, Severity, ThreadId, ThreadStore, ThreadView, VerificationStatus,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared collaborators standing in for the ledger and storage network.
struct Network {
    ledger: InMemoryLedger,
    store: InMemoryThreadStore,
    directory: InMemoryKeyDirectory,
}

impl Network {
    fn new() -> Self {
        init_tracing();
        Self {
            ledger: InMemoryLedger::new(),
            store: InMemoryThreadStore::new(InMemoryContentNetwork::new()),
            directory: InMemoryKeyDirectory::new(),
        }
    }

    async fn join(&self, seed: u8) -> ChatChain {
        self.join_with(seed, ChatChainConfig::default()).await
    }

    async fn join_with(&self, seed: u8, config: ChatChainConfig) -> ChatChain {
        let identity = LocalIdentity::from_seed(&[seed; 32]).unwrap();
        self.directory
            .register(&identity.identity(), identity.encryption_public_key())
            .await;
        ChatChain::new(
            identity,
            config,
            Arc::new(self.ledger.clone()),
            Arc::new(self.store.clone()),
            Arc::new(self.store.network().clone()),
            Arc::new(self.directory.clone()),
        )
    }
}

fn contents(view: &ThreadView) -> Vec<Option<String>> {
    view.sorted_by_index()
        .iter()
        .map(|m| m.decrypted_content.clone())
        .collect()
}

fn pair(a: &ChatChain, b: &ChatChain) -> Vec<Identity> {
    vec![a.identity().identity(), b.identity().identity()]
}

#[tokio::test]
async fn test_only_confirmed_messages_are_shown_and_linked() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let mut sent = Vec::new();
    for i in 0..10 {
        let result = alice
            .send_message(&participants, &format!("message {}", i), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(result.message.index, i);
        sent.push(result);
    }
    let thread_id = sent[0].message.thread_id.clone();

    // The ledger only ever confirmed the first six.
    net.ledger
        .set_confirmed(&thread_id, 6, Some(sent[5].content_pointer.clone()))
        .await;

    let view = bob.open_thread(&thread_id).await.unwrap();
    assert_eq!(view.messages.len(), 6);
    let verification = view.verification.as_ref().unwrap();
    assert_eq!(verification.total_messages, 6);
    assert!(verification.valid);

    let chain = bob
        .reconciler()
        .confirmed_chain(&thread_id, &bob.identity().identity())
        .await
        .unwrap();
    assert_eq!(chain.tail().unwrap().message().index, 5);

    let next = bob
        .send_message(&participants, "after the fork", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(next.message.index, 6);
    assert_eq!(next.message.prev_hash, sent[5].message.hash);
    assert_ne!(next.message.prev_hash, sent[9].message.hash);
}

#[tokio::test]
async fn test_join_time_gating() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let mut thread_id = ThreadId::new("");
    for i in 0..5 {
        thread_id = alice
            .send_message(&participants, &format!("m{}", i), SendOptions::default())
            .await
            .unwrap()
            .message
            .thread_id;
    }
    net.ledger
        .set_joined_at(&thread_id, &bob.identity().identity(), 3)
        .await;

    let view = bob.open_thread(&thread_id).await.unwrap();
    for message in view.sorted_by_index() {
        let gated = message.index() < 3;
        assert_eq!(message.is_before_join_time, gated);
        assert_eq!(message.can_read, !gated);
        assert_eq!(message.decrypted_content.is_some(), !gated);
        // Ciphertext exists for bob either way.
        assert!(message
            .message
            .encrypted_for
            .contains_key(&bob.identity().identity().to_string()));
    }
    assert_eq!(view.readable().count(), 2);
    assert_eq!(
        contents(&view)[3..].to_vec(),
        vec![Some("m3".to_string()), Some("m4".to_string())]
    );
}

#[tokio::test]
async fn test_unconfirmed_tail_is_never_linked() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let a = alice
        .send_message(&participants, "a", SendOptions::default())
        .await
        .unwrap();
    let b = alice
        .send_message(&participants, "b", SendOptions::default())
        .await
        .unwrap();

    net.ledger.hold_confirmations(true).await;
    let c = alice
        .send_message(&participants, "c", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(c.receipt.confirmed_count, None);
    net.ledger.hold_confirmations(false).await;

    let thread_id = a.message.thread_id.clone();
    let view = bob.open_thread(&thread_id).await.unwrap();
    assert_eq!(
        contents(&view),
        vec![Some("a".to_string()), Some("b".to_string())]
    );
    assert_eq!(view.state.unwrap().joined_at_index, 0);
    assert!(view.messages.iter().all(|m| m.can_read));

    let chain = bob
        .reconciler()
        .confirmed_chain(&thread_id, &bob.identity().identity())
        .await
        .unwrap();
    assert_eq!(chain.tail().unwrap().message().hash, b.message.hash);

    let d = bob
        .send_message(&participants, "d", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(d.message.index, 2);
    assert_eq!(d.message.prev_hash, b.message.hash);

    let view = alice.open_thread(&thread_id).await.unwrap();
    assert_eq!(
        contents(&view),
        vec![
            Some("a".to_string()),
            Some("b".to_string()),
            Some("d".to_string())
        ]
    );
    assert!(view.verification.unwrap().valid);
}

#[tokio::test]
async fn test_unknown_thread_is_empty() {
    let net = Network::new();
    let alice = net.join(1).await;

    let view = alice.open_thread(&ThreadId::new("nothing-here")).await.unwrap();
    assert!(view.is_empty());
    assert!(view.state.is_none());
    assert_eq!(view.unread_count(), 0);
}

#[tokio::test]
async fn test_off_chain_data_without_ledger_record_is_ignored() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    net.ledger.hold_confirmations(true).await;
    let sent = alice
        .send_message(&participants, "never confirmed", SendOptions::default())
        .await
        .unwrap();

    let view = bob.open_thread(&sent.message.thread_id).await.unwrap();
    assert!(view.is_empty());
}

#[tokio::test]
async fn test_archive_self_verification() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let mut thread_id = ThreadId::new("");
    for text in ["one", "two", "three"] {
        thread_id = alice
            .send_message(&participants, text, SendOptions::acknowledged())
            .await
            .unwrap()
            .message
            .thread_id;
    }
    net.ledger
        .mark_read(&thread_id, &bob.identity().identity(), 1)
        .await;

    let archive = alice.export_archive(&thread_id).await.unwrap();
    assert_eq!(archive.messages.len(), 3);
    assert_eq!(archive.exported_by, alice.identity().identity());
    assert_eq!(archive.read_receipts.as_ref().unwrap().len(), 1);

    let result = verify_archive(&archive);
    assert!(result.archive_valid);
    assert!(result.chain_valid);

    let mut forged = archive.clone();
    let mut signature = hex::decode(&forged.archive_signature).unwrap();
    signature[10] ^= 0xff;
    forged.archive_signature = hex::encode(signature);

    let result = verify_archive(&forged);
    assert!(!result.archive_valid);
    assert!(result.chain_valid);
}

#[tokio::test]
async fn test_storage_fallback_chain() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let first = alice
        .send_message(&participants, "hello", SendOptions::default())
        .await
        .unwrap();
    let thread_id = first.message.thread_id.clone();

    // Primary down: alice uses her cached pointer, bob the ledger's.
    net.store.set_offline(true).await;
    assert_eq!(alice.open_thread(&thread_id).await.unwrap().messages.len(), 1);
    assert_eq!(bob.open_thread(&thread_id).await.unwrap().messages.len(), 1);
    assert_eq!(
        bob.reconciler().cached_pointer(&thread_id).await,
        Some(first.content_pointer.clone())
    );

    // Nothing left anywhere.
    net.store.network().unpin(&first.content_pointer).await;
    let fresh = net.join(3).await;
    let result = fresh.reconciler().fetch_thread(&thread_id, 1).await;
    assert!(matches!(result, Err(ChatChainError::ThreadUnavailable(_))));
}

#[tokio::test]
async fn test_primary_behind_ledger_falls_back() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let first = alice
        .send_message(&participants, "one", SendOptions::default())
        .await
        .unwrap();
    alice
        .send_message(&participants, "two", SendOptions::default())
        .await
        .unwrap();

    // Primary serves a stale one-message file; the ledger pointer has two.
    let stale = net.store.network().resolve(&first.content_pointer).await.unwrap().unwrap();
    net.store.overwrite(stale).await;

    let view = bob.open_thread(&first.message.thread_id).await.unwrap();
    assert_eq!(
        contents(&view),
        vec![Some("one".to_string()), Some("two".to_string())]
    );
}

#[tokio::test]
async fn test_log_shorter_than_ledger_is_an_error() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let sent = alice
        .send_message(&participants, "only one", SendOptions::default())
        .await
        .unwrap();
    let thread_id = sent.message.thread_id.clone();
    net.ledger
        .set_confirmed(&thread_id, 4, Some(sent.content_pointer.clone()))
        .await;

    let result = bob.open_thread(&thread_id).await;
    assert!(matches!(
        result,
        Err(ChatChainError::ConfirmedPrefixMissing {
            confirmed: 4,
            available: 1,
            ..
        })
    ));
}

#[tokio::test]
async fn test_tampered_log_marks_message_invalid() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let mut thread_id = ThreadId::new("");
    for text in ["x", "y", "z"] {
        thread_id = alice
            .send_message(&participants, text, SendOptions::default())
            .await
            .unwrap()
            .message
            .thread_id;
    }

    let mut file = net.store.get_thread(&thread_id).await.unwrap().unwrap();
    file.messages[1].reply_to = Some("injected".to_string());
    net.store.overwrite(file).await;

    let view = bob.open_thread(&thread_id).await.unwrap();
    assert!(!view.verification.as_ref().unwrap().valid);
    let statuses: Vec<VerificationStatus> = view
        .sorted_by_index()
        .iter()
        .map(|m| m.verification_status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            VerificationStatus::Valid,
            VerificationStatus::Invalid,
            VerificationStatus::Valid
        ]
    );
}

#[tokio::test]
async fn test_warning_only_prefix_accepts_new_messages() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let first = alice
        .send_message(&participants, "first", SendOptions::default())
        .await
        .unwrap();
    let thread_id = first.message.thread_id.clone();

    // Honestly signed, but numbered one past its position.
    let mut file = net.store.get_thread(&thread_id).await.unwrap().unwrap();
    file.messages[0].index = 1;
    file.messages[0].hash = compute_hash(&file.messages[0]).unwrap();
    file.messages[0].signature = sign_hash(&file.messages[0].hash, alice.identity().signing_key());
    net.store.overwrite(file).await;

    let view = bob.open_thread(&thread_id).await.unwrap();
    let verification = view.verification.as_ref().unwrap();
    assert!(verification.valid);
    assert_eq!(verification.errors.len(), 1);
    assert_eq!(verification.errors[0].kind, ChainErrorKind::IndexMismatch);
    assert_eq!(verification.errors[0].severity, Severity::Warning);

    let second = bob
        .send_message(&participants, "second", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(second.message.index, 2);
    assert_eq!(second.receipt.confirmed_count, Some(2));

    let view = alice.open_thread(&thread_id).await.unwrap();
    assert!(view.verification.as_ref().unwrap().valid);
    assert_eq!(
        contents(&view),
        vec![Some("first".to_string()), Some("second".to_string())]
    );
}

#[tokio::test]
async fn test_undecryptable_message_does_not_spoil_thread() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net
        .join_with(2, ChatChainConfig::default().with_verify_chain(false))
        .await;
    let participants = pair(&alice, &bob);

    let mut thread_id = ThreadId::new("");
    for text in ["one", "two", "three"] {
        thread_id = alice
            .send_message(&participants, text, SendOptions::default())
            .await
            .unwrap()
            .message
            .thread_id;
    }

    let mut file = net.store.get_thread(&thread_id).await.unwrap().unwrap();
    for ciphertext in file.messages[1].encrypted_for.values_mut() {
        let mut envelope = ChatEnvelope::from_text(ciphertext).unwrap();
        envelope.ciphertext[0] ^= 0xff;
        *ciphertext = envelope.to_text();
    }
    net.store.overwrite(file).await;

    let view = bob.open_thread(&thread_id).await.unwrap();
    let messages = view.sorted_by_index();
    assert_eq!(messages.len(), 3);
    assert!(matches!(
        messages[1].decryption_error,
        Some(DecryptFailure::Failed(_))
    ));
    assert_eq!(messages[1].decrypted_content, None);
    assert!(messages[1].can_read);
    assert_eq!(messages[0].decrypted_content.as_deref(), Some("one"));
    assert_eq!(messages[2].decrypted_content.as_deref(), Some("three"));
    assert!(messages[0].decryption_error.is_none());
    assert!(messages[2].decryption_error.is_none());
}

#[tokio::test]
async fn test_verification_can_be_disabled() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net
        .join_with(2, ChatChainConfig::default().with_verify_chain(false))
        .await;
    let participants = pair(&alice, &bob);

    let sent = alice
        .send_message(&participants, "unchecked", SendOptions::default())
        .await
        .unwrap();

    let view = bob.open_thread(&sent.message.thread_id).await.unwrap();
    assert!(view.verification.is_none());
    assert_eq!(
        view.messages[0].verification_status,
        VerificationStatus::Unchecked
    );
}

#[tokio::test]
async fn test_legacy_participant_forms() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let participants = vec![
        alice.identity().legacy_identity(),
        bob.identity().legacy_identity(),
    ];

    let sent = alice
        .send_message(&participants, "legacy hello", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(sent.message.sender, alice.identity().legacy_identity());

    let view = bob.open_thread(&sent.message.thread_id).await.unwrap();
    assert_eq!(contents(&view), vec![Some("legacy hello".to_string())]);
    assert!(view.verification.unwrap().valid);
}

#[tokio::test]
async fn test_outsider_sees_no_ciphertext() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let carol = net.join(3).await;

    let sent = alice
        .send_message(&pair(&alice, &bob), "private", SendOptions::default())
        .await
        .unwrap();

    let view = carol.open_thread(&sent.message.thread_id).await.unwrap();
    assert_eq!(view.messages.len(), 1);
    assert_eq!(
        view.messages[0].decryption_error,
        Some(DecryptFailure::NoCiphertext)
    );
    assert!(view.messages[0].decrypted_content.is_none());
}

#[tokio::test]
async fn test_send_refusals() {
    let net = Network::new();
    let alice = net.join(1).await;
    let bob = net.join(2).await;
    let stranger = LocalIdentity::from_seed(&[9u8; 32]).unwrap().identity();

    let result = alice
        .send_message(&[alice.identity().identity(), stranger], "hi", SendOptions::default())
        .await;
    assert!(matches!(result, Err(ChatChainError::PublicKeyNotFound(_))));

    let result = alice
        .send_message(&[bob.identity().identity(), stranger], "hi", SendOptions::default())
        .await;
    assert!(matches!(result, Err(ChatChainError::NotAParticipant(_))));

    let participants = pair(&alice, &bob);
    let thread_id = alice.thread_id_for(&participants);
    net.ledger.terminate(&thread_id).await;
    let result = alice
        .send_message(&participants, "hi", SendOptions::default())
        .await;
    assert!(matches!(result, Err(ChatChainError::ThreadTerminated(_))));
}

#[tokio::test]
async fn test_backup_to_disk_and_restore() {
    let net = Network::new();
    let dir = tempfile::tempdir().unwrap();
    let alice = net
        .join(1)
        .await
        .with_backup_store(Arc::new(FileBackupStore::new(dir.path())));
    let bob = net.join(2).await;
    let participants = pair(&alice, &bob);

    let first = alice
        .send_message(&participants, "keep me", SendOptions::default())
        .await
        .unwrap();
    bob.send_message(
        &participants,
        "and me",
        SendOptions::replying_to(&first.message),
    )
    .await
    .unwrap();
    let thread_id = first.message.thread_id.clone();

    let saved = alice.save_backup(&thread_id).await.unwrap();
    assert_eq!(saved.messages.len(), 2);

    let raw = std::fs::read_to_string(dir.path().join(format!("{}.json", thread_id))).unwrap();
    assert!(!raw.contains("encrypted_for"));

    let restored = alice.restore_backup(&thread_id).await.unwrap().unwrap();
    assert_eq!(restored, saved);
    assert_eq!(
        restored.messages[1].reply_to.as_deref(),
        Some(first.message.message_id.as_str())
    );
    assert_eq!(restored.messages[1].decrypted_content.as_deref(), Some("and me"));

    assert!(matches!(
        bob.save_backup(&thread_id).await,
        Err(ChatChainError::StorageFailed(_))
    ));
}
