//! Chain verification.
//!
//! [`verify_chain`] walks every position of a message sequence and runs all
//! checks independently at each one. Nothing short-circuits: the result
//! lists every problem found, so a caller can show partial trust such as
//! "47 of 50 messages verified".
//!
//! | Check                                   | Severity |
//! |-----------------------------------------|----------|
//! | signature does not verify against sender | CRITICAL |
//! | recomputed hash differs from stored hash | CRITICAL |
//! | `prev_hash` differs from previous hash   | CRITICAL |
//! | first message has non-zero `prev_hash`   | WARNING  |
//! | `index` differs from position            | WARNING  |

use serde::{Deserialize, Serialize};

use crate::hash::compute_hash;
use crate::models::SignedMessage;
use crate::signature::verify_signature;

/// How much a verification error undermines trust in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Forgery, tampering, or a broken link. The chain must not be trusted.
    Critical,
    /// Ordering or metadata anomaly. Usable, display with caution.
    Warning,
}

/// What a verification error is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorKind {
    /// Signature does not verify against the sender.
    InvalidSignature,
    /// Stored hash does not match the message content.
    Tampered,
    /// `prev_hash` does not match the previous message's hash.
    ChainBroken,
    /// First message has a non-zero `prev_hash`.
    GenesisPrevHash,
    /// `index` does not match the message's position.
    IndexMismatch,
}

impl ChainErrorKind {
    /// The severity this kind of error carries.
    pub fn severity(self) -> Severity {
        match self {
            Self::InvalidSignature | Self::Tampered | Self::ChainBroken => Severity::Critical,
            Self::GenesisPrevHash | Self::IndexMismatch => Severity::Warning,
        }
    }
}

/// One problem found at one position of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainError {
    /// Position in the verified sequence.
    pub index: u64,
    /// ID of the message at that position.
    pub message_id: String,
    /// Human-readable description.
    pub error: String,
    /// Severity of the problem.
    pub severity: Severity,
    /// Machine-readable classification.
    pub kind: ChainErrorKind,
}

/// Outcome of verifying a message sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerificationResult {
    /// True iff no CRITICAL error was found.
    pub valid: bool,
    /// Every error found, in position order.
    pub errors: Vec<ChainError>,
    /// Number of messages checked.
    pub total_messages: u64,
    /// `total_messages` minus the number of CRITICAL errors.
    pub verified_messages: u64,
}

impl ChainVerificationResult {
    /// Errors of the given severity.
    pub fn errors_with(&self, severity: Severity) -> impl Iterator<Item = &ChainError> {
        self.errors.iter().filter(move |e| e.severity == severity)
    }

    /// Number of CRITICAL errors.
    pub fn critical_count(&self) -> usize {
        self.errors_with(Severity::Critical).count()
    }

    /// Whether any CRITICAL error was found at `position`.
    pub fn has_critical_at(&self, position: u64) -> bool {
        self.errors_with(Severity::Critical)
            .any(|e| e.index == position)
    }

    /// One line per error, for display or flattening into other reports.
    pub fn error_lines(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|e| format!("[{:?}] message {} ({}): {}", e.severity, e.index, e.message_id, e.error))
            .collect()
    }
}

fn push_error(
    errors: &mut Vec<ChainError>,
    position: u64,
    message: &SignedMessage,
    kind: ChainErrorKind,
    error: String,
) {
    errors.push(ChainError {
        index: position,
        message_id: message.message_id.clone(),
        error,
        severity: kind.severity(),
        kind,
    });
}

/// Verifies an ordered sequence of messages.
///
/// Never fails: every problem is recorded in the returned result.
pub fn verify_chain(messages: &[SignedMessage]) -> ChainVerificationResult {
    let mut errors = Vec::new();

    for (position, message) in messages.iter().enumerate() {
        let position = position as u64;

        if !verify_signature(message) {
            push_error(
                &mut errors,
                position,
                message,
                ChainErrorKind::InvalidSignature,
                format!("Signature does not verify against sender {}", message.sender),
            );
        }

        match compute_hash(message) {
            Ok(hash) if hash == message.hash => {}
            Ok(hash) => push_error(
                &mut errors,
                position,
                message,
                ChainErrorKind::Tampered,
                format!("Tampered: stored hash {} but content hashes to {}", message.hash, hash),
            ),
            Err(e) => push_error(
                &mut errors,
                position,
                message,
                ChainErrorKind::Tampered,
                format!("Tampered: content could not be hashed: {}", e),
            ),
        }

        if position == 0 {
            if !message.prev_hash.is_zero() {
                push_error(
                    &mut errors,
                    position,
                    message,
                    ChainErrorKind::GenesisPrevHash,
                    format!("First message has non-zero prev_hash {}", message.prev_hash),
                );
            }
        } else {
            let previous = &messages[position as usize - 1];
            if message.prev_hash != previous.hash {
                push_error(
                    &mut errors,
                    position,
                    message,
                    ChainErrorKind::ChainBroken,
                    format!(
                        "Chain broken: prev_hash {} does not match previous hash {}",
                        message.prev_hash, previous.hash
                    ),
                );
            }
        }

        if message.index != position {
            push_error(
                &mut errors,
                position,
                message,
                ChainErrorKind::IndexMismatch,
                format!("Index {} at position {}", message.index, position),
            );
        }
    }

    let total_messages = messages.len() as u64;
    let critical = errors
        .iter()
        .filter(|e| e.severity == Severity::Critical)
        .count() as u64;

    ChainVerificationResult {
        valid: critical == 0,
        errors,
        total_messages,
        verified_messages: total_messages.saturating_sub(critical),
    }
}
