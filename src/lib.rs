//! ChatChain - Signed message hash-chains over a ledger and off-chain storage
//!
//! Each conversation is an append-only chain of per-recipient encrypted,
//! Ed25519-signed messages. The ledger decides how many messages really
//! exist; the off-chain log is reconciled against it before anything is
//! displayed or linked to.

mod types;
mod identity;
mod keys;
mod hash;
mod signature;
mod thread_id;
mod envelope;
mod crypto;
mod models;
mod builder;
mod verifier;
mod ledger;
mod storage;
mod reconcile;
mod archive;
mod backup;
mod client;

pub use types::*;
pub use identity::*;
pub use keys::*;
pub use hash::*;
pub use signature::*;
pub use thread_id::*;
pub use envelope::*;
pub use crypto::*;
pub use models::*;
pub use builder::*;
pub use verifier::*;
pub use ledger::*;
pub use storage::*;
pub use reconcile::*;
pub use archive::*;
pub use backup::*;
pub use client::*;
