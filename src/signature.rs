//! Signing and verification of chain hashes.
//!
//! A message signature is an Ed25519 signature over the raw 32 digest bytes
//! of its [`ChainHash`], never over a re-hash of them. Verification derives
//! the verifying key from the claimed sender identity, so a successful
//! check proves the holder of that identity's key produced the signature.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use sha2::{Digest, Sha256};

use crate::hash::ChainHash;
use crate::identity::Identity;
use crate::models::SignedMessage;
use crate::types::{ChatChainError, Result, SIGNATURE_SIZE};

/// Signs a chain hash, returning the signature as lowercase hex.
pub fn sign_hash(hash: &ChainHash, signing_key: &SigningKey) -> String {
    hex::encode(signing_key.sign(hash.as_bytes()).to_bytes())
}

/// Parses a hex signature into Ed25519 form.
fn parse_signature(signature: &str) -> Result<Signature> {
    let body = signature.strip_prefix("0x").unwrap_or(signature);
    let bytes = hex::decode(body)
        .map_err(|e| ChatChainError::InvalidSignature(format!("Bad signature hex: {}", e)))?;

    if bytes.len() != SIGNATURE_SIZE {
        return Err(ChatChainError::InvalidSignature(format!(
            "Signature must be {} bytes, got {}",
            SIGNATURE_SIZE,
            bytes.len()
        )));
    }

    let signature_bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| ChatChainError::InvalidSignature("Invalid signature bytes".into()))?;
    Ok(Signature::from_bytes(&signature_bytes))
}

/// Checks that `signature` over `hash` was produced by `signer`'s key.
///
/// # Returns
/// `Ok(true)` if the signature is valid, `Ok(false)` if it verifies against
/// a different key or message, and `Err` if the inputs are malformed.
pub fn verify_hash_signature(hash: &ChainHash, signature: &str, signer: &Identity) -> Result<bool> {
    let signature = parse_signature(signature)?;
    let verifying_key = signer.verifying_key()?;
    Ok(verifying_key.verify(hash.as_bytes(), &signature).is_ok())
}

/// Verifies a message's signature against its sender.
///
/// Any malformed input or mismatch is reported as `false`; this never
/// returns an error to the caller.
pub fn verify_signature(message: &SignedMessage) -> bool {
    verify_hash_signature(&message.hash, &message.signature, &message.sender).unwrap_or(false)
}

/// Generates a human-readable fingerprint for an identity key.
///
/// The fingerprint is a truncated SHA-256 hash formatted for easy comparison.
///
/// # Returns
/// A fingerprint string like "A7B3 C9D1 E5F2 8A4B"
pub fn fingerprint(identity: &Identity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.key_bytes());
    let hash = hasher.finalize();

    hash.iter()
        .take(8)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .chunks(2)
        .map(|chunk| chunk.join(""))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_sign_and_verify() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let signer = Identity::from_verifying_key(&signing_key.verifying_key());
        let hash = ChainHash::digest(b"message");

        let signature = sign_hash(&hash, &signing_key);
        assert_eq!(signature.len(), SIGNATURE_SIZE * 2);
        assert!(verify_hash_signature(&hash, &signature, &signer).unwrap());
    }

    #[test]
    fn test_signature_is_over_raw_digest() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let hash = ChainHash::digest(b"message");
        let signature = sign_hash(&hash, &signing_key);

        let raw = parse_signature(&signature).unwrap();
        assert!(signing_key
            .verifying_key()
            .verify(hash.as_bytes(), &raw)
            .is_ok());
    }

    #[test]
    fn test_legacy_form_verifies_same_signature() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let signer = Identity::from_verifying_key(&signing_key.verifying_key()).to_legacy_form();
        let hash = ChainHash::digest(b"message");

        let signature = sign_hash(&hash, &signing_key);
        assert!(verify_hash_signature(&hash, &signature, &signer).unwrap());
    }

    #[test]
    fn test_verify_wrong_key() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let other = Identity::from_verifying_key(&SigningKey::generate(&mut OsRng).verifying_key());
        let hash = ChainHash::digest(b"message");

        let signature = sign_hash(&hash, &signing_key);
        assert!(!verify_hash_signature(&hash, &signature, &other).unwrap());
    }

    #[test]
    fn test_verify_wrong_hash() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let signer = Identity::from_verifying_key(&signing_key.verifying_key());

        let signature = sign_hash(&ChainHash::digest(b"one"), &signing_key);
        assert!(!verify_hash_signature(&ChainHash::digest(b"two"), &signature, &signer).unwrap());
    }

    #[test]
    fn test_invalid_signature_length() {
        let signer = Identity::PublicKey([0u8; 32]);
        let result = verify_hash_signature(&ChainHash::ZERO, "abcd", &signer);
        assert!(matches!(result, Err(ChatChainError::InvalidSignature(_))));
    }

    #[test]
    fn test_fingerprint() {
        let fp = fingerprint(&Identity::PublicKey([0u8; 32]));
        assert_eq!(fp.len(), 19);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() || c == ' '));
    }
}
