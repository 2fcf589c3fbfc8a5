//! ECDSA-secp256k1 public-key recovery for wallet signatures.
//!
//! Wallets sign the EIP-191 "personal message" form of the challenge:
//! the message is prefixed with `\x19Ethereum Signed Message:\n<len>`
//! and hashed with Keccak-256. Recovery yields the signer's public key,
//! from which the 20-byte address is derived and compared against the
//! claimed agent identity.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use thiserror::Error;

use super::hash::{keccak256, Hash};
use crate::identity::AgentId;

/// Length of a recoverable signature: `r (32) || s (32) || v (1)`.
pub const SIGNATURE_SIZE: usize = 65;

/// Errors produced during signature recovery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecoverError {
    /// The signature is not 65 bytes.
    #[error("signature must be {SIGNATURE_SIZE} bytes, got {actual}")]
    BadLength {
        /// Actual signature length.
        actual: usize,
    },

    /// The recovery id byte is outside the accepted range.
    #[error("invalid recovery id: {v}")]
    InvalidRecoveryId {
        /// The offending recovery byte.
        v: u8,
    },

    /// The r/s components do not form a valid signature.
    #[error("malformed signature components")]
    MalformedSignature,

    /// No public key could be recovered.
    #[error("public key recovery failed")]
    RecoveryFailed,
}

/// Computes the EIP-191 personal-message hash of `message`.
#[must_use]
pub fn personal_message_hash(message: &[u8]) -> Hash {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut data = Vec::with_capacity(prefix.len() + message.len());
    data.extend_from_slice(prefix.as_bytes());
    data.extend_from_slice(message);
    keccak256(&data)
}

/// Recovers the signer's address from a personal-message signature.
///
/// Accepts recovery bytes in both the raw (`0`/`1`) and the
/// Ethereum-style (`27`/`28`) convention. High-`s` signatures are
/// normalized before recovery.
///
/// # Errors
///
/// Returns [`RecoverError`] if the signature is malformed or no key can
/// be recovered.
pub fn recover_address(message: &[u8], signature: &[u8]) -> Result<AgentId, RecoverError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(RecoverError::BadLength {
            actual: signature.len(),
        });
    }

    let mut v = signature[64];
    if v >= 27 {
        v -= 27;
    }
    if v > 1 {
        return Err(RecoverError::InvalidRecoveryId { v: signature[64] });
    }

    let mut sig =
        Signature::from_slice(&signature[..64]).map_err(|_| RecoverError::MalformedSignature)?;
    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
        v ^= 1;
    }
    let recovery_id = RecoveryId::from_byte(v).ok_or(RecoverError::InvalidRecoveryId { v })?;

    let digest = personal_message_hash(message);
    let verifying_key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)
        .map_err(|_| RecoverError::RecoveryFailed)?;

    Ok(address_of(&verifying_key))
}

/// Derives the EVM address of a verifying key: the last 20 bytes of
/// Keccak-256 over the uncompressed point without its `0x04` tag.
fn address_of(key: &VerifyingKey) -> AgentId {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    AgentId::from_bytes(&address)
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::signature::hazmat::PrehashSigner;
    use k256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    use super::*;

    fn sign_personal(key: &SigningKey, message: &[u8]) -> Vec<u8> {
        let digest = personal_message_hash(message);
        let (sig, recovery_id): (Signature, RecoveryId) =
            key.sign_prehash(&digest).expect("signing succeeds");
        let mut out = sig.to_bytes().to_vec();
        out.push(recovery_id.to_byte());
        out
    }

    #[test]
    fn recovers_signer_address() {
        let key = SigningKey::random(&mut OsRng);
        let expected = address_of(key.verifying_key());

        let message = b"challenge message";
        let signature = sign_personal(&key, message);

        let recovered = recover_address(message, &signature).unwrap();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn accepts_ethereum_style_recovery_byte() {
        let key = SigningKey::random(&mut OsRng);
        let expected = address_of(key.verifying_key());

        let message = b"challenge";
        let mut signature = sign_personal(&key, message);
        signature[64] += 27;

        let recovered = recover_address(message, &signature).unwrap();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn wrong_message_recovers_different_address() {
        let key = SigningKey::random(&mut OsRng);
        let expected = address_of(key.verifying_key());

        let signature = sign_personal(&key, b"signed message");
        match recover_address(b"another message", &signature) {
            Ok(recovered) => assert_ne!(recovered, expected),
            Err(RecoverError::RecoveryFailed) => {},
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_bad_length() {
        let err = recover_address(b"m", &[0u8; 10]).unwrap_err();
        assert_eq!(err, RecoverError::BadLength { actual: 10 });
    }

    #[test]
    fn rejects_bad_recovery_byte() {
        let mut signature = vec![1u8; SIGNATURE_SIZE];
        signature[64] = 9;
        let err = recover_address(b"m", &signature).unwrap_err();
        assert!(matches!(err, RecoverError::InvalidRecoveryId { .. }));
    }
}
