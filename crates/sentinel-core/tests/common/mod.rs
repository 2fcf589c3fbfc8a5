//! Shared helpers for integration tests.

use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{RecoveryId, Signature, SigningKey};
use rand::rngs::OsRng;
use sentinel_core::crypto::{keccak256, personal_message_hash};
use sentinel_core::identity::AgentId;

/// A test wallet: a secp256k1 key and its derived address.
pub struct Wallet {
    pub key: SigningKey,
    pub agent_id: AgentId,
}

impl Wallet {
    pub fn random() -> Self {
        let key = SigningKey::random(&mut OsRng);
        let point = key.verifying_key().to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);
        Self {
            agent_id: AgentId::from_bytes(&address),
            key,
        }
    }

    /// Signs a personal message, returning the 65-byte recoverable
    /// signature as hex.
    pub fn sign(&self, message: &str) -> String {
        let digest = personal_message_hash(message.as_bytes());
        let (sig, recovery_id): (Signature, RecoveryId) =
            self.key.sign_prehash(&digest).expect("signing succeeds");
        let mut out = sig.to_bytes().to_vec();
        out.push(recovery_id.to_byte());
        hex::encode(out)
    }
}
