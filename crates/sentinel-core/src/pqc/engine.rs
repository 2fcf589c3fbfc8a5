//! Hybrid encryption engine.
//!
//! Encryption path: ML-KEM encapsulation against the recipient key,
//! HKDF-SHA256 key derivation bound to the key id, AES-256-GCM sealing
//! with a fresh 12-byte nonce and empty AAD. Decryption reverses the
//! steps; every authentication failure surfaces as
//! [`PqcError::AuthenticationFailure`] with no partial plaintext.

use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use thiserror::Error;

use super::envelope::{EnvelopeError, HybridEnvelope, GCM_NONCE_SIZE};
use super::keystore::{key_id_for, KeyMetadata, KeyStore, KeyStoreError, SecretHandle, StoredKey};
use crate::crypto::{self, KemAlgorithm, KemError};
use crate::identity::AgentId;

/// Errors produced by hybrid encryption operations.
#[derive(Debug, Error)]
pub enum PqcError {
    /// The ciphertext envelope is structurally invalid.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] EnvelopeError),

    /// AEAD or MAC verification failed; the ciphertext or key is wrong.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// The envelope was produced for a different parameter set than the
    /// supplied key.
    #[error("algorithm mismatch: envelope is {envelope}, key is {key}")]
    AlgorithmMismatch {
        /// Algorithm declared by the envelope.
        envelope: KemAlgorithm,
        /// Algorithm of the supplied key.
        key: KemAlgorithm,
    },

    /// The key is stale and outside its permitted use window.
    #[error("stale key: {key_id}")]
    StaleKey {
        /// Identifier of the stale key.
        key_id: String,
    },

    /// KEM-level failure.
    #[error(transparent)]
    Kem(#[from] KemError),

    /// Key store failure.
    #[error(transparent)]
    Store(#[from] KeyStoreError),
}

/// Outcome of a key rotation.
#[derive(Debug, Clone)]
pub struct RotationOutcome {
    /// The key that was rotated out.
    pub old_key_id: String,
    /// The replacement key.
    pub new_key: StoredKey,
}

/// Hybrid post-quantum encryption engine.
///
/// Holds the key store plus the rotation policy: a key older than the
/// rotation interval is stale for new encapsulations, and a rotated key
/// keeps decapsulating prior ciphertexts until the grace period after
/// rotation elapses.
pub struct HybridEngine {
    store: Arc<KeyStore>,
    level: KemAlgorithm,
    rotation_interval: Duration,
    grace_period: Duration,
}

impl HybridEngine {
    /// Creates an engine over the given store.
    #[must_use]
    pub fn new(
        store: Arc<KeyStore>,
        level: KemAlgorithm,
        rotation_interval: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            store,
            level,
            rotation_interval,
            grace_period,
        }
    }

    /// Returns the configured default parameter set.
    #[must_use]
    pub const fn level(&self) -> KemAlgorithm {
        self.level
    }

    /// Generates a keypair at the configured level for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`PqcError::Store`] if persistence fails.
    pub fn generate_keypair(&self, owner: &AgentId) -> Result<StoredKey, PqcError> {
        let stored = self.store.generate(owner, self.level)?;
        tracing::info!(
            key_id = %stored.metadata.key_id,
            algorithm = %self.level,
            owner = %owner,
            "generated keypair"
        );
        Ok(stored)
    }

    /// Encrypts `plaintext` to the keypair identified by `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PqcError::StaleKey`] if the recipient key is past its
    /// rotation interval, or a KEM/store error.
    pub fn encrypt_hybrid(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, PqcError> {
        let stored = self.store.get(key_id)?;
        if self.stale_for_encryption(&stored.metadata, Utc::now()) {
            return Err(PqcError::StaleKey {
                key_id: key_id.to_string(),
            });
        }
        self.encrypt_to_public(stored.metadata.algorithm, &stored.public, plaintext)
    }

    /// Encrypts `plaintext` to a raw encapsulation key.
    ///
    /// # Errors
    ///
    /// Returns a KEM error if the key bytes are invalid.
    pub fn encrypt_to_public(
        &self,
        algorithm: KemAlgorithm,
        public: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, PqcError> {
        let encap = crypto::encapsulate(algorithm, public)?;
        let aes_key = crypto::derive_aes_key(&*encap.shared, key_id_for(public).as_bytes());

        let mut nonce = [0u8; GCM_NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*aes_key));
        let aead_ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| PqcError::AuthenticationFailure)?;

        Ok(HybridEnvelope {
            algorithm,
            kem_ciphertext: encap.ciphertext,
            nonce,
            aead_ciphertext,
        }
        .encode())
    }

    /// Decrypts a hybrid envelope using the keypair identified by
    /// `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PqcError`] per the failure taxonomy: `Malformed`,
    /// `AuthenticationFailure`, `AlgorithmMismatch`, or `StaleKey`.
    pub fn decrypt(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>, PqcError> {
        let handle = self.store.secret(key_id)?;
        self.decrypt_hybrid(&handle, data)
    }

    /// Decrypts a hybrid envelope with an already-unsealed secret.
    ///
    /// # Errors
    ///
    /// See [`Self::decrypt`].
    pub fn decrypt_hybrid(
        &self,
        handle: &SecretHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, PqcError> {
        let envelope = HybridEnvelope::decode(data)?;

        if envelope.algorithm != handle.metadata.algorithm {
            return Err(PqcError::AlgorithmMismatch {
                envelope: envelope.algorithm,
                key: handle.metadata.algorithm,
            });
        }
        if self.past_grace(&handle.metadata, Utc::now()) {
            return Err(PqcError::StaleKey {
                key_id: handle.metadata.key_id.clone(),
            });
        }

        let shared = crypto::decapsulate(
            envelope.algorithm,
            handle.decap_key(),
            &envelope.kem_ciphertext,
        )?;
        let aes_key = crypto::derive_aes_key(&*shared, handle.metadata.key_id.as_bytes());

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*aes_key));
        cipher
            .decrypt(Nonce::from_slice(&envelope.nonce), &envelope.aead_ciphertext[..])
            .map_err(|_| PqcError::AuthenticationFailure)
    }

    /// Returns the metadata for `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PqcError::Store`] if the key does not exist.
    pub fn key_metadata(&self, key_id: &str) -> Result<KeyMetadata, PqcError> {
        Ok(self.store.get(key_id)?.metadata)
    }

    /// Reassigns every keypair owned by `from` to `to`, returning the
    /// number of keys moved.
    ///
    /// # Errors
    ///
    /// Returns [`PqcError::Store`] if metadata cannot be rewritten.
    pub fn reassign_keys(&self, from: &AgentId, to: &AgentId) -> Result<usize, PqcError> {
        Ok(self.store.reassign_owner(from, to)?)
    }

    /// Rotates the keypair identified by `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PqcError::Store`] if the key does not exist or
    /// persistence fails.
    pub fn rotate(&self, key_id: &str) -> Result<RotationOutcome, PqcError> {
        let new_key = self.store.rotate(key_id)?;
        Ok(RotationOutcome {
            old_key_id: key_id.to_string(),
            new_key,
        })
    }

    /// Whether `metadata` may be used for new encapsulations at `now`.
    #[must_use]
    pub fn stale_for_encryption(&self, metadata: &KeyMetadata, now: DateTime<Utc>) -> bool {
        metadata.stale || metadata.created_at + self.rotation_interval < now
    }

    /// Whether `metadata` has left its decapsulation grace window.
    fn past_grace(&self, metadata: &KeyMetadata, now: DateTime<Utc>) -> bool {
        match metadata.rotated_at {
            Some(rotated_at) => metadata.stale && rotated_at + self.grace_period < now,
            // A never-rotated key keeps decapsulating: staleness only
            // blocks new encapsulations until the operator rotates.
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> AgentId {
        AgentId::parse("0x00a329c0648769a73afac7f9381e08fb43dbea72").unwrap()
    }

    fn engine() -> HybridEngine {
        HybridEngine::new(
            Arc::new(KeyStore::in_memory()),
            KemAlgorithm::MlKem768,
            Duration::days(90),
            Duration::days(30),
        )
    }

    #[test]
    fn hybrid_round_trip() {
        let engine = engine();
        let key = engine.generate_keypair(&owner()).unwrap();

        let envelope = engine
            .encrypt_hybrid(&key.metadata.key_id, b"hello quantum")
            .unwrap();
        assert_eq!(&envelope[..5], b"PSH1\x01");

        let plaintext = engine.decrypt(&key.metadata.key_id, &envelope).unwrap();
        assert_eq!(plaintext, b"hello quantum");
    }

    #[test]
    fn decrypt_with_wrong_key_fails_authentication() {
        let engine = engine();
        let recipient = engine.generate_keypair(&owner()).unwrap();
        let other = engine.generate_keypair(&owner()).unwrap();

        let envelope = engine
            .encrypt_hybrid(&recipient.metadata.key_id, b"payload")
            .unwrap();
        let err = engine.decrypt(&other.metadata.key_id, &envelope).unwrap_err();
        assert!(matches!(err, PqcError::AuthenticationFailure));
    }

    #[test]
    fn algorithm_mismatch_is_detected_before_decapsulation() {
        let store = Arc::new(KeyStore::in_memory());
        let engine_768 = HybridEngine::new(
            Arc::clone(&store),
            KemAlgorithm::MlKem768,
            Duration::days(90),
            Duration::days(30),
        );
        let engine_1024 = HybridEngine::new(
            Arc::clone(&store),
            KemAlgorithm::MlKem1024,
            Duration::days(90),
            Duration::days(30),
        );

        let key_768 = engine_768.generate_keypair(&owner()).unwrap();
        let key_1024 = engine_1024.generate_keypair(&owner()).unwrap();

        let envelope = engine_1024
            .encrypt_hybrid(&key_1024.metadata.key_id, b"data")
            .unwrap();
        let err = engine_768
            .decrypt(&key_768.metadata.key_id, &envelope)
            .unwrap_err();
        assert!(matches!(err, PqcError::AlgorithmMismatch { .. }));
    }

    #[test]
    fn rotated_key_rejects_new_encryptions() {
        let engine = engine();
        let key = engine.generate_keypair(&owner()).unwrap();
        let outcome = engine.rotate(&key.metadata.key_id).unwrap();

        let err = engine
            .encrypt_hybrid(&outcome.old_key_id, b"data")
            .unwrap_err();
        assert!(matches!(err, PqcError::StaleKey { .. }));

        // The replacement accepts encryptions.
        engine
            .encrypt_hybrid(&outcome.new_key.metadata.key_id, b"data")
            .unwrap();
    }

    #[test]
    fn rotated_key_still_decrypts_within_grace() {
        let engine = engine();
        let key = engine.generate_keypair(&owner()).unwrap();
        let envelope = engine
            .encrypt_hybrid(&key.metadata.key_id, b"pre-rotation")
            .unwrap();

        engine.rotate(&key.metadata.key_id).unwrap();

        let plaintext = engine.decrypt(&key.metadata.key_id, &envelope).unwrap();
        assert_eq!(plaintext, b"pre-rotation");
    }

    #[test]
    fn grace_expiry_blocks_decryption() {
        let engine = HybridEngine::new(
            Arc::new(KeyStore::in_memory()),
            KemAlgorithm::MlKem768,
            Duration::days(90),
            Duration::zero(),
        );
        let key = engine.generate_keypair(&owner()).unwrap();
        let envelope = engine
            .encrypt_hybrid(&key.metadata.key_id, b"old data")
            .unwrap();

        engine.rotate(&key.metadata.key_id).unwrap();

        // Grace period of zero: any rotated key is immediately out of
        // its decapsulation window once the clock advances.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let err = engine.decrypt(&key.metadata.key_id, &envelope).unwrap_err();
        assert!(matches!(err, PqcError::StaleKey { .. }));
    }

    #[test]
    fn aged_key_is_stale_without_rotation() {
        let engine = engine();
        let key = engine.generate_keypair(&owner()).unwrap();
        let mut metadata = key.metadata.clone();
        metadata.created_at = Utc::now() - Duration::days(91);
        assert!(engine.stale_for_encryption(&metadata, Utc::now()));
        assert!(!engine.stale_for_encryption(&key.metadata, Utc::now()));
    }
}
