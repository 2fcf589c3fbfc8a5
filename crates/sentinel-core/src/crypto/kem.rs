//! ML-KEM key encapsulation adapter.
//!
//! Wraps the `ml-kem` crate behind byte-slice interfaces so the rest of
//! the core never handles the sized key types directly. Both NIST
//! parameter sets are supported; the choice is carried alongside every
//! key and every envelope.

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem1024, MlKem768};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of the KEM shared secret in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Errors produced by KEM operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KemError {
    /// Encapsulation key bytes have the wrong length for the algorithm.
    #[error("invalid encapsulation key: expected {expected} bytes, got {actual}")]
    InvalidPublicKey {
        /// Expected key length.
        expected: usize,
        /// Actual input length.
        actual: usize,
    },

    /// Decapsulation key bytes have the wrong length for the algorithm.
    #[error("invalid decapsulation key: expected {expected} bytes, got {actual}")]
    InvalidSecretKey {
        /// Expected key length.
        expected: usize,
        /// Actual input length.
        actual: usize,
    },

    /// Ciphertext bytes have the wrong length for the algorithm.
    #[error("invalid KEM ciphertext: expected {expected} bytes, got {actual}")]
    InvalidCiphertext {
        /// Expected ciphertext length.
        expected: usize,
        /// Actual input length.
        actual: usize,
    },

    /// The encapsulation operation itself failed.
    #[error("encapsulation failed")]
    EncapsulationFailed,

    /// The decapsulation operation itself failed.
    #[error("decapsulation failed")]
    DecapsulationFailed,
}

/// Supported ML-KEM parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KemAlgorithm {
    /// ML-KEM-768 (NIST security category 3).
    #[serde(rename = "ML-KEM-768")]
    MlKem768,
    /// ML-KEM-1024 (NIST security category 5).
    #[serde(rename = "ML-KEM-1024")]
    MlKem1024,
}

impl KemAlgorithm {
    /// Canonical algorithm name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MlKem768 => "ML-KEM-768",
            Self::MlKem1024 => "ML-KEM-1024",
        }
    }

    /// Numeric security level (768 or 1024).
    #[must_use]
    pub const fn security_level(self) -> u32 {
        match self {
            Self::MlKem768 => 768,
            Self::MlKem1024 => 1024,
        }
    }

    /// Resolves an algorithm from its numeric security level.
    #[must_use]
    pub const fn from_security_level(level: u32) -> Option<Self> {
        match level {
            768 => Some(Self::MlKem768),
            1024 => Some(Self::MlKem1024),
            _ => None,
        }
    }

    /// Identifier byte used in the hybrid envelope.
    #[must_use]
    pub const fn wire_byte(self) -> u8 {
        match self {
            Self::MlKem768 => 0x01,
            Self::MlKem1024 => 0x02,
        }
    }

    /// Resolves an algorithm from its envelope identifier byte.
    #[must_use]
    pub const fn from_wire_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::MlKem768),
            0x02 => Some(Self::MlKem1024),
            _ => None,
        }
    }

    /// Encapsulation (public) key length in bytes.
    #[must_use]
    pub const fn encap_key_size(self) -> usize {
        match self {
            Self::MlKem768 => 1184,
            Self::MlKem1024 => 1568,
        }
    }

    /// Decapsulation (secret) key length in bytes.
    #[must_use]
    pub const fn decap_key_size(self) -> usize {
        match self {
            Self::MlKem768 => 2400,
            Self::MlKem1024 => 3168,
        }
    }

    /// KEM ciphertext length in bytes.
    #[must_use]
    pub const fn ciphertext_size(self) -> usize {
        match self {
            Self::MlKem768 => 1088,
            Self::MlKem1024 => 1568,
        }
    }
}

impl std::fmt::Display for KemAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of an encapsulation: the ciphertext to transmit and the shared
/// secret to derive an AEAD key from.
#[derive(Debug)]
pub struct Encapsulation {
    /// KEM ciphertext bytes.
    pub ciphertext: Vec<u8>,
    /// Shared secret, wiped on drop.
    pub shared: Zeroizing<[u8; SHARED_SECRET_SIZE]>,
}

/// Generates a fresh keypair, returning `(encap_key, decap_key)`.
///
/// The decapsulation key is returned in a zeroizing container; callers
/// move it into a sealed store and never copy it out again.
#[must_use]
pub fn generate(algorithm: KemAlgorithm) -> (Vec<u8>, Zeroizing<Vec<u8>>) {
    match algorithm {
        KemAlgorithm::MlKem768 => generate_inner::<MlKem768>(),
        KemAlgorithm::MlKem1024 => generate_inner::<MlKem1024>(),
    }
}

/// Encapsulates a shared secret to the given encapsulation key.
///
/// # Errors
///
/// Returns [`KemError`] if the key bytes are malformed or the operation
/// fails.
pub fn encapsulate(algorithm: KemAlgorithm, encap_key: &[u8]) -> Result<Encapsulation, KemError> {
    if encap_key.len() != algorithm.encap_key_size() {
        return Err(KemError::InvalidPublicKey {
            expected: algorithm.encap_key_size(),
            actual: encap_key.len(),
        });
    }
    match algorithm {
        KemAlgorithm::MlKem768 => encapsulate_inner::<MlKem768>(encap_key),
        KemAlgorithm::MlKem1024 => encapsulate_inner::<MlKem1024>(encap_key),
    }
}

/// Recovers the shared secret from a KEM ciphertext.
///
/// # Errors
///
/// Returns [`KemError`] if the key or ciphertext bytes are malformed or
/// the operation fails.
pub fn decapsulate(
    algorithm: KemAlgorithm,
    decap_key: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<[u8; SHARED_SECRET_SIZE]>, KemError> {
    if decap_key.len() != algorithm.decap_key_size() {
        return Err(KemError::InvalidSecretKey {
            expected: algorithm.decap_key_size(),
            actual: decap_key.len(),
        });
    }
    if ciphertext.len() != algorithm.ciphertext_size() {
        return Err(KemError::InvalidCiphertext {
            expected: algorithm.ciphertext_size(),
            actual: ciphertext.len(),
        });
    }
    match algorithm {
        KemAlgorithm::MlKem768 => decapsulate_inner::<MlKem768>(decap_key, ciphertext),
        KemAlgorithm::MlKem1024 => decapsulate_inner::<MlKem1024>(decap_key, ciphertext),
    }
}

fn generate_inner<K: KemCore>() -> (Vec<u8>, Zeroizing<Vec<u8>>) {
    let mut rng = OsRng;
    let (dk, ek) = K::generate(&mut rng);
    let encap = ek.as_bytes().as_slice().to_vec();
    let decap = Zeroizing::new(dk.as_bytes().as_slice().to_vec());
    (encap, decap)
}

fn encapsulate_inner<K: KemCore>(encap_key: &[u8]) -> Result<Encapsulation, KemError> {
    // Length is validated by the caller against the algorithm's sizes.
    let encoded = Encoded::<K::EncapsulationKey>::try_from(encap_key)
        .map_err(|_| KemError::EncapsulationFailed)?;
    let ek = K::EncapsulationKey::from_bytes(&encoded);

    let mut rng = OsRng;
    let (ciphertext, shared) = ek
        .encapsulate(&mut rng)
        .map_err(|_| KemError::EncapsulationFailed)?;

    let mut secret = Zeroizing::new([0u8; SHARED_SECRET_SIZE]);
    secret.copy_from_slice(shared.as_slice());

    Ok(Encapsulation {
        ciphertext: ciphertext.as_slice().to_vec(),
        shared: secret,
    })
}

fn decapsulate_inner<K: KemCore>(
    decap_key: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<[u8; SHARED_SECRET_SIZE]>, KemError> {
    // Lengths are validated by the caller against the algorithm's sizes.
    let encoded = Encoded::<K::DecapsulationKey>::try_from(decap_key)
        .map_err(|_| KemError::DecapsulationFailed)?;
    let dk = K::DecapsulationKey::from_bytes(&encoded);

    let ct = Ciphertext::<K>::try_from(ciphertext).map_err(|_| KemError::DecapsulationFailed)?;

    let shared = dk
        .decapsulate(&ct)
        .map_err(|_| KemError::DecapsulationFailed)?;

    let mut secret = Zeroizing::new([0u8; SHARED_SECRET_SIZE]);
    secret.copy_from_slice(shared.as_slice());
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_768() {
        let (ek, dk) = generate(KemAlgorithm::MlKem768);
        assert_eq!(ek.len(), KemAlgorithm::MlKem768.encap_key_size());
        assert_eq!(dk.len(), KemAlgorithm::MlKem768.decap_key_size());

        let encap = encapsulate(KemAlgorithm::MlKem768, &ek).unwrap();
        assert_eq!(encap.ciphertext.len(), KemAlgorithm::MlKem768.ciphertext_size());

        let shared = decapsulate(KemAlgorithm::MlKem768, &dk, &encap.ciphertext).unwrap();
        assert_eq!(*shared, *encap.shared);
    }

    #[test]
    fn round_trip_1024() {
        let (ek, dk) = generate(KemAlgorithm::MlKem1024);
        let encap = encapsulate(KemAlgorithm::MlKem1024, &ek).unwrap();
        let shared = decapsulate(KemAlgorithm::MlKem1024, &dk, &encap.ciphertext).unwrap();
        assert_eq!(*shared, *encap.shared);
    }

    #[test]
    fn wrong_key_length_rejected() {
        let err = encapsulate(KemAlgorithm::MlKem768, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, KemError::InvalidPublicKey { actual: 16, .. }));
    }

    #[test]
    fn tampered_ciphertext_yields_different_secret() {
        // Implicit rejection: decapsulation of a corrupted ciphertext
        // succeeds but produces an unrelated secret.
        let (ek, dk) = generate(KemAlgorithm::MlKem768);
        let encap = encapsulate(KemAlgorithm::MlKem768, &ek).unwrap();

        let mut corrupted = encap.ciphertext.clone();
        corrupted[0] ^= 0x01;
        let shared = decapsulate(KemAlgorithm::MlKem768, &dk, &corrupted).unwrap();
        assert_ne!(*shared, *encap.shared);
    }

    #[test]
    fn wire_byte_round_trip() {
        for algorithm in [KemAlgorithm::MlKem768, KemAlgorithm::MlKem1024] {
            assert_eq!(
                KemAlgorithm::from_wire_byte(algorithm.wire_byte()),
                Some(algorithm)
            );
        }
        assert_eq!(KemAlgorithm::from_wire_byte(0x03), None);
    }
}
