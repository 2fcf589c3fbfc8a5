//! Hash helpers used throughout the core.

use sha2::{Digest, Sha256};
use sha3::Keccak256;
use subtle::ConstantTimeEq;

/// Size of a hash digest in bytes.
pub const HASH_SIZE: usize = 32;

/// A 32-byte digest.
pub type Hash = [u8; HASH_SIZE];

/// Computes SHA-256 over `data`.
#[must_use]
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Computes `SHA-256(left || right)`, the internal-node rule for Merkle
/// trees.
#[must_use]
pub fn sha256_concat(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Computes Keccak-256 over `data` (EVM address and message hashing).
#[must_use]
pub fn keccak256(data: &[u8]) -> Hash {
    Keccak256::digest(data).into()
}

/// Constant-time equality for byte strings.
///
/// Inputs of different lengths compare unequal without leaking where
/// they diverge.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc") from FIPS 180-4.
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn concat_matches_manual_concatenation() {
        let left = sha256(b"left");
        let right = sha256(b"right");
        let mut joined = Vec::with_capacity(HASH_SIZE * 2);
        joined.extend_from_slice(&left);
        joined.extend_from_slice(&right);
        assert_eq!(sha256_concat(&left, &right), sha256(&joined));
    }

    #[test]
    fn keccak_differs_from_sha256() {
        assert_ne!(keccak256(b"abc"), sha256(b"abc"));
    }

    #[test]
    fn ct_eq_handles_length_mismatch() {
        assert!(ct_eq(b"same", b"same"));
        assert!(!ct_eq(b"same", b"different"));
        assert!(!ct_eq(b"short", b"short "));
    }
}
