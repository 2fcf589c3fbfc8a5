//! Cryptographic primitives for the sentinel core.
//!
//! This module is a thin adapter over the vetted primitive crates; no
//! primitive is implemented here. It exposes:
//!
//! - **SHA-256 / Keccak-256 hashing** for record signatures, Merkle trees
//!   and address derivation
//! - **ML-KEM-768 / ML-KEM-1024** key encapsulation
//! - **HKDF-SHA256 / PBKDF2-SHA256** key derivation
//! - **ECDSA-secp256k1 public-key recovery** for wallet authentication
//!
//! Shared secrets and derived keys are returned in [`zeroize::Zeroizing`]
//! containers so they are wiped when released.

mod hash;
mod kdf;
mod kem;
mod recover;

pub use hash::{ct_eq, keccak256, sha256, sha256_concat, Hash, HASH_SIZE};
pub use kdf::{derive_aes_key, derive_password_keys, PasswordKeys, PBKDF2_ITERATIONS};
pub use kem::{decapsulate, encapsulate, generate, Encapsulation, KemAlgorithm, KemError, SHARED_SECRET_SIZE};
pub use recover::{personal_message_hash, recover_address, RecoverError, SIGNATURE_SIZE};
