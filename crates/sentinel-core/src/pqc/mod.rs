//! Hybrid post-quantum encryption engine.
//!
//! The engine packages two cipher suites behind one surface:
//!
//! - **Hybrid**: ML-KEM encapsulation, HKDF-SHA256 key derivation, and
//!   AES-256-GCM sealing, framed in the self-describing `PSH1` envelope.
//! - **AES-only fallback**: PBKDF2-derived AES-256-CBC with
//!   HMAC-SHA256 (encrypt-then-MAC), framed as `PSA1`, for callers that
//!   cannot hold a keypair.
//!
//! Keypairs live in a [`KeyStore`] that seals secret material at rest
//! and implements copy-on-rotate: rotation generates a fresh keypair,
//! marks the predecessor stale, and leaves it available for
//! decapsulation until a grace period elapses.

mod engine;
mod envelope;
mod keystore;
mod legacy;

pub use engine::{HybridEngine, PqcError, RotationOutcome};
pub use envelope::{AesEnvelope, EnvelopeError, HybridEnvelope, AES_MAGIC, HYBRID_MAGIC};
pub use keystore::{KeyMetadata, KeyStore, KeyStoreError, SecretHandle, StoredKey};
pub use legacy::{aes_decrypt, aes_encrypt, LEGACY_ALGORITHM};
