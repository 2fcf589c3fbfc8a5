//! Key derivation helpers.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

/// PBKDF2 iteration count for password-derived keys (OWASP 2024 floor).
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// HKDF salt label for hybrid AEAD key derivation.
pub(crate) const HYBRID_KDF_SALT: &[u8] = b"PULSAR-HYBRID-v1";

/// Derives a 32-byte AES key from a KEM shared secret via HKDF-SHA256.
///
/// `info` binds the derivation to the recipient key (the key id), so a
/// ciphertext cannot be re-targeted across keypairs.
#[must_use]
pub fn derive_aes_key(shared: &[u8], info: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(HYBRID_KDF_SALT), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut *okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Key pair derived from a password: one half encrypts, one half
/// authenticates.
pub struct PasswordKeys {
    /// AES-256 encryption key.
    pub enc: Zeroizing<[u8; 32]>,
    /// HMAC-SHA256 authentication key.
    pub mac: Zeroizing<[u8; 32]>,
}

/// Derives encryption and MAC keys from a password via PBKDF2-SHA256.
#[must_use]
pub fn derive_password_keys(password: &[u8], salt: &[u8], iterations: u32) -> PasswordKeys {
    let mut okm = Zeroizing::new([0u8; 64]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut *okm);

    let mut enc = Zeroizing::new([0u8; 32]);
    let mut mac = Zeroizing::new([0u8; 32]);
    enc.copy_from_slice(&okm[..32]);
    mac.copy_from_slice(&okm[32..]);
    PasswordKeys { enc, mac }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_and_info_bound() {
        let shared = [0x42u8; 32];
        let a = derive_aes_key(&shared, b"key-a");
        let b = derive_aes_key(&shared, b"key-a");
        let c = derive_aes_key(&shared, b"key-b");
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn password_keys_split_is_stable() {
        // Low iteration count keeps the test fast; production callers use
        // PBKDF2_ITERATIONS.
        let first = derive_password_keys(b"correct horse", b"0123456789abcdef", 1_000);
        let second = derive_password_keys(b"correct horse", b"0123456789abcdef", 1_000);
        assert_eq!(*first.enc, *second.enc);
        assert_eq!(*first.mac, *second.mac);
        assert_ne!(*first.enc, *first.mac);
    }

    #[test]
    fn password_keys_differ_by_salt() {
        let a = derive_password_keys(b"pw", b"salt-aaaaaaaaaaa", 1_000);
        let b = derive_password_keys(b"pw", b"salt-bbbbbbbbbbb", 1_000);
        assert_ne!(*a.enc, *b.enc);
    }
}
