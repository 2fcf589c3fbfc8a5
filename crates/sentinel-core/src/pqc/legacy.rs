//! Password-based AES fallback (classical, not quantum-resistant).
//!
//! AES-256-CBC with HMAC-SHA256 in encrypt-then-MAC form. Keys are
//! derived from the password with PBKDF2-SHA256 and a fresh 16-byte
//! salt per encryption; the MAC covers `salt || iv || ciphertext` so a
//! forged header fails before any decryption work happens.

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::engine::PqcError;
use super::envelope::{AesEnvelope, AES_SALT_SIZE, CBC_IV_SIZE};
use crate::crypto::{ct_eq, derive_password_keys, PBKDF2_ITERATIONS};

/// Algorithm identifier recorded in audit metadata for fallback ops.
pub const LEGACY_ALGORITHM: &str = "AES-256-CBC-HMAC-SHA256";

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypts `plaintext` under a password, returning the encoded `PSA1`
/// envelope.
#[must_use]
pub fn aes_encrypt(password: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let mut salt = [0u8; AES_SALT_SIZE];
    let mut iv = [0u8; CBC_IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let keys = derive_password_keys(password, &salt, PBKDF2_ITERATIONS);

    let ciphertext = Aes256CbcEnc::new((&*keys.enc).into(), (&iv).into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let hmac = hmac_sha256(&*keys.mac, &[&salt, &iv, &ciphertext]);

    AesEnvelope {
        salt,
        iv,
        hmac,
        ciphertext,
    }
    .encode()
}

/// Decrypts a `PSA1` envelope with the given password.
///
/// # Errors
///
/// Returns [`PqcError::Malformed`] for structural defects and
/// [`PqcError::AuthenticationFailure`] when the MAC does not verify
/// (wrong password or tampered ciphertext).
pub fn aes_decrypt(password: &[u8], data: &[u8]) -> Result<Vec<u8>, PqcError> {
    let envelope = AesEnvelope::decode(data)?;

    let keys = derive_password_keys(password, &envelope.salt, PBKDF2_ITERATIONS);

    let expected = hmac_sha256(
        &*keys.mac,
        &[&envelope.salt, &envelope.iv, &envelope.ciphertext],
    );
    if !ct_eq(&envelope.hmac, &expected) {
        return Err(PqcError::AuthenticationFailure);
    }

    // MAC verified; a padding failure here means the envelope was forged
    // with a valid MAC, which the key split rules out, but fail closed.
    Aes256CbcDec::new((&*keys.enc).into(), (&envelope.iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
        .map_err(|_| PqcError::AuthenticationFailure)
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}
