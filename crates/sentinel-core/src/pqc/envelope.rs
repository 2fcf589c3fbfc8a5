//! Binary ciphertext envelopes.
//!
//! Both envelopes are length-prefixed, big-endian, and self-describing:
//! a four-byte magic, then fixed and length-prefixed fields. Decoding is
//! strict - trailing bytes, truncation, and unknown algorithm bytes are
//! all rejected.

use thiserror::Error;

use crate::crypto::KemAlgorithm;

/// Magic bytes for the hybrid envelope.
pub const HYBRID_MAGIC: [u8; 4] = *b"PSH1";

/// Magic bytes for the AES-only envelope.
pub const AES_MAGIC: [u8; 4] = *b"PSA1";

/// AES-GCM nonce size in bytes.
pub const GCM_NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes.
pub const GCM_TAG_SIZE: usize = 16;

/// AES-CBC initialization vector size in bytes.
pub const CBC_IV_SIZE: usize = 16;

/// Salt size for the password-derived envelope.
pub const AES_SALT_SIZE: usize = 16;

/// HMAC-SHA256 tag size in bytes.
pub const HMAC_SIZE: usize = 32;

/// Errors produced while decoding an envelope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The input is shorter than the fixed header.
    #[error("envelope truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required to continue decoding.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// The magic bytes do not match the expected format.
    #[error("bad envelope magic")]
    BadMagic,

    /// The algorithm byte is not a known cipher suite.
    #[error("unknown algorithm byte: {byte:#04x}")]
    UnknownAlgorithm {
        /// The offending byte.
        byte: u8,
    },

    /// Input remained after the declared fields were consumed.
    #[error("trailing bytes after envelope body")]
    TrailingBytes,

    /// The AEAD body is too short to contain an authentication tag.
    #[error("ciphertext shorter than authentication tag")]
    MissingTag,
}

/// Hybrid ciphertext envelope (`PSH1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridEnvelope {
    /// KEM parameter set used for the encapsulation.
    pub algorithm: KemAlgorithm,
    /// KEM ciphertext.
    pub kem_ciphertext: Vec<u8>,
    /// AES-GCM nonce.
    pub nonce: [u8; GCM_NONCE_SIZE],
    /// AES-GCM ciphertext including the 16-byte tag.
    pub aead_ciphertext: Vec<u8>,
}

impl HybridEnvelope {
    /// Serializes the envelope to its wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + 1 + 2 + self.kem_ciphertext.len() + GCM_NONCE_SIZE + 4 + self.aead_ciphertext.len(),
        );
        out.extend_from_slice(&HYBRID_MAGIC);
        out.push(self.algorithm.wire_byte());
        let kem_len =
            u16::try_from(self.kem_ciphertext.len()).expect("KEM ciphertexts fit in a u16 prefix");
        out.extend_from_slice(&kem_len.to_be_bytes());
        out.extend_from_slice(&self.kem_ciphertext);
        out.extend_from_slice(&self.nonce);
        let aead_len =
            u32::try_from(self.aead_ciphertext.len()).expect("AEAD body fits in a u32 prefix");
        out.extend_from_slice(&aead_len.to_be_bytes());
        out.extend_from_slice(&self.aead_ciphertext);
        out
    }

    /// Parses an envelope from its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] on any structural defect.
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let mut cursor = Cursor::new(data);

        let magic = cursor.take(4)?;
        if magic != HYBRID_MAGIC {
            return Err(EnvelopeError::BadMagic);
        }

        let byte = cursor.take(1)?[0];
        let algorithm =
            KemAlgorithm::from_wire_byte(byte).ok_or(EnvelopeError::UnknownAlgorithm { byte })?;

        let kem_len = u16::from_be_bytes(
            cursor.take(2)?.try_into().expect("slice length checked"),
        ) as usize;
        let kem_ciphertext = cursor.take(kem_len)?.to_vec();

        let mut nonce = [0u8; GCM_NONCE_SIZE];
        nonce.copy_from_slice(cursor.take(GCM_NONCE_SIZE)?);

        let aead_len = u32::from_be_bytes(
            cursor.take(4)?.try_into().expect("slice length checked"),
        ) as usize;
        let aead_ciphertext = cursor.take(aead_len)?.to_vec();

        if aead_ciphertext.len() < GCM_TAG_SIZE {
            return Err(EnvelopeError::MissingTag);
        }
        cursor.finish()?;

        Ok(Self {
            algorithm,
            kem_ciphertext,
            nonce,
            aead_ciphertext,
        })
    }
}

/// AES-only ciphertext envelope (`PSA1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesEnvelope {
    /// PBKDF2 salt.
    pub salt: [u8; AES_SALT_SIZE],
    /// CBC initialization vector.
    pub iv: [u8; CBC_IV_SIZE],
    /// HMAC-SHA256 tag over `salt || iv || ciphertext`.
    pub hmac: [u8; HMAC_SIZE],
    /// AES-256-CBC ciphertext (PKCS#7 padded).
    pub ciphertext: Vec<u8>,
}

impl AesEnvelope {
    /// Serializes the envelope to its wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + AES_SALT_SIZE + CBC_IV_SIZE + HMAC_SIZE + 4 + self.ciphertext.len(),
        );
        out.extend_from_slice(&AES_MAGIC);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.hmac);
        let ct_len =
            u32::try_from(self.ciphertext.len()).expect("ciphertext fits in a u32 prefix");
        out.extend_from_slice(&ct_len.to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parses an envelope from its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] on any structural defect.
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let mut cursor = Cursor::new(data);

        let magic = cursor.take(4)?;
        if magic != AES_MAGIC {
            return Err(EnvelopeError::BadMagic);
        }

        let mut salt = [0u8; AES_SALT_SIZE];
        salt.copy_from_slice(cursor.take(AES_SALT_SIZE)?);

        let mut iv = [0u8; CBC_IV_SIZE];
        iv.copy_from_slice(cursor.take(CBC_IV_SIZE)?);

        let mut hmac = [0u8; HMAC_SIZE];
        hmac.copy_from_slice(cursor.take(HMAC_SIZE)?);

        let ct_len = u32::from_be_bytes(
            cursor.take(4)?.try_into().expect("slice length checked"),
        ) as usize;
        let ciphertext = cursor.take(ct_len)?.to_vec();
        cursor.finish()?;

        Ok(Self {
            salt,
            iv,
            hmac,
            ciphertext,
        })
    }
}

/// Bounds-checked reader over an input slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.pos.checked_add(len).ok_or(EnvelopeError::Truncated {
            need: len,
            have: self.data.len() - self.pos,
        })?;
        if end > self.data.len() {
            return Err(EnvelopeError::Truncated {
                need: len,
                have: self.data.len() - self.pos,
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn finish(&self) -> Result<(), EnvelopeError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(EnvelopeError::TrailingBytes)
        }
    }
}
