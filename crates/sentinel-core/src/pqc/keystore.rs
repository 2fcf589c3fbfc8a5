//! Sealed keypair storage.
//!
//! Mutex poisoning indicates a panic in another thread, which is unrecoverable.
//!
//! Secret material never touches disk in the clear: decapsulation keys
//! are sealed under a key-encryption key derived from the store
//! passphrase, and live in memory only inside [`SecretHandle`], which
//! zeroizes on drop and cannot be serialized. The store is append-only
//! with copy-on-rotate semantics - rotation writes a fresh keypair and
//! flips the predecessor's `stale` flag without touching its sealed
//! bytes.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{self, sha256, KemAlgorithm};
use crate::identity::AgentId;

/// Length of the key id in hex characters (16 bytes of the public-key
/// hash).
pub const KEY_ID_LEN: usize = 32;

/// PBKDF2 iterations for the key-encryption key.
const KEK_ITERATIONS: u32 = 600_000;

/// Filename of the store-level KEK salt.
const KEK_SALT_FILE: &str = "kek.salt";

/// Errors that can occur during key store operations.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// I/O error during key file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key not found in storage.
    #[error("key not found: {key_id}")]
    KeyNotFound {
        /// The key id that was not found.
        key_id: String,
    },

    /// Metadata could not be parsed.
    #[error("invalid key metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),

    /// Sealed secret could not be opened (wrong passphrase or corrupt
    /// file).
    #[error("failed to unseal key {key_id}")]
    UnsealFailure {
        /// The key id whose sealed file failed to open.
        key_id: String,
    },

    /// Insecure file permissions detected.
    #[error("insecure permissions on key file: {path}")]
    InsecurePermissions {
        /// The path with insecure permissions.
        path: String,
    },
}

/// Metadata describing a stored keypair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Content-derived key identifier.
    pub key_id: String,

    /// KEM parameter set of the keypair.
    pub algorithm: KemAlgorithm,

    /// Agent that owns this keypair.
    pub owner: AgentId,

    /// Creation instant.
    pub created_at: DateTime<Utc>,

    /// Instant the key was rotated out, if any.
    pub rotated_at: Option<DateTime<Utc>>,

    /// Whether the key has been rotated out of service.
    pub stale: bool,
}

/// A stored keypair: metadata plus the public encapsulation key.
#[derive(Debug, Clone)]
pub struct StoredKey {
    /// Keypair metadata.
    pub metadata: KeyMetadata,

    /// Public encapsulation key bytes.
    pub public: Vec<u8>,
}

/// A handle to unsealed secret material.
///
/// The decapsulation key is wiped when the handle drops. The handle is
/// deliberately not serializable and its `Debug` form redacts the key.
pub struct SecretHandle {
    /// Metadata of the keypair this secret belongs to.
    pub metadata: KeyMetadata,

    secret: Zeroizing<Vec<u8>>,
}

impl SecretHandle {
    /// Returns the raw decapsulation key bytes.
    ///
    /// Only the decryption path calls this; the bytes must not be copied
    /// out of the returned borrow.
    #[must_use]
    pub fn decap_key(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretHandle")
            .field("key_id", &self.metadata.key_id)
            .field("algorithm", &self.metadata.algorithm)
            .field("secret", &"<sealed>")
            .finish()
    }
}

/// Computes the content-derived key id for a public key.
#[must_use]
pub fn key_id_for(public: &[u8]) -> String {
    hex::encode(&sha256(public)[..KEY_ID_LEN / 2])
}

/// Storage for ML-KEM keypairs with sealed secrets.
pub struct KeyStore {
    storage: Storage,
}

enum Storage {
    /// In-memory storage for testing.
    Memory(RwLock<HashMap<String, MemoryEntry>>),

    /// Directory-backed storage with sealed secrets.
    Dir {
        keys_dir: PathBuf,
        kek: Zeroizing<[u8; 32]>,
    },
}

struct MemoryEntry {
    metadata: KeyMetadata,
    public: Vec<u8>,
    secret: Zeroizing<Vec<u8>>,
}

impl KeyStore {
    /// Creates an in-memory key store for testing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            storage: Storage::Memory(RwLock::new(HashMap::new())),
        }
    }

    /// Opens (or initializes) a directory-backed key store.
    ///
    /// The directory is created with mode 0700; key files are written
    /// with mode 0600 and both are verified on every access.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be prepared or carries
    /// group/world permissions.
    pub fn open(keys_dir: impl AsRef<Path>, passphrase: &str) -> Result<Self, KeyStoreError> {
        let keys_dir = keys_dir.as_ref().to_path_buf();

        if !keys_dir.exists() {
            fs::create_dir_all(&keys_dir)?;
            fs::set_permissions(&keys_dir, fs::Permissions::from_mode(0o700))?;
        }
        check_private(&keys_dir)?;

        let salt = load_or_create_salt(&keys_dir)?;
        let keys = crypto::derive_password_keys(passphrase.as_bytes(), &salt, KEK_ITERATIONS);
        let mut kek = Zeroizing::new([0u8; 32]);
        kek.copy_from_slice(&*keys.enc);

        Ok(Self {
            storage: Storage::Dir { keys_dir, kek },
        })
    }

    /// Generates a new keypair owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sealed secret cannot be persisted.
    pub fn generate(
        &self,
        owner: &AgentId,
        algorithm: KemAlgorithm,
    ) -> Result<StoredKey, KeyStoreError> {
        let (public, secret) = crypto::generate(algorithm);
        let metadata = KeyMetadata {
            key_id: key_id_for(&public),
            algorithm,
            owner: owner.clone(),
            created_at: Utc::now(),
            rotated_at: None,
            stale: false,
        };
        self.insert(metadata.clone(), public.clone(), secret)?;
        Ok(StoredKey { metadata, public })
    }

    /// Retrieves the metadata and public key for `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::KeyNotFound`] if the key does not exist.
    pub fn get(&self, key_id: &str) -> Result<StoredKey, KeyStoreError> {
        match &self.storage {
            Storage::Memory(map) => {
                let map = map.read().unwrap();
                map.get(key_id)
                    .map(|entry| StoredKey {
                        metadata: entry.metadata.clone(),
                        public: entry.public.clone(),
                    })
                    .ok_or_else(|| KeyStoreError::KeyNotFound {
                        key_id: key_id.to_string(),
                    })
            },
            Storage::Dir { keys_dir, .. } => {
                let metadata = read_metadata(keys_dir, key_id)?;
                let public = fs::read(keys_dir.join(format!("{key_id}.pub")))?;
                Ok(StoredKey { metadata, public })
            },
        }
    }

    /// Unseals the secret material for `key_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key does not exist or the sealed file
    /// cannot be opened with the store's KEK.
    pub fn secret(&self, key_id: &str) -> Result<SecretHandle, KeyStoreError> {
        match &self.storage {
            Storage::Memory(map) => {
                let map = map.read().unwrap();
                let entry = map.get(key_id).ok_or_else(|| KeyStoreError::KeyNotFound {
                    key_id: key_id.to_string(),
                })?;
                Ok(SecretHandle {
                    metadata: entry.metadata.clone(),
                    secret: entry.secret.clone(),
                })
            },
            Storage::Dir { keys_dir, kek } => {
                let metadata = read_metadata(keys_dir, key_id)?;
                let sealed_path = keys_dir.join(format!("{key_id}.key"));
                check_private(&sealed_path)?;

                let mut file = File::open(&sealed_path)?;
                let mut sealed = Vec::new();
                file.read_to_end(&mut sealed)?;

                let secret = unseal(kek, key_id, &sealed)?;
                Ok(SecretHandle { metadata, secret })
            },
        }
    }

    /// Rotates `key_id`: generates a fresh keypair of the same level for
    /// the same owner and marks the predecessor stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the key does not exist or persistence fails.
    pub fn rotate(&self, key_id: &str) -> Result<StoredKey, KeyStoreError> {
        let prior = self.get(key_id)?;
        let replacement = self.generate(&prior.metadata.owner, prior.metadata.algorithm)?;
        self.mark_stale(key_id)?;

        tracing::info!(
            old_key_id = %key_id,
            new_key_id = %replacement.metadata.key_id,
            algorithm = %prior.metadata.algorithm,
            "rotated keypair"
        );
        Ok(replacement)
    }

    /// Reassigns every keypair owned by `from` to `to`, returning the
    /// number of keys moved.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata cannot be rewritten.
    pub fn reassign_owner(&self, from: &AgentId, to: &AgentId) -> Result<usize, KeyStoreError> {
        match &self.storage {
            Storage::Memory(map) => {
                let mut map = map.write().unwrap();
                let mut moved = 0;
                for entry in map.values_mut() {
                    if entry.metadata.owner == *from {
                        entry.metadata.owner = to.clone();
                        moved += 1;
                    }
                }
                Ok(moved)
            },
            Storage::Dir { keys_dir, .. } => {
                let mut moved = 0;
                for metadata in list_metadata(keys_dir)? {
                    if metadata.owner == *from {
                        let mut updated = metadata;
                        updated.owner = to.clone();
                        write_metadata(keys_dir, &updated)?;
                        moved += 1;
                    }
                }
                Ok(moved)
            },
        }
    }

    /// Lists metadata for all keys, optionally filtered by owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list(&self, owner: Option<&AgentId>) -> Result<Vec<KeyMetadata>, KeyStoreError> {
        let mut all = match &self.storage {
            Storage::Memory(map) => {
                let map = map.read().unwrap();
                map.values().map(|entry| entry.metadata.clone()).collect()
            },
            Storage::Dir { keys_dir, .. } => list_metadata(keys_dir)?,
        };
        if let Some(owner) = owner {
            all.retain(|metadata| metadata.owner == *owner);
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    fn insert(
        &self,
        metadata: KeyMetadata,
        public: Vec<u8>,
        secret: Zeroizing<Vec<u8>>,
    ) -> Result<(), KeyStoreError> {
        match &self.storage {
            Storage::Memory(map) => {
                let mut map = map.write().unwrap();
                map.insert(
                    metadata.key_id.clone(),
                    MemoryEntry {
                        metadata,
                        public,
                        secret,
                    },
                );
                Ok(())
            },
            Storage::Dir { keys_dir, kek } => {
                let key_id = metadata.key_id.clone();
                let sealed = seal(kek, &key_id, &secret);

                write_private(&keys_dir.join(format!("{key_id}.key")), &sealed)?;
                fs::write(keys_dir.join(format!("{key_id}.pub")), &public)?;
                write_metadata(keys_dir, &metadata)?;
                Ok(())
            },
        }
    }

    fn mark_stale(&self, key_id: &str) -> Result<(), KeyStoreError> {
        let now = Utc::now();
        match &self.storage {
            Storage::Memory(map) => {
                let mut map = map.write().unwrap();
                let entry = map
                    .get_mut(key_id)
                    .ok_or_else(|| KeyStoreError::KeyNotFound {
                        key_id: key_id.to_string(),
                    })?;
                entry.metadata.stale = true;
                entry.metadata.rotated_at = Some(now);
                Ok(())
            },
            Storage::Dir { keys_dir, .. } => {
                let mut metadata = read_metadata(keys_dir, key_id)?;
                metadata.stale = true;
                metadata.rotated_at = Some(now);
                write_metadata(keys_dir, &metadata)
            },
        }
    }
}

fn load_or_create_salt(keys_dir: &Path) -> Result<[u8; 16], KeyStoreError> {
    let path = keys_dir.join(KEK_SALT_FILE);
    let mut salt = [0u8; 16];
    if path.exists() {
        let mut file = File::open(&path)?;
        file.read_exact(&mut salt)?;
    } else {
        rand::rngs::OsRng.fill_bytes(&mut salt);
        write_private(&path, &salt)?;
    }
    Ok(salt)
}

fn seal(kek: &[u8; 32], key_id: &str, secret: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek));
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    // AAD binds the sealed blob to its key id, so files cannot be
    // swapped between ids.
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: secret,
                aad: key_id.as_bytes(),
            },
        )
        .expect("AES-GCM sealing is infallible for in-memory buffers");

    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

fn unseal(kek: &[u8; 32], key_id: &str, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyStoreError> {
    if sealed.len() < 12 {
        return Err(KeyStoreError::UnsealFailure {
            key_id: key_id.to_string(),
        });
    }
    let (nonce, ciphertext) = sealed.split_at(12);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: key_id.as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| KeyStoreError::UnsealFailure {
            key_id: key_id.to_string(),
        })
}

fn metadata_path(keys_dir: &Path, key_id: &str) -> PathBuf {
    keys_dir.join(format!("{key_id}.meta.json"))
}

fn read_metadata(keys_dir: &Path, key_id: &str) -> Result<KeyMetadata, KeyStoreError> {
    let path = metadata_path(keys_dir, key_id);
    if !path.exists() {
        return Err(KeyStoreError::KeyNotFound {
            key_id: key_id.to_string(),
        });
    }
    let data = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&data)?)
}

fn write_metadata(keys_dir: &Path, metadata: &KeyMetadata) -> Result<(), KeyStoreError> {
    let data = serde_json::to_string_pretty(metadata)?;
    fs::write(metadata_path(keys_dir, &metadata.key_id), data)?;
    Ok(())
}

fn list_metadata(keys_dir: &Path) -> Result<Vec<KeyMetadata>, KeyStoreError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(keys_dir)? {
        let path = entry?.path();
        if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".meta.json"))
        {
            let data = fs::read_to_string(&path)?;
            out.push(serde_json::from_str(&data)?);
        }
    }
    Ok(out)
}

fn write_private(path: &Path, data: &[u8]) -> Result<(), KeyStoreError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

fn check_private(path: &Path) -> Result<(), KeyStoreError> {
    let metadata = fs::metadata(path)?;
    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(KeyStoreError::InsecurePermissions {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn owner() -> AgentId {
        AgentId::parse("0x00a329c0648769a73afac7f9381e08fb43dbea72").unwrap()
    }

    #[test]
    fn in_memory_generate_and_fetch() {
        let store = KeyStore::in_memory();
        let stored = store.generate(&owner(), KemAlgorithm::MlKem768).unwrap();

        assert_eq!(stored.metadata.key_id.len(), KEY_ID_LEN);
        assert_eq!(stored.metadata.key_id, key_id_for(&stored.public));

        let fetched = store.get(&stored.metadata.key_id).unwrap();
        assert_eq!(fetched.public, stored.public);

        let handle = store.secret(&stored.metadata.key_id).unwrap();
        assert_eq!(
            handle.decap_key().len(),
            KemAlgorithm::MlKem768.decap_key_size()
        );
    }

    #[test]
    fn in_memory_not_found() {
        let store = KeyStore::in_memory();
        assert!(matches!(
            store.get("deadbeef"),
            Err(KeyStoreError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn rotation_marks_prior_stale() {
        let store = KeyStore::in_memory();
        let original = store.generate(&owner(), KemAlgorithm::MlKem768).unwrap();
        let replacement = store.rotate(&original.metadata.key_id).unwrap();

        assert_ne!(original.metadata.key_id, replacement.metadata.key_id);
        assert_eq!(replacement.metadata.algorithm, KemAlgorithm::MlKem768);
        assert!(!replacement.metadata.stale);

        let prior = store.get(&original.metadata.key_id).unwrap();
        assert!(prior.metadata.stale);
        assert!(prior.metadata.rotated_at.is_some());
    }

    #[test]
    fn file_store_round_trips_sealed_secret() {
        let temp = TempDir::new().unwrap();
        let store = KeyStore::open(temp.path().join("keys"), "passphrase").unwrap();
        let stored = store.generate(&owner(), KemAlgorithm::MlKem768).unwrap();

        let handle = store.secret(&stored.metadata.key_id).unwrap();
        assert_eq!(
            handle.decap_key().len(),
            KemAlgorithm::MlKem768.decap_key_size()
        );

        // Key file must be 0600.
        let key_path = temp
            .path()
            .join("keys")
            .join(format!("{}.key", stored.metadata.key_id));
        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn wrong_passphrase_fails_unseal() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("keys");
        let key_id = {
            let store = KeyStore::open(&dir, "right").unwrap();
            store
                .generate(&owner(), KemAlgorithm::MlKem768)
                .unwrap()
                .metadata
                .key_id
        };

        let reopened = KeyStore::open(&dir, "wrong").unwrap();
        assert!(matches!(
            reopened.secret(&key_id),
            Err(KeyStoreError::UnsealFailure { .. })
        ));
    }

    #[test]
    fn reassign_owner_moves_all_keys() {
        let store = KeyStore::in_memory();
        let heir = AgentId::parse("0x1111111111111111111111111111111111111111").unwrap();

        store.generate(&owner(), KemAlgorithm::MlKem768).unwrap();
        store.generate(&owner(), KemAlgorithm::MlKem1024).unwrap();
        store.generate(&heir, KemAlgorithm::MlKem768).unwrap();

        let moved = store.reassign_owner(&owner(), &heir).unwrap();
        assert_eq!(moved, 2);
        assert_eq!(store.list(Some(&heir)).unwrap().len(), 3);
        assert!(store.list(Some(&owner())).unwrap().is_empty());
    }

    #[test]
    fn debug_redacts_secret() {
        let store = KeyStore::in_memory();
        let stored = store.generate(&owner(), KemAlgorithm::MlKem768).unwrap();
        let handle = store.secret(&stored.metadata.key_id).unwrap();
        let debug = format!("{handle:?}");
        assert!(debug.contains("<sealed>"));
        assert!(!debug.contains("secret: ["));
    }
}
