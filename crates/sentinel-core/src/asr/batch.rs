//! Merkle batches and their on-disk store.
//!
//! A batch moves through `Open -> Closed -> Submitted -> Confirmed |
//! Failed`. Closing is the only transition that touches record data:
//! it freezes the member records, derives the leaves from their
//! signatures, and computes the root. Anchor-state transitions rewrite
//! only the batch header.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::merkle::{merkle_proof, merkle_root, MerkleProof};
use super::record::AgentStateRecord;
use crate::crypto::Hash;

/// Errors produced by batch persistence.
#[derive(Debug, Error)]
pub enum BatchError {
    /// I/O error on a batch file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Batch file could not be parsed.
    #[error("invalid batch file: {0}")]
    Invalid(#[from] serde_json::Error),

    /// No batch with this id exists.
    #[error("batch not found: {batch_id}")]
    NotFound {
        /// The missing batch id.
        batch_id: String,
    },

    /// A record signature was not valid hex.
    #[error("record {asr_id} has a non-hex signature")]
    BadLeaf {
        /// The offending record id.
        asr_id: String,
    },
}

/// Anchoring state of a closed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnchorState {
    /// Root computed, not yet handed to the sink.
    Pending,
    /// Submitted to a sink; awaiting confirmations.
    Submitted {
        /// Transaction identifier returned by the sink.
        tx_hash: String,
    },
    /// Durably confirmed on the ledger.
    Confirmed {
        /// Transaction identifier.
        tx_hash: String,
        /// Block height of inclusion.
        height: u64,
    },
    /// Anchoring failed permanently (both sinks exhausted).
    Failed {
        /// Why anchoring gave up.
        reason: String,
    },
}

/// An accumulating batch that has not yet been closed.
#[derive(Debug)]
pub struct OpenBatch {
    /// Batch identifier (`batch_` + 16 random bytes in hex).
    pub batch_id: String,
    /// Instant the first record arrived.
    pub opened_at: DateTime<Utc>,
    /// Member records in insertion order.
    pub records: Vec<AgentStateRecord>,
}

impl OpenBatch {
    /// Starts a batch at `opened_at`.
    #[must_use]
    pub fn new(opened_at: DateTime<Utc>) -> Self {
        let mut id = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut id);
        Self {
            batch_id: format!("batch_{}", hex::encode(id)),
            opened_at,
            records: Vec::new(),
        }
    }

    /// Freezes the batch: derives leaves, computes the root, and enters
    /// the `Pending` anchor state.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::BadLeaf`] if a record signature is not
    /// valid hex (which would mean the record was tampered with after
    /// signing).
    pub fn close(self, closed_at: DateTime<Utc>) -> Result<ClosedBatch, BatchError> {
        let leaves = leaves_of(&self.records)?;
        let root = merkle_root(&leaves);
        Ok(ClosedBatch {
            batch_id: self.batch_id,
            leaves: self.records.iter().map(|r| r.signature.clone()).collect(),
            root: hex::encode(root),
            opened_at: self.opened_at,
            closed_at,
            anchor_state: AnchorState::Pending,
            records: self.records,
        })
    }
}

/// A closed batch: records, leaves, root, and anchor progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedBatch {
    /// Batch identifier.
    pub batch_id: String,
    /// Member records in insertion order.
    pub records: Vec<AgentStateRecord>,
    /// Leaf hashes (the record signatures), hex encoded.
    pub leaves: Vec<String>,
    /// Merkle root, hex encoded.
    pub root: String,
    /// Instant the first record arrived.
    pub opened_at: DateTime<Utc>,
    /// Instant the batch was closed.
    pub closed_at: DateTime<Utc>,
    /// Anchoring progress.
    pub anchor_state: AnchorState,
}

impl ClosedBatch {
    /// Decodes the root to its byte form.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::BadLeaf`] if the stored root is corrupt.
    pub fn root_bytes(&self) -> Result<Hash, BatchError> {
        decode_hash(&self.root).ok_or_else(|| BatchError::BadLeaf {
            asr_id: self.batch_id.clone(),
        })
    }

    /// Builds the inclusion proof for the record at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::BadLeaf`] if a stored signature is corrupt.
    pub fn proof_for_index(&self, index: usize) -> Result<Option<MerkleProof>, BatchError> {
        let leaves = leaves_of(&self.records)?;
        Ok(merkle_proof(&leaves, index))
    }
}

fn leaves_of(records: &[AgentStateRecord]) -> Result<Vec<Hash>, BatchError> {
    records
        .iter()
        .map(|record| {
            decode_hash(&record.signature).ok_or_else(|| BatchError::BadLeaf {
                asr_id: record.asr_id.clone(),
            })
        })
        .collect()
}

fn decode_hash(hex_str: &str) -> Option<Hash> {
    let bytes = hex::decode(hex_str).ok()?;
    Hash::try_from(bytes.as_slice()).ok()
}

/// Directory-backed store of closed batches.
pub struct BatchStore {
    dir: PathBuf,
}

impl BatchStore {
    /// Opens the store in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, BatchError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Persists a closed batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch file cannot be written.
    pub fn save(&self, batch: &ClosedBatch) -> Result<(), BatchError> {
        let path = self.path_of(&batch.batch_id);
        fs::write(&path, serde_json::to_string_pretty(batch)?)?;
        Ok(())
    }

    /// Loads a batch by id.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::NotFound`] if no such batch exists.
    pub fn load(&self, batch_id: &str) -> Result<ClosedBatch, BatchError> {
        let path = self.path_of(batch_id);
        if !path.exists() {
            return Err(BatchError::NotFound {
                batch_id: batch_id.to_string(),
            });
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    /// Rewrites the anchor state of a stored batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch does not exist or cannot be
    /// rewritten.
    pub fn update_state(&self, batch_id: &str, state: AnchorState) -> Result<(), BatchError> {
        let mut batch = self.load(batch_id)?;
        batch.anchor_state = state;
        self.save(&batch)
    }

    /// Lists all stored batches ordered by close time.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned.
    pub fn list(&self) -> Result<Vec<ClosedBatch>, BatchError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                out.push(serde_json::from_str(&fs::read_to_string(&path)?)?);
            }
        }
        out.sort_by(|a: &ClosedBatch, b: &ClosedBatch| a.closed_at.cmp(&b.closed_at));
        Ok(out)
    }

    /// Finds the batch containing `asr_id`, with the record's index.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned.
    pub fn find_record(&self, asr_id: &str) -> Result<Option<(ClosedBatch, usize)>, BatchError> {
        for batch in self.list()? {
            if let Some(index) = batch.records.iter().position(|r| r.asr_id == asr_id) {
                return Ok(Some((batch, index)));
            }
        }
        Ok(None)
    }

    fn path_of(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("{batch_id}.json"))
    }
}
