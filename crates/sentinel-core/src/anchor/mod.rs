//! Anchor sink: publishing Merkle roots to a durable external ledger.
//!
//! The core treats the ledger client as pluggable. [`AnchorSink`] is
//! the contract; reference deployments point it at an EVM-compatible
//! chain (mainnet or testnet), while tests and anchorless deployments
//! use the local [`NoopAnchor`]. The [`AnchorCoordinator`] layers
//! retry, backoff, and the secondary-sink fallback on top of whatever
//! sink is configured.

mod coordinator;

pub use coordinator::{spawn_anchor_worker, AnchorCoordinator, AnchorFailure, BackoffPolicy};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Hash;

/// Failure kinds an anchor sink can report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnchorError {
    /// The ledger endpoint is unreachable. Transient.
    #[error("anchor network unavailable")]
    NetworkUnavailable,

    /// The submitting account cannot pay for the transaction. Permanent.
    #[error("insufficient funds for anchor transaction")]
    InsufficientFunds,

    /// The transaction did not confirm within its deadline. Transient.
    #[error("anchor transaction timed out")]
    TransactionTimeout,

    /// The ledger rejected the transaction outright. Permanent.
    #[error("anchor transaction rejected: {0}")]
    PermanentRejection(String),
}

impl AnchorError {
    /// Whether retrying the same submission can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkUnavailable | Self::TransactionTimeout)
    }
}

/// Receipt for a submitted root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReceipt {
    /// Ledger transaction identifier.
    pub tx_hash: String,
    /// Submission instant.
    pub submitted_at: DateTime<Utc>,
}

/// A durably confirmed submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Ledger transaction identifier.
    pub tx_hash: String,
    /// Block height of inclusion.
    pub height: u64,
    /// Confirmations observed at return time.
    pub confirmations: u64,
}

/// Ledger network selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorNetwork {
    /// Production chain (chain id 137).
    Mainnet,
    /// Test chain (chain id 80002).
    Testnet,
    /// No anchoring; batches stay local.
    None,
}

impl AnchorNetwork {
    /// EVM chain id for the network, if it anchors at all.
    #[must_use]
    pub const fn chain_id(self) -> Option<u64> {
        match self {
            Self::Mainnet => Some(137),
            Self::Testnet => Some(80_002),
            Self::None => None,
        }
    }

    /// Parses the configuration spelling.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mainnet" => Some(Self::Mainnet),
            "testnet" => Some(Self::Testnet),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Abstract ledger client accepting Merkle roots.
#[async_trait]
pub trait AnchorSink: Send + Sync {
    /// Submits a root, returning a receipt for confirmation polling.
    ///
    /// # Errors
    ///
    /// Returns [`AnchorError`] on submission failure.
    async fn submit(&self, root: Hash, batch_id: &str) -> Result<AnchorReceipt, AnchorError>;

    /// Returns the number of confirmations the receipt has accumulated.
    ///
    /// # Errors
    ///
    /// Returns [`AnchorError`] if the ledger cannot be queried.
    async fn confirmations(&self, receipt: &AnchorReceipt) -> Result<u64, AnchorError>;

    /// Waits until the receipt has at least `min` confirmations or the
    /// deadline passes.
    ///
    /// # Errors
    ///
    /// Returns [`AnchorError::TransactionTimeout`] on deadline expiry.
    async fn await_confirmation(
        &self,
        receipt: &AnchorReceipt,
        min: u64,
        timeout: StdDuration,
    ) -> Result<Confirmation, AnchorError>;
}

/// Local sink that confirms instantly. Used by tests and `none`
/// deployments that still want the batch state machine exercised.
#[derive(Debug, Default)]
pub struct NoopAnchor {
    counter: AtomicU64,
}

impl NoopAnchor {
    /// Creates the sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnchorSink for NoopAnchor {
    async fn submit(&self, root: Hash, _batch_id: &str) -> Result<AnchorReceipt, AnchorError> {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(AnchorReceipt {
            tx_hash: format!("noop-{sequence}-{}", &hex::encode(root)[..8]),
            submitted_at: Utc::now(),
        })
    }

    async fn confirmations(&self, _receipt: &AnchorReceipt) -> Result<u64, AnchorError> {
        Ok(u64::MAX)
    }

    async fn await_confirmation(
        &self,
        receipt: &AnchorReceipt,
        min: u64,
        _timeout: StdDuration,
    ) -> Result<Confirmation, AnchorError> {
        Ok(Confirmation {
            tx_hash: receipt.tx_hash.clone(),
            height: self.counter.load(Ordering::Relaxed),
            confirmations: min,
        })
    }
}
