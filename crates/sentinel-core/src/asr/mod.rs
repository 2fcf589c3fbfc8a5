//! Agent State Record pipeline.
//!
//! Every security-relevant event becomes an [`AgentStateRecord`]: an
//! immutable, individually signed audit entry. Records are appended to a
//! durable segment log, grouped into bounded batches, and each closed
//! batch commits to its records through a Merkle root that is handed to
//! the anchor sink. Local durability never depends on the anchor
//! outcome.

mod batch;
mod log;
mod merkle;
mod metadata;
mod pipeline;
mod record;

pub use batch::{AnchorState, BatchError, BatchStore, ClosedBatch, OpenBatch};
pub use log::{LogError, SegmentLog};
pub use merkle::{merkle_proof, merkle_root, verify_proof, MerkleProof, ProofNode, ProofPosition};
pub use metadata::{Metadata, MetadataValue};
pub use pipeline::{
    AsrPipeline, BatchProof, EventDescriptor, PipelineConfig, PipelineError, RecordFilter,
};
pub use record::{
    determine_pqc_status, format_timestamp, ActionKind, AgentStateRecord, PqcStatusKind,
    ThreatLevel,
};
