//! The record ingestion pipeline.
//!
//! `submit` is synchronous and durable: by the time it returns, the
//! record is signed and synced to the segment log. Batching happens on
//! the same call; anchoring never does. Closed batches are handed to
//! the anchor worker over a channel, so a slow or failing sink cannot
//! block ingestion.
//!
//! Mutex poisoning indicates a panic in another thread, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::batch::{AnchorState, BatchError, BatchStore, ClosedBatch, OpenBatch};
use super::log::{LogError, SegmentLog};
use super::merkle::MerkleProof;
use super::metadata::Metadata;
use super::record::{
    format_timestamp, ActionKind, AgentStateRecord, PqcStatusKind, ThreatLevel,
};
use crate::identity::AgentId;

/// Errors produced by pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Segment log failure.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Batch store failure.
    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Description of an event to be recorded.
#[derive(Debug, Clone)]
pub struct EventDescriptor {
    /// Agent the event concerns.
    pub agent_id: AgentId,
    /// Event kind.
    pub action: ActionKind,
    /// Event severity.
    pub threat_level: ThreatLevel,
    /// Post-quantum safety classification.
    pub pqc_status: PqcStatusKind,
    /// Event-specific details.
    pub metadata: Metadata,
}

/// Filters for record retrieval.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Only records at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Only records at or before this instant.
    pub to: Option<DateTime<Utc>>,
    /// Only records at or above this severity.
    pub min_threat: Option<ThreatLevel>,
}

/// Batching thresholds.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum records per batch.
    pub batch_max: usize,
    /// Maximum age of an open batch before it closes.
    pub batch_max_age: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_max: 50,
            batch_max_age: Duration::seconds(30),
        }
    }
}

/// A record's inclusion proof together with its batch context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProof {
    /// Batch containing the record.
    pub batch_id: String,
    /// The batch's Merkle root, hex encoded.
    pub root: String,
    /// Inclusion proof for the record's signature leaf.
    pub proof: MerkleProof,
    /// Anchoring progress of the batch at lookup time.
    pub anchor_state: AnchorState,
}

struct PipelineInner {
    config: PipelineConfig,
    log: SegmentLog,
    clocks: Mutex<HashMap<AgentId, Arc<Mutex<i64>>>>,
    open: Mutex<Option<OpenBatch>>,
    batches: BatchStore,
    closed_tx: Mutex<Option<mpsc::UnboundedSender<ClosedBatch>>>,
}

/// The record ingestion pipeline. Cheap to clone; all clones share
/// state.
#[derive(Clone)]
pub struct AsrPipeline {
    inner: Arc<PipelineInner>,
}

impl AsrPipeline {
    /// Opens the pipeline over `data_dir`, creating `asr/` and
    /// `batches/` beneath it.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or batch store cannot be opened.
    pub fn open(data_dir: impl AsRef<Path>, config: PipelineConfig) -> Result<Self, PipelineError> {
        let data_dir = data_dir.as_ref();
        let log = SegmentLog::open(data_dir.join("asr"))?;
        let batches = BatchStore::open(data_dir.join("batches"))?;
        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                log,
                clocks: Mutex::new(HashMap::new()),
                open: Mutex::new(None),
                batches,
                closed_tx: Mutex::new(None),
            }),
        })
    }

    /// Ingests an event: assigns an id and a per-agent monotonic
    /// timestamp, signs the record, appends it durably, and folds it
    /// into the open batch. Returns the record id.
    ///
    /// # Errors
    ///
    /// Returns an error if the log append or batch persistence fails.
    pub fn submit(&self, event: EventDescriptor) -> Result<String, PipelineError> {
        let timestamp = self.assign_timestamp(&event.agent_id);

        let mut id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut id);
        let asr_id = format!("asr_{}", hex::encode(id));

        let record = AgentStateRecord::build(
            asr_id.clone(),
            timestamp,
            event.agent_id,
            event.action,
            event.threat_level,
            event.pqc_status,
            event.metadata,
        );

        self.inner.log.append(&record)?;

        tracing::debug!(
            asr_id = %record.asr_id,
            agent_id = %record.agent_id,
            action = %record.action,
            threat_level = record.threat_level.as_u8(),
            "recorded event"
        );

        self.fold_into_batch(record)?;
        Ok(asr_id)
    }

    /// Closes the open batch if it has exceeded its age threshold.
    /// Called periodically by the anchor worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the closed batch cannot be persisted.
    pub fn close_if_stale(&self) -> Result<Option<String>, PipelineError> {
        let now = Utc::now();
        let mut open = self.inner.open.lock().expect("open batch lock");
        let expired = open
            .as_ref()
            .is_some_and(|batch| now - batch.opened_at > self.inner.config.batch_max_age);
        if !expired {
            return Ok(None);
        }
        let batch = open.take().expect("expired batch is present");
        drop(open);
        let batch_id = batch.batch_id.clone();
        self.close_batch(batch, now)?;
        Ok(Some(batch_id))
    }

    /// Retrieves an agent's records, filtered and ordered by
    /// `(timestamp, asr_id)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub fn records_for(
        &self,
        agent_id: &AgentId,
        filter: &RecordFilter,
    ) -> Result<Vec<AgentStateRecord>, PipelineError> {
        let mut records: Vec<AgentStateRecord> = self
            .inner
            .log
            .read_all()?
            .into_iter()
            .filter(|record| record.agent_id == *agent_id)
            .filter(|record| {
                let Some(ts) = record.timestamp_parsed() else {
                    return false;
                };
                filter.from.is_none_or(|from| ts >= from)
                    && filter.to.is_none_or(|to| ts <= to)
                    && filter
                        .min_threat
                        .is_none_or(|min| record.threat_level >= min)
            })
            .collect();
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.asr_id.cmp(&b.asr_id))
        });
        Ok(records)
    }

    /// Produces the Merkle inclusion proof for a batched record.
    ///
    /// Returns `None` while the record is still in the open batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch store cannot be read.
    pub fn proof_for(&self, asr_id: &str) -> Result<Option<BatchProof>, PipelineError> {
        let Some((batch, index)) = self.inner.batches.find_record(asr_id)? else {
            return Ok(None);
        };
        let proof = batch
            .proof_for_index(index)?
            .expect("index located by find_record");
        Ok(Some(BatchProof {
            batch_id: batch.batch_id,
            root: batch.root,
            proof,
            anchor_state: batch.anchor_state,
        }))
    }

    /// Registers the anchor worker and returns the channel of closed
    /// batches. Only one worker may subscribe.
    #[must_use]
    pub fn subscribe_closed(&self) -> mpsc::UnboundedReceiver<ClosedBatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.closed_tx.lock().expect("closed channel lock") = Some(tx);
        rx
    }

    /// Rewrites the anchor state of a stored batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch does not exist.
    pub fn set_anchor_state(&self, batch_id: &str, state: AnchorState) -> Result<(), PipelineError> {
        self.inner.batches.update_state(batch_id, state)?;
        Ok(())
    }

    /// Lists all closed batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch store cannot be read.
    pub fn batches(&self) -> Result<Vec<ClosedBatch>, PipelineError> {
        Ok(self.inner.batches.list()?)
    }

    /// Total number of records ingested into the log.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.inner.log.record_count()
    }

    /// Assigns a millisecond timestamp that never regresses for the
    /// agent: if the wall clock runs backwards, the previous value plus
    /// one millisecond wins.
    fn assign_timestamp(&self, agent_id: &AgentId) -> String {
        let clock = {
            let mut clocks = self.inner.clocks.lock().expect("clock map lock");
            Arc::clone(clocks.entry(agent_id.clone()).or_default())
        };

        let mut last = clock.lock().expect("agent clock lock");
        let now_ms = Utc::now().timestamp_millis();
        let assigned = now_ms.max(*last + 1);
        *last = assigned;

        let instant = DateTime::<Utc>::from_timestamp_millis(assigned)
            .expect("assigned milliseconds are in range");
        format_timestamp(instant)
    }

    fn fold_into_batch(&self, record: AgentStateRecord) -> Result<(), PipelineError> {
        let now = Utc::now();
        let ready = {
            let mut open = self.inner.open.lock().expect("open batch lock");
            let batch = open.get_or_insert_with(|| OpenBatch::new(now));
            batch.records.push(record);

            let full = batch.records.len() >= self.inner.config.batch_max;
            let aged = now - batch.opened_at > self.inner.config.batch_max_age;
            if full || aged {
                open.take()
            } else {
                None
            }
        };

        if let Some(batch) = ready {
            self.close_batch(batch, now)?;
        }
        Ok(())
    }

    fn close_batch(&self, batch: OpenBatch, closed_at: DateTime<Utc>) -> Result<(), PipelineError> {
        let closed = batch.close(closed_at)?;
        self.inner.batches.save(&closed)?;

        tracing::info!(
            batch_id = %closed.batch_id,
            records = closed.records.len(),
            root = %closed.root,
            "closed audit batch"
        );

        let tx = self.inner.closed_tx.lock().expect("closed channel lock");
        if let Some(tx) = tx.as_ref() {
            // A dropped worker is not an ingestion failure; the batch
            // stays Pending in the store for a later worker.
            let _ = tx.send(closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn agent(n: u8) -> AgentId {
        AgentId::from_bytes(&[n; 20])
    }

    fn event(agent_id: AgentId, level: ThreatLevel) -> EventDescriptor {
        EventDescriptor {
            agent_id,
            action: ActionKind::EncryptHybrid,
            threat_level: level,
            pqc_status: PqcStatusKind::Safe,
            metadata: Metadata::new(),
        }
    }

    fn pipeline(dir: &Path, batch_max: usize) -> AsrPipeline {
        AsrPipeline::open(
            dir,
            PipelineConfig {
                batch_max,
                batch_max_age: Duration::seconds(30),
            },
        )
        .unwrap()
    }

    #[test]
    fn submit_assigns_unique_prefixed_ids() {
        let temp = TempDir::new().unwrap();
        let p = pipeline(temp.path(), 50);

        let a = p.submit(event(agent(1), ThreatLevel::Info)).unwrap();
        let b = p.submit(event(agent(1), ThreatLevel::Info)).unwrap();
        assert!(a.starts_with("asr_") && a.len() == 36);
        assert_ne!(a, b);
    }

    #[test]
    fn per_agent_timestamps_are_strictly_monotonic() {
        let temp = TempDir::new().unwrap();
        let p = pipeline(temp.path(), 500);

        for _ in 0..100 {
            p.submit(event(agent(1), ThreatLevel::Info)).unwrap();
        }
        let records = p.records_for(&agent(1), &RecordFilter::default()).unwrap();
        assert_eq!(records.len(), 100);
        for pair in records.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn batch_closes_at_capacity() {
        let temp = TempDir::new().unwrap();
        let p = pipeline(temp.path(), 5);

        for _ in 0..5 {
            p.submit(event(agent(1), ThreatLevel::Info)).unwrap();
        }
        let batches = p.batches().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 5);
        assert_eq!(batches[0].anchor_state, AnchorState::Pending);
    }

    #[test]
    fn proofs_available_once_batched() {
        let temp = TempDir::new().unwrap();
        let p = pipeline(temp.path(), 3);

        let first = p.submit(event(agent(1), ThreatLevel::Info)).unwrap();
        assert!(p.proof_for(&first).unwrap().is_none(), "still open");

        p.submit(event(agent(1), ThreatLevel::Info)).unwrap();
        p.submit(event(agent(1), ThreatLevel::Info)).unwrap();

        let proof = p.proof_for(&first).unwrap().expect("batch closed");
        assert_eq!(proof.anchor_state, AnchorState::Pending);
        assert_eq!(proof.proof.leaf_index, 0);
    }

    #[test]
    fn stale_batch_closes_without_new_records() {
        let temp = TempDir::new().unwrap();
        let p = AsrPipeline::open(
            temp.path(),
            PipelineConfig {
                batch_max: 50,
                batch_max_age: Duration::milliseconds(10),
            },
        )
        .unwrap();

        p.submit(event(agent(1), ThreatLevel::Info)).unwrap();
        assert!(p.batches().unwrap().is_empty());

        std::thread::sleep(std::time::Duration::from_millis(20));
        let closed = p.close_if_stale().unwrap();
        assert!(closed.is_some());
        assert_eq!(p.batches().unwrap().len(), 1);
    }

    #[test]
    fn filter_by_threat_level_and_time() {
        let temp = TempDir::new().unwrap();
        let p = pipeline(temp.path(), 50);

        p.submit(event(agent(1), ThreatLevel::Info)).unwrap();
        p.submit(event(agent(1), ThreatLevel::Alert)).unwrap();
        p.submit(event(agent(2), ThreatLevel::Critical)).unwrap();

        let alerts = p
            .records_for(
                &agent(1),
                &RecordFilter {
                    min_threat: Some(ThreatLevel::Alert),
                    ..RecordFilter::default()
                },
            )
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].threat_level, ThreatLevel::Alert);

        let future = p
            .records_for(
                &agent(1),
                &RecordFilter {
                    from: Some(Utc::now() + Duration::hours(1)),
                    ..RecordFilter::default()
                },
            )
            .unwrap();
        assert!(future.is_empty());
    }

    #[tokio::test]
    async fn closed_batches_reach_the_subscriber() {
        let temp = TempDir::new().unwrap();
        let p = pipeline(temp.path(), 2);
        let mut rx = p.subscribe_closed();

        p.submit(event(agent(1), ThreatLevel::Info)).unwrap();
        p.submit(event(agent(1), ThreatLevel::Info)).unwrap();

        let batch = rx.recv().await.expect("batch delivered");
        assert_eq!(batch.records.len(), 2);
    }
}
