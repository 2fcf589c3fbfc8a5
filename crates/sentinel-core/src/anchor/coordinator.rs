//! Retry, fallback, and the background anchor worker.
//!
//! Submission retries transient failures with exponential backoff; a
//! sink that fails permanently (or exhausts its retries) hands the
//! batch to the secondary sink. Only when both sinks are exhausted is
//! the batch marked failed - and even then its records stay fully
//! queryable locally.
//!
//! Mutex poisoning indicates a panic in another thread, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use thiserror::Error;

use super::{AnchorError, AnchorReceipt, AnchorSink, Confirmation};
use crate::asr::{
    ActionKind, AnchorState, AsrPipeline, EventDescriptor, Metadata, PqcStatusKind, ThreatLevel,
};
use crate::crypto::Hash;
use crate::identity::AgentId;

/// Exponential backoff for transient anchor failures.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: StdDuration,
    /// Attempts per sink, including the first.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: StdDuration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> StdDuration {
        self.base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Terminal anchoring failure: both sinks exhausted.
#[derive(Debug, Clone, Error)]
#[error("anchoring failed: {reason}")]
pub struct AnchorFailure {
    /// Combined failure description.
    pub reason: String,
}

/// Drives a primary sink with retry and an optional secondary
/// fallback.
pub struct AnchorCoordinator {
    primary: Arc<dyn AnchorSink>,
    secondary: Option<Arc<dyn AnchorSink>>,
    backoff: BackoffPolicy,
    min_confirmations: u64,
    confirm_timeout: StdDuration,
    fallback_batches: Mutex<Vec<String>>,
}

impl AnchorCoordinator {
    /// Creates a coordinator over the given sinks.
    #[must_use]
    pub fn new(
        primary: Arc<dyn AnchorSink>,
        secondary: Option<Arc<dyn AnchorSink>>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            primary,
            secondary,
            backoff,
            min_confirmations: 2,
            confirm_timeout: StdDuration::from_secs(120),
            fallback_batches: Mutex::new(Vec::new()),
        }
    }

    /// Batch ids that were routed through the secondary sink.
    #[must_use]
    pub fn fallback_batches(&self) -> Vec<String> {
        self.fallback_batches.lock().expect("fallback list lock").clone()
    }

    /// Anchors a root: submit (with retry and fallback), then wait for
    /// confirmations. `on_submitted` fires as soon as a sink accepts
    /// the submission.
    ///
    /// # Errors
    ///
    /// Returns [`AnchorFailure`] when both sinks are exhausted.
    pub async fn anchor(
        &self,
        root: Hash,
        batch_id: &str,
        on_submitted: impl FnOnce(&AnchorReceipt) + Send,
    ) -> Result<Confirmation, AnchorFailure> {
        let (sink, receipt, via_fallback) = self.submit_somewhere(root, batch_id).await?;
        if via_fallback {
            self.fallback_batches
                .lock()
                .expect("fallback list lock")
                .push(batch_id.to_string());
        }
        on_submitted(&receipt);

        sink.await_confirmation(&receipt, self.min_confirmations, self.confirm_timeout)
            .await
            .map_err(|error| AnchorFailure {
                reason: format!("confirmation failed for {}: {error}", receipt.tx_hash),
            })
    }

    async fn submit_somewhere(
        &self,
        root: Hash,
        batch_id: &str,
    ) -> Result<(Arc<dyn AnchorSink>, AnchorReceipt, bool), AnchorFailure> {
        let primary_error = match self.submit_with_retry(&self.primary, root, batch_id).await {
            Ok(receipt) => return Ok((Arc::clone(&self.primary), receipt, false)),
            Err(error) => error,
        };

        let Some(secondary) = &self.secondary else {
            return Err(AnchorFailure {
                reason: format!("primary sink failed: {primary_error}; no secondary configured"),
            });
        };

        tracing::warn!(
            batch_id = %batch_id,
            error = %primary_error,
            "primary anchor sink failed, routing through secondary"
        );

        match self.submit_with_retry(secondary, root, batch_id).await {
            Ok(receipt) => Ok((Arc::clone(secondary), receipt, true)),
            Err(secondary_error) => Err(AnchorFailure {
                reason: format!(
                    "primary sink failed: {primary_error}; secondary sink failed: {secondary_error}"
                ),
            }),
        }
    }

    async fn submit_with_retry(
        &self,
        sink: &Arc<dyn AnchorSink>,
        root: Hash,
        batch_id: &str,
    ) -> Result<AnchorReceipt, AnchorError> {
        let mut attempt = 1;
        loop {
            match sink.submit(root, batch_id).await {
                Ok(receipt) => return Ok(receipt),
                Err(error) if error.is_transient() && attempt < self.backoff.max_attempts => {
                    let delay = self.backoff.delay_for(attempt);
                    tracing::debug!(
                        batch_id = %batch_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "anchor submission retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(error) => return Err(error),
            }
        }
    }
}

/// Identity used for administrative audit records.
fn system_agent() -> AgentId {
    AgentId::from_bytes(&[0u8; 20])
}

/// Spawns the background worker: receives closed batches from the
/// pipeline, drives the coordinator, updates batch state, and closes
/// stale batches on a timer. Anchor failures never block ingestion.
pub fn spawn_anchor_worker(
    pipeline: AsrPipeline,
    coordinator: Arc<AnchorCoordinator>,
) -> tokio::task::JoinHandle<()> {
    let mut closed = pipeline.subscribe_closed();

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(StdDuration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                batch = closed.recv() => {
                    let Some(batch) = batch else {
                        // Pipeline dropped; nothing more will arrive.
                        return;
                    };
                    anchor_one(&pipeline, &coordinator, batch).await;
                },
                _ = tick.tick() => {
                    if let Err(error) = pipeline.close_if_stale() {
                        tracing::error!(error = %error, "failed to close stale batch");
                    }
                },
            }
        }
    })
}

async fn anchor_one(
    pipeline: &AsrPipeline,
    coordinator: &AnchorCoordinator,
    batch: crate::asr::ClosedBatch,
) {
    let Ok(root) = batch.root_bytes() else {
        tracing::error!(batch_id = %batch.batch_id, "batch has a corrupt root, skipping anchor");
        return;
    };

    let batch_id = batch.batch_id.clone();
    let result = coordinator
        .anchor(root, &batch_id, |receipt| {
            if let Err(error) = pipeline.set_anchor_state(
                &batch_id,
                AnchorState::Submitted {
                    tx_hash: receipt.tx_hash.clone(),
                },
            ) {
                tracing::error!(batch_id = %batch_id, error = %error, "failed to record submission");
            }
        })
        .await;

    match result {
        Ok(confirmation) => {
            tracing::info!(
                batch_id = %batch_id,
                tx_hash = %confirmation.tx_hash,
                height = confirmation.height,
                "anchored audit batch"
            );
            if let Err(error) = pipeline.set_anchor_state(
                &batch_id,
                AnchorState::Confirmed {
                    tx_hash: confirmation.tx_hash,
                    height: confirmation.height,
                },
            ) {
                tracing::error!(batch_id = %batch_id, error = %error, "failed to record confirmation");
            }
        },
        Err(failure) => {
            tracing::error!(batch_id = %batch_id, reason = %failure.reason, "anchoring failed");
            if let Err(error) = pipeline.set_anchor_state(
                &batch_id,
                AnchorState::Failed {
                    reason: failure.reason.clone(),
                },
            ) {
                tracing::error!(batch_id = %batch_id, error = %error, "failed to record anchor failure");
            }

            // Administrative record; deliberately strike-free.
            let mut metadata = Metadata::new();
            metadata.insert(
                "rule".into(),
                crate::governance::RuleCode::Rc302.to_string().into(),
            );
            metadata.insert("batch_id".into(), batch_id.clone().into());
            metadata.insert("reason".into(), failure.reason.into());
            let event = EventDescriptor {
                agent_id: system_agent(),
                action: ActionKind::AnchorFailed,
                threat_level: ThreatLevel::Warning,
                pqc_status: PqcStatusKind::Safe,
                metadata,
            };
            if let Err(error) = pipeline.submit(event) {
                tracing::error!(error = %error, "failed to record anchor failure event");
            }
        },
    }
}
