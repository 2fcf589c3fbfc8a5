//! Continuous threat scoring.
//!
//! Each agent carries a sliding window (default 24 h) of
//! security-relevant events. The Points Toward Threat Score is
//! recomputed from the surviving window on demand:
//!
//! `PTS = 50·quantum_risk + 0.3·violations + 0.2·rate_hits + 0.1·sig_failures`
//!
//! clamped to `[0, 1000]`. Tier boundaries are fixed: below 50 is
//! `Safe`, below 150 is `Caution`, everything else is `Critical`. The
//! engine is the single source of truth for tier queries from access
//! control, and it reports tier transitions exactly once so the caller
//! can audit them.
//!
//! Mutex poisoning indicates a panic in another thread, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::AgentId;

/// Per-event multiplier for operations performed with non-PQC
/// algorithms.
pub const QUANTUM_RISK_MULTIPLIER: f64 = 50.0;

/// Weight per access violation.
pub const ACCESS_VIOLATION_WEIGHT: f64 = 0.3;

/// Weight per rate-limit hit.
pub const RATE_LIMIT_WEIGHT: f64 = 0.2;

/// Weight per signature failure.
pub const SIGNATURE_FAILURE_WEIGHT: f64 = 0.1;

/// Upper clamp of the score.
pub const PTS_MAX: f64 = 1000.0;

/// Scores below this are `Safe`.
pub const TIER_SAFE_MAX: f64 = 50.0;

/// Scores below this (and at or above [`TIER_SAFE_MAX`]) are `Caution`.
pub const TIER_CAUTION_MAX: f64 = 150.0;

/// The kinds of events the score is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatFactor {
    /// Operation performed with a non-quantum-resistant algorithm.
    QuantumRisk,
    /// Denied operation.
    AccessViolation,
    /// Request rejected by the per-minute quota.
    RateLimitHit,
    /// Signature or token verification failure.
    SignatureFailure,
}

/// Rolling counts inside the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorCounts {
    /// Non-PQC operations.
    pub quantum_risk: u64,
    /// Denied operations.
    pub access_violations: u64,
    /// Quota rejections.
    pub rate_limit_hits: u64,
    /// Verification failures.
    pub signature_failures: u64,
}

/// Threat tier derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtsTier {
    /// `PTS < 50`.
    Safe,
    /// `50 <= PTS < 150`.
    Caution,
    /// `PTS >= 150`.
    Critical,
}

impl PtsTier {
    /// Maps a score to its tier.
    #[must_use]
    pub fn of(score: f64) -> Self {
        if score < TIER_SAFE_MAX {
            Self::Safe
        } else if score < TIER_CAUTION_MAX {
            Self::Caution
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for PtsTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => f.write_str("safe"),
            Self::Caution => f.write_str("caution"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

/// A computed score with its inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtsScore {
    /// Clamped total.
    pub total: f64,
    /// Tier the total falls in.
    pub tier: PtsTier,
    /// Window counts the total was computed from.
    pub factors: FactorCounts,
}

/// A tier transition observed while recording an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierChange {
    /// Tier before the event.
    pub from: PtsTier,
    /// Tier after the event.
    pub to: PtsTier,
}

struct AgentWindow {
    events: VecDeque<(DateTime<Utc>, ThreatFactor)>,
    last_tier: PtsTier,
}

impl AgentWindow {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            last_tier: PtsTier::Safe,
        }
    }

    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self
            .events
            .front()
            .is_some_and(|(at, _)| *at < cutoff)
        {
            self.events.pop_front();
        }
    }

    fn counts(&self) -> FactorCounts {
        let mut counts = FactorCounts::default();
        for (_, factor) in &self.events {
            match factor {
                ThreatFactor::QuantumRisk => counts.quantum_risk += 1,
                ThreatFactor::AccessViolation => counts.access_violations += 1,
                ThreatFactor::RateLimitHit => counts.rate_limit_hits += 1,
                ThreatFactor::SignatureFailure => counts.signature_failures += 1,
            }
        }
        counts
    }
}

/// Sliding-window threat engine.
pub struct ThreatEngine {
    window: Duration,
    agents: Mutex<HashMap<AgentId, AgentWindow>>,
}

impl ThreatEngine {
    /// Creates an engine with the given sliding window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Records an event now. Returns the tier transition it caused, if
    /// any.
    pub fn record(&self, agent_id: &AgentId, factor: ThreatFactor) -> Option<TierChange> {
        self.record_at(agent_id, factor, Utc::now())
    }

    /// Records an event at an explicit instant.
    pub fn record_at(
        &self,
        agent_id: &AgentId,
        factor: ThreatFactor,
        at: DateTime<Utc>,
    ) -> Option<TierChange> {
        let mut agents = self.agents.lock().expect("threat window lock");
        let window = agents
            .entry(agent_id.clone())
            .or_insert_with(AgentWindow::new);

        window.events.push_back((at, factor));
        window.prune(at - self.window);

        let score = score_of(&window.counts());
        let tier = PtsTier::of(score);
        let previous = window.last_tier;
        window.last_tier = tier;

        if tier == previous {
            None
        } else {
            tracing::warn!(
                agent_id = %agent_id,
                from = %previous,
                to = %tier,
                pts = score,
                "threat tier transition"
            );
            Some(TierChange {
                from: previous,
                to: tier,
            })
        }
    }

    /// Computes the agent's current score. O(1) in steady state after
    /// pruning.
    #[must_use]
    pub fn score(&self, agent_id: &AgentId) -> PtsScore {
        self.score_at(agent_id, Utc::now())
    }

    /// Computes the score as of an explicit instant.
    #[must_use]
    pub fn score_at(&self, agent_id: &AgentId, at: DateTime<Utc>) -> PtsScore {
        let mut agents = self.agents.lock().expect("threat window lock");
        let Some(window) = agents.get_mut(agent_id) else {
            return PtsScore {
                total: 0.0,
                tier: PtsTier::Safe,
                factors: FactorCounts::default(),
            };
        };
        window.prune(at - self.window);
        let factors = window.counts();
        let total = score_of(&factors);
        PtsScore {
            total,
            tier: PtsTier::of(total),
            factors,
        }
    }

    /// Returns the agent's current tier.
    #[must_use]
    pub fn tier(&self, agent_id: &AgentId) -> PtsTier {
        self.score(agent_id).tier
    }

    /// Clears an agent's window (admin action).
    pub fn reset(&self, agent_id: &AgentId) {
        let mut agents = self.agents.lock().expect("threat window lock");
        agents.remove(agent_id);
    }
}

#[allow(clippy::cast_precision_loss)] // Counts stay far below 2^52.
fn score_of(counts: &FactorCounts) -> f64 {
    let raw = QUANTUM_RISK_MULTIPLIER * counts.quantum_risk as f64
        + ACCESS_VIOLATION_WEIGHT * counts.access_violations as f64
        + RATE_LIMIT_WEIGHT * counts.rate_limit_hits as f64
        + SIGNATURE_FAILURE_WEIGHT * counts.signature_failures as f64;
    raw.clamp(0.0, PTS_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentId {
        AgentId::from_bytes(&[7; 20])
    }

    fn engine() -> ThreatEngine {
        ThreatEngine::new(Duration::hours(24))
    }

    #[test]
    fn fresh_agent_is_safe_at_zero() {
        let e = engine();
        let score = e.score(&agent());
        assert_eq!(score.total, 0.0);
        assert_eq!(score.tier, PtsTier::Safe);
    }

    #[test]
    fn one_quantum_event_reaches_caution_exactly() {
        let e = engine();
        let change = e.record(&agent(), ThreatFactor::QuantumRisk);
        assert_eq!(
            change,
            Some(TierChange {
                from: PtsTier::Safe,
                to: PtsTier::Caution,
            })
        );

        let score = e.score(&agent());
        assert!((score.total - 50.0).abs() < f64::EPSILON);
        assert_eq!(score.tier, PtsTier::Caution);
    }

    #[test]
    fn transition_reported_exactly_once() {
        let e = engine();
        assert!(e.record(&agent(), ThreatFactor::QuantumRisk).is_some());
        // Still Caution: 50.3 after one violation.
        assert!(e.record(&agent(), ThreatFactor::AccessViolation).is_none());
    }

    #[test]
    fn score_is_monotone_within_window() {
        let e = engine();
        let mut previous = 0.0;
        for _ in 0..10 {
            e.record(&agent(), ThreatFactor::SignatureFailure);
            let total = e.score(&agent()).total;
            assert!(total >= previous);
            previous = total;
        }
    }

    #[test]
    fn events_outside_window_stop_counting() {
        let e = engine();
        let old = Utc::now() - Duration::hours(25);
        e.record_at(&agent(), ThreatFactor::QuantumRisk, old);
        e.record_at(&agent(), ThreatFactor::QuantumRisk, old);

        // Pruning happens relative to the query instant.
        let score = e.score(&agent());
        assert_eq!(score.total, 0.0);
        assert_eq!(score.factors.quantum_risk, 0);
    }

    #[test]
    fn score_clamps_at_the_ceiling() {
        let e = engine();
        for _ in 0..30 {
            e.record(&agent(), ThreatFactor::QuantumRisk);
        }
        assert!((e.score(&agent()).total - PTS_MAX).abs() < f64::EPSILON);
    }

    #[test]
    fn critical_tier_boundary() {
        assert_eq!(PtsTier::of(49.9), PtsTier::Safe);
        assert_eq!(PtsTier::of(50.0), PtsTier::Caution);
        assert_eq!(PtsTier::of(149.9), PtsTier::Caution);
        assert_eq!(PtsTier::of(150.0), PtsTier::Critical);
    }

    #[test]
    fn reset_clears_the_window() {
        let e = engine();
        e.record(&agent(), ThreatFactor::QuantumRisk);
        e.reset(&agent());
        assert_eq!(e.score(&agent()).total, 0.0);
    }

    #[test]
    fn agents_are_isolated() {
        let e = engine();
        let other = AgentId::from_bytes(&[9; 20]);
        e.record(&agent(), ThreatFactor::QuantumRisk);
        assert_eq!(e.score(&other).total, 0.0);
    }
}
