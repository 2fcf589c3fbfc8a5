//! Agent State Records: signed, immutable audit entries.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::metadata::Metadata;
use crate::crypto::{ct_eq, sha256};
use crate::identity::AgentId;

/// Closed set of event kinds an ASR can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Successful wallet authentication.
    Authenticate,
    /// Hybrid (post-quantum) encryption operation.
    EncryptHybrid,
    /// Classical AES-only encryption operation.
    EncryptAes,
    /// Decryption operation (either suite).
    Decrypt,
    /// Keypair generation.
    KeyGenerate,
    /// Key rotation.
    KeyRotate,
    /// Signature or token verification failure.
    SignatureFail,
    /// Denied operation (role or policy violation).
    AccessViolation,
    /// Request rejected by the per-minute quota.
    RateLimitHit,
    /// Strike issued against an agent.
    Strike,
    /// Administrative strike reset.
    StrikeReset,
    /// Agent transitioned to banned.
    Ban,
    /// Heir claim executed.
    HeirTransfer,
    /// Threat tier changed for an agent.
    TierTransition,
    /// A batch could not be anchored after retry and fallback.
    AnchorFailed,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The serde rename is the canonical spelling.
        let name = match self {
            Self::Authenticate => "authenticate",
            Self::EncryptHybrid => "encrypt_hybrid",
            Self::EncryptAes => "encrypt_aes",
            Self::Decrypt => "decrypt",
            Self::KeyGenerate => "key_generate",
            Self::KeyRotate => "key_rotate",
            Self::SignatureFail => "signature_fail",
            Self::AccessViolation => "access_violation",
            Self::RateLimitHit => "rate_limit_hit",
            Self::Strike => "strike",
            Self::StrikeReset => "strike_reset",
            Self::Ban => "ban",
            Self::HeirTransfer => "heir_transfer",
            Self::TierTransition => "tier_transition",
            Self::AnchorFailed => "anchor_failed",
        };
        f.write_str(name)
    }
}

/// Severity of an audit event, 1 (routine) through 5 (critical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreatLevel {
    /// Routine operation.
    Info,
    /// Minor issue.
    Caution,
    /// Moderate concern.
    Warning,
    /// Significant concern.
    Alert,
    /// Immediate action required.
    Critical,
}

impl ThreatLevel {
    /// Numeric form used on the wire.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Info => 1,
            Self::Caution => 2,
            Self::Warning => 3,
            Self::Alert => 4,
            Self::Critical => 5,
        }
    }

    /// Parses the numeric form.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Info),
            2 => Some(Self::Caution),
            3 => Some(Self::Warning),
            4 => Some(Self::Alert),
            5 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl Serialize for ThreatLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for ThreatLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Self::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("threat level out of range: {value}")))
    }
}

/// Post-quantum safety classification of the operation behind a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PqcStatusKind {
    /// Quantum-resistant algorithm with a fresh key.
    Safe,
    /// Classical algorithm, or quantum-resistant with an aging key.
    Warning,
    /// Unknown or unexpected algorithm.
    Critical,
}

/// A signed, immutable audit record.
///
/// Field order here is the transmitted order. The `signature` field is
/// the SHA-256 of the record's canonical JSON form with `signature`
/// absent; it is computed once at creation and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStateRecord {
    /// Record identifier: `asr_` + 16 random bytes in hex.
    pub asr_id: String,

    /// RFC-3339 UTC timestamp with millisecond precision.
    pub timestamp: String,

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

    /// Hex SHA-256 over the canonical record body.
    pub signature: String,
}

/// Borrowing view of a record without its signature, used to produce
/// the canonical signing input.
#[derive(Serialize)]
struct UnsignedView<'a> {
    asr_id: &'a str,
    timestamp: &'a str,
    agent_id: &'a AgentId,
    action: ActionKind,
    threat_level: ThreatLevel,
    pqc_status: PqcStatusKind,
    metadata: &'a Metadata,
}

impl AgentStateRecord {
    /// Builds and signs a record.
    #[must_use]
    pub fn build(
        asr_id: String,
        timestamp: String,
        agent_id: AgentId,
        action: ActionKind,
        threat_level: ThreatLevel,
        pqc_status: PqcStatusKind,
        metadata: Metadata,
    ) -> Self {
        let mut record = Self {
            asr_id,
            timestamp,
            agent_id,
            action,
            threat_level,
            pqc_status,
            metadata,
            signature: String::new(),
        };
        record.signature = record.compute_signature();
        record
    }

    /// Recomputes the signature from the record body.
    #[must_use]
    pub fn compute_signature(&self) -> String {
        let view = UnsignedView {
            asr_id: &self.asr_id,
            timestamp: &self.timestamp,
            agent_id: &self.agent_id,
            action: self.action,
            threat_level: self.threat_level,
            pqc_status: self.pqc_status,
            metadata: &self.metadata,
        };
        let canonical =
            serde_jcs::to_vec(&view).expect("record fields always canonicalize to JSON");
        hex::encode(sha256(&canonical))
    }

    /// Verifies the stored signature against the record body in constant
    /// time.
    #[must_use]
    pub fn verify_signature(&self) -> bool {
        ct_eq(
            self.signature.as_bytes(),
            self.compute_signature().as_bytes(),
        )
    }

    /// Parses the record timestamp.
    ///
    /// Stored timestamps are always produced by [`format_timestamp`];
    /// a parse failure means the record was tampered with.
    #[must_use]
    pub fn timestamp_parsed(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Formats an instant in the record timestamp form: RFC-3339 UTC with
/// millisecond precision.
#[must_use]
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Classifies the post-quantum safety of an operation.
///
/// Quantum-resistant algorithms are safe while their key is under a
/// year old and degrade to a warning beyond that; recognized classical
/// algorithms always warn; anything unrecognized is critical.
#[must_use]
pub fn determine_pqc_status(algorithm: &str, key_age_days: i64) -> PqcStatusKind {
    let upper = algorithm.to_ascii_uppercase();

    const QUANTUM_SAFE: [&str; 3] = ["ML-KEM-768", "ML-KEM-1024", "HYBRID"];
    if QUANTUM_SAFE.iter().any(|name| upper.contains(name)) {
        if key_age_days > 365 {
            return PqcStatusKind::Warning;
        }
        return PqcStatusKind::Safe;
    }

    const CLASSICAL: [&str; 3] = ["AES", "ECDSA", "RSA"];
    if CLASSICAL.iter().any(|name| upper.contains(name)) {
        return PqcStatusKind::Warning;
    }

    PqcStatusKind::Critical
}
