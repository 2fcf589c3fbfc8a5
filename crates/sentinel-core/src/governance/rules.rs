//! Rule codes and the heir-claim protocol.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::access::AgentProfile;
use crate::crypto::{recover_address, RecoverError};
use crate::identity::AgentId;

/// Named governance constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleCode {
    /// Mutating operations require a valid session token.
    #[serde(rename = "RC-1.01")]
    Rc101,
    /// Inactivity-triggered heir transfer.
    #[serde(rename = "RC-1.02")]
    Rc102,
    /// Three-strike ban.
    #[serde(rename = "RC-2.01")]
    Rc201,
    /// Secondary-sink fallback on anchor failure.
    #[serde(rename = "RC-3.02")]
    Rc302,
}

impl std::fmt::Display for RuleCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rc101 => f.write_str("RC-1.01"),
            Self::Rc102 => f.write_str("RC-1.02"),
            Self::Rc201 => f.write_str("RC-2.01"),
            Self::Rc302 => f.write_str("RC-3.02"),
        }
    }
}

/// Errors produced while validating an heir claim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeirClaimError {
    /// The original agent has no designated heir.
    #[error("no heir designated for {agent_id}")]
    NoHeirDesignated {
        /// The claimed-over agent.
        agent_id: AgentId,
    },

    /// The claimant is not the designated heir.
    #[error("claimant is not the designated heir")]
    WrongHeir,

    /// The original agent is still active.
    #[error("agent active {days_inactive} days ago, {required} required")]
    StillActive {
        /// Days since last activity.
        days_inactive: i64,
        /// Inactivity days required to trigger the transfer.
        required: i64,
    },

    /// The claim signature does not recover to the heir address.
    #[error("claim signature does not match the heir")]
    BadSignature,

    /// The signature itself is malformed.
    #[error(transparent)]
    Recover(#[from] RecoverError),
}

/// A signed request from an heir to take over an inactive agent.
#[derive(Debug, Clone)]
pub struct HeirClaim {
    /// The inactive agent being claimed.
    pub original: AgentId,
    /// The claiming heir.
    pub heir: AgentId,
    /// Claim timestamp (embedded in the signed message).
    pub claimed_at: DateTime<Utc>,
    /// 65-byte recoverable signature over [`heir_claim_message`].
    pub signature: Vec<u8>,
}

/// Renders the canonical heir-claim message the heir must sign.
#[must_use]
pub fn heir_claim_message(
    original: &AgentId,
    heir: &AgentId,
    claimed_at: DateTime<Utc>,
) -> String {
    format!(
        "PULSAR SENTINEL Heir Claim\n\n\
         Original: {original}\n\
         Heir: {heir}\n\
         Timestamp: {}\n",
        claimed_at.to_rfc3339()
    )
}

/// Validates an heir claim against the original agent's profile.
///
/// Checks, in order: an heir is designated, the claimant is that heir,
/// the inactivity threshold has elapsed, and the claim signature
/// recovers to the heir address.
///
/// # Errors
///
/// Returns [`HeirClaimError`] naming the first failed check.
pub fn verify_heir_claim(
    claim: &HeirClaim,
    profile: &AgentProfile,
    inactivity_required: Duration,
    now: DateTime<Utc>,
) -> Result<(), HeirClaimError> {
    let designated = profile
        .heir
        .as_ref()
        .ok_or_else(|| HeirClaimError::NoHeirDesignated {
            agent_id: claim.original.clone(),
        })?;
    if *designated != claim.heir {
        return Err(HeirClaimError::WrongHeir);
    }

    let inactive = now - profile.last_activity;
    if inactive < inactivity_required {
        return Err(HeirClaimError::StillActive {
            days_inactive: inactive.num_days(),
            required: inactivity_required.num_days(),
        });
    }

    let message = heir_claim_message(&claim.original, &claim.heir, claim.claimed_at);
    let recovered = recover_address(message.as_bytes(), &claim.signature)?;
    if recovered != claim.heir {
        return Err(HeirClaimError::BadSignature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::signature::hazmat::PrehashSigner;
    use k256::ecdsa::{RecoveryId, Signature, SigningKey};
    use rand::rngs::OsRng;

    use super::super::access::{Role, SubscriptionTier};
    use super::*;
    use crate::crypto::personal_message_hash;

    fn keyed_heir() -> (SigningKey, AgentId) {
        let key = SigningKey::random(&mut OsRng);
        let point = key.verifying_key().to_encoded_point(false);
        let digest = crate::crypto::keccak256(&point.as_bytes()[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);
        (key, AgentId::from_bytes(&address))
    }

    fn sign_claim(key: &SigningKey, message: &str) -> Vec<u8> {
        let digest = personal_message_hash(message.as_bytes());
        let (sig, recovery_id): (Signature, RecoveryId) =
            key.sign_prehash(&digest).expect("signing succeeds");
        let mut out = sig.to_bytes().to_vec();
        out.push(recovery_id.to_byte());
        out
    }

    fn inactive_profile(original: &AgentId, heir: Option<AgentId>) -> AgentProfile {
        AgentProfile {
            agent_id: original.clone(),
            role: Role::User,
            tier: SubscriptionTier::SentinelCore,
            strike_count: 0,
            revoked: false,
            last_activity: Utc::now() - Duration::days(120),
            heir,
            registered_at: Utc::now() - Duration::days(400),
        }
    }

    #[test]
    fn valid_claim_passes() {
        let original = AgentId::from_bytes(&[3; 20]);
        let (key, heir) = keyed_heir();
        let claimed_at = Utc::now();

        let message = heir_claim_message(&original, &heir, claimed_at);
        let claim = HeirClaim {
            original: original.clone(),
            heir: heir.clone(),
            claimed_at,
            signature: sign_claim(&key, &message),
        };

        let profile = inactive_profile(&original, Some(heir));
        verify_heir_claim(&claim, &profile, Duration::days(90), Utc::now()).unwrap();
    }

    #[test]
    fn active_agent_cannot_be_claimed() {
        let original = AgentId::from_bytes(&[3; 20]);
        let (key, heir) = keyed_heir();
        let claimed_at = Utc::now();
        let message = heir_claim_message(&original, &heir, claimed_at);
        let claim = HeirClaim {
            original: original.clone(),
            heir: heir.clone(),
            claimed_at,
            signature: sign_claim(&key, &message),
        };

        let mut profile = inactive_profile(&original, Some(heir));
        profile.last_activity = Utc::now() - Duration::days(10);

        let err = verify_heir_claim(&claim, &profile, Duration::days(90), Utc::now()).unwrap_err();
        assert!(matches!(err, HeirClaimError::StillActive { .. }));
    }

    #[test]
    fn wrong_claimant_rejected() {
        let original = AgentId::from_bytes(&[3; 20]);
        let (key, heir) = keyed_heir();
        let (_, interloper) = keyed_heir();
        let claimed_at = Utc::now();
        let message = heir_claim_message(&original, &interloper, claimed_at);
        let claim = HeirClaim {
            original: original.clone(),
            heir: interloper,
            claimed_at,
            signature: sign_claim(&key, &message),
        };

        let profile = inactive_profile(&original, Some(heir));
        let err = verify_heir_claim(&claim, &profile, Duration::days(90), Utc::now()).unwrap_err();
        assert_eq!(err, HeirClaimError::WrongHeir);
    }

    #[test]
    fn signature_from_someone_else_rejected() {
        let original = AgentId::from_bytes(&[3; 20]);
        let (_, heir) = keyed_heir();
        let (other_key, _) = keyed_heir();
        let claimed_at = Utc::now();
        let message = heir_claim_message(&original, &heir, claimed_at);
        let claim = HeirClaim {
            original: original.clone(),
            heir: heir.clone(),
            claimed_at,
            signature: sign_claim(&other_key, &message),
        };

        let profile = inactive_profile(&original, Some(heir));
        let err = verify_heir_claim(&claim, &profile, Duration::days(90), Utc::now()).unwrap_err();
        assert_eq!(err, HeirClaimError::BadSignature);
    }

    #[test]
    fn no_heir_designated_rejected() {
        let original = AgentId::from_bytes(&[3; 20]);
        let (key, heir) = keyed_heir();
        let claimed_at = Utc::now();
        let message = heir_claim_message(&original, &heir, claimed_at);
        let claim = HeirClaim {
            original: original.clone(),
            heir,
            claimed_at,
            signature: sign_claim(&key, &message),
        };

        let profile = inactive_profile(&original, None);
        let err = verify_heir_claim(&claim, &profile, Duration::days(90), Utc::now()).unwrap_err();
        assert!(matches!(err, HeirClaimError::NoHeirDesignated { .. }));
    }
}
