//! HMAC-signed session tokens.
//!
//! A token is `base64url(payload) . base64url(tag)` where the payload
//! is the canonical JSON of the claims and the tag is HMAC-SHA256 over
//! the encoded payload, keyed with a secret held only by the server.
//! Validation is constant-time and collapses every failure - bad
//! encoding, bad tag, expiry - into one indistinguishable error.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::AuthError;
use crate::crypto::ct_eq;
use crate::governance::{Role, SubscriptionTier};
use crate::identity::AgentId;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Authenticated agent.
    pub agent_id: AgentId,
    /// Role at issuance.
    pub role: Role,
    /// Subscription tier at issuance.
    pub tier: SubscriptionTier,
    /// Issuance time, Unix seconds.
    pub issued_at: i64,
    /// Expiry time, Unix seconds.
    pub expires_at: i64,
}

/// A minted token together with its claims.
#[derive(Debug, Clone)]
pub struct SessionToken {
    /// Bearer token string.
    pub token: String,
    /// The claims the token carries.
    pub claims: SessionClaims,
}

/// Mints and validates session tokens.
pub struct SessionSigner {
    key: Secret<Vec<u8>>,
    lifetime: Duration,
}

impl SessionSigner {
    /// Creates a signer from the server's HMAC key.
    #[must_use]
    pub fn new(key: Vec<u8>, lifetime: Duration) -> Self {
        Self {
            key: Secret::new(key),
            lifetime,
        }
    }

    /// Issues a token binding the agent, role, and tier.
    #[must_use]
    pub fn issue(&self, agent_id: &AgentId, role: Role, tier: SubscriptionTier) -> SessionToken {
        let issued_at = Utc::now();
        let claims = SessionClaims {
            agent_id: agent_id.clone(),
            role,
            tier,
            issued_at: issued_at.timestamp(),
            expires_at: (issued_at + self.lifetime).timestamp(),
        };

        let payload =
            serde_jcs::to_vec(&claims).expect("session claims always canonicalize to JSON");
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);
        let tag = self.tag(payload_b64.as_bytes());

        SessionToken {
            token: format!("{payload_b64}.{}", URL_SAFE_NO_PAD.encode(tag)),
            claims,
        }
    }

    /// Validates a token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] for every failure mode.
    pub fn validate(&self, token: &str) -> Result<SessionClaims, AuthError> {
        self.validate_at(token, Utc::now())
    }

    /// [`Self::validate`] with an explicit clock, for tests.
    ///
    /// # Errors
    ///
    /// See [`Self::validate`].
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, AuthError> {
        let (payload_b64, tag_b64) = token.split_once('.').ok_or(AuthError::InvalidToken)?;

        let presented_tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| AuthError::InvalidToken)?;
        let expected_tag = self.tag(payload_b64.as_bytes());
        if !ct_eq(&presented_tag, &expected_tag) {
            return Err(AuthError::InvalidToken);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::InvalidToken)?;
        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken)?;

        if claims.expires_at < now.timestamp() {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    fn tag(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.expose_secret())
            .expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentId {
        AgentId::from_bytes(&[4; 20])
    }

    fn signer() -> SessionSigner {
        SessionSigner::new(vec![0x11; 32], Duration::seconds(86_400))
    }

    #[test]
    fn issue_validate_round_trip() {
        let signer = signer();
        let token = signer.issue(&agent(), Role::Sentinel, SubscriptionTier::AutonomousGuild);
        let claims = signer.validate(&token.token).unwrap();
        assert_eq!(claims, token.claims);
        assert_eq!(claims.expires_at - claims.issued_at, 86_400);
    }

    #[test]
    fn tampered_payload_rejected() {
        let signer = signer();
        let token = signer.issue(&agent(), Role::User, SubscriptionTier::SentinelCore);

        let (payload, tag) = token.token.split_once('.').unwrap();
        let mut forged_claims = token.claims.clone();
        forged_claims.role = Role::Admin;
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_jcs::to_vec(&forged_claims).unwrap());
        let forged = format!("{forged_payload}.{tag}");
        assert_eq!(signer.validate(&forged), Err(AuthError::InvalidToken));

        // Original parts still validate.
        assert!(signer.validate(&format!("{payload}.{tag}")).is_ok());
    }

    #[test]
    fn wrong_key_rejected() {
        let token = signer().issue(&agent(), Role::User, SubscriptionTier::SentinelCore);
        let other = SessionSigner::new(vec![0x22; 32], Duration::seconds(86_400));
        assert_eq!(other.validate(&token.token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn expiry_is_not_distinguished_from_tampering() {
        let signer = signer();
        let token = signer.issue(&agent(), Role::User, SubscriptionTier::SentinelCore);

        let later = Utc::now() + Duration::seconds(86_401);
        assert_eq!(
            signer.validate_at(&token.token, later),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn garbage_tokens_rejected() {
        let signer = signer();
        for garbage in ["", "no-dot", "a.b", "!!!.???"] {
            assert_eq!(signer.validate(garbage), Err(AuthError::InvalidToken));
        }
    }
}
