//! Wallet-signature authentication.
//!
//! Flow: the client requests a nonce for its address, signs the
//! rendered challenge message with its wallet key, and exchanges the
//! signature for a session token. Nonces are single-use with a short
//! absolute deadline; session tokens are HMAC-signed bearer
//! credentials with an absolute expiry.
//!
//! Mutex poisoning indicates a panic in another thread, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

mod session;

pub use session::{SessionClaims, SessionSigner, SessionToken};

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use thiserror::Error;

use crate::crypto::{ct_eq, recover_address};
use crate::identity::AgentId;

/// Errors produced by the authentication protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No nonce has been issued for the agent.
    #[error("no active nonce for agent")]
    NonceMissing,

    /// The nonce's deadline has passed.
    #[error("nonce expired")]
    NonceExpired,

    /// The supplied nonce does not match the issued one (or was already
    /// consumed).
    #[error("nonce already used or unknown")]
    NonceUsed,

    /// The signature does not recover to the claimed address.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The session token failed validation. Expiry and tampering are
    /// deliberately not distinguished.
    #[error("invalid session token")]
    InvalidToken,
}

/// A nonce issued to a wallet, with the exact message to sign.
#[derive(Debug, Clone)]
pub struct IssuedNonce {
    /// 32 random bytes, hex encoded.
    pub nonce: String,
    /// The challenge message the wallet must sign.
    pub message: String,
    /// Issuance instant.
    pub issued_at: DateTime<Utc>,
    /// Absolute deadline.
    pub expires_at: DateTime<Utc>,
}

struct StoredNonce {
    nonce: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Renders the challenge message for a nonce.
fn challenge_message(agent_id: &AgentId, nonce: &str, issued_at: DateTime<Utc>) -> String {
    format!(
        "PULSAR SENTINEL Authentication\n\n\
         Please sign this message to authenticate.\n\n\
         Wallet: {agent_id}\n\
         Nonce: {nonce}\n\
         Timestamp: {}\n\n\
         This signature will not cost any gas fees.",
        issued_at.to_rfc3339()
    )
}

/// Nonce issuance and signature verification.
pub struct AuthService {
    nonces: Mutex<HashMap<AgentId, StoredNonce>>,
    nonce_lifetime: Duration,
    signer: SessionSigner,
}

impl AuthService {
    /// Creates the service with the given nonce lifetime and session
    /// signer.
    #[must_use]
    pub fn new(nonce_lifetime: Duration, signer: SessionSigner) -> Self {
        Self {
            nonces: Mutex::new(HashMap::new()),
            nonce_lifetime,
            signer,
        }
    }

    /// The session signer used to mint and validate tokens.
    #[must_use]
    pub const fn session(&self) -> &SessionSigner {
        &self.signer
    }

    /// Issues a fresh nonce for `agent_id`, replacing any prior one.
    #[must_use]
    pub fn issue_nonce(&self, agent_id: &AgentId) -> IssuedNonce {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);

        let issued_at = Utc::now();
        let expires_at = issued_at + self.nonce_lifetime;

        self.nonces.lock().expect("nonce cache lock").insert(
            agent_id.clone(),
            StoredNonce {
                nonce: nonce.clone(),
                issued_at,
                expires_at,
            },
        );

        tracing::info!(agent_id = %agent_id, "issued auth nonce");

        IssuedNonce {
            message: challenge_message(agent_id, &nonce, issued_at),
            nonce,
            issued_at,
            expires_at,
        }
    }

    /// Verifies a wallet signature over the challenge for `nonce` and
    /// consumes the nonce on success.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] naming the failure; the nonce survives a
    /// failed attempt until its deadline.
    pub fn verify(
        &self,
        agent_id: &AgentId,
        signature: &[u8],
        nonce: &str,
    ) -> Result<(), AuthError> {
        let issued_at = {
            let mut nonces = self.nonces.lock().expect("nonce cache lock");
            let stored = nonces.get(agent_id).ok_or(AuthError::NonceMissing)?;

            if stored.expires_at < Utc::now() {
                nonces.remove(agent_id);
                return Err(AuthError::NonceExpired);
            }
            if !ct_eq(stored.nonce.as_bytes(), nonce.as_bytes()) {
                return Err(AuthError::NonceUsed);
            }
            stored.issued_at
        };

        // The message is re-rendered from stored state; the client
        // cannot substitute its own challenge text.
        let message = challenge_message(agent_id, nonce, issued_at);
        let recovered =
            recover_address(message.as_bytes(), signature).map_err(|_| AuthError::SignatureInvalid)?;

        if !ct_eq(recovered.as_str().as_bytes(), agent_id.as_str().as_bytes()) {
            tracing::warn!(agent_id = %agent_id, "signature recovered to a different address");
            return Err(AuthError::SignatureInvalid);
        }

        // Consume atomically: remove only if the verified nonce is
        // still the active one.
        let mut nonces = self.nonces.lock().expect("nonce cache lock");
        match nonces.get(agent_id) {
            Some(stored) if ct_eq(stored.nonce.as_bytes(), nonce.as_bytes()) => {
                nonces.remove(agent_id);
                Ok(())
            },
            _ => Err(AuthError::NonceUsed),
        }
    }

    /// Drops expired nonces from the cache.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut nonces = self.nonces.lock().expect("nonce cache lock");
        let before = nonces.len();
        nonces.retain(|_, stored| stored.expires_at >= now);
        before - nonces.len()
    }
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::signature::hazmat::PrehashSigner;
    use k256::ecdsa::{RecoveryId, Signature, SigningKey};
    use rand::rngs::OsRng;

    use super::*;
    use crate::crypto::{keccak256, personal_message_hash};
    use crate::governance::{Role, SubscriptionTier};

    fn wallet() -> (SigningKey, AgentId) {
        let key = SigningKey::random(&mut OsRng);
        let point = key.verifying_key().to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);
        (key, AgentId::from_bytes(&address))
    }

    fn sign(key: &SigningKey, message: &str) -> Vec<u8> {
        let digest = personal_message_hash(message.as_bytes());
        let (sig, recovery_id): (Signature, RecoveryId) =
            key.sign_prehash(&digest).expect("signing succeeds");
        let mut out = sig.to_bytes().to_vec();
        out.push(recovery_id.to_byte());
        out
    }

    fn service() -> AuthService {
        AuthService::new(
            Duration::seconds(300),
            SessionSigner::new(vec![0x5a; 32], Duration::seconds(86_400)),
        )
    }

    #[test]
    fn full_flow_verifies_and_consumes_nonce() {
        let service = service();
        let (key, agent) = wallet();

        let issued = service.issue_nonce(&agent);
        assert_eq!(issued.nonce.len(), 64);
        assert!(issued.message.contains(agent.as_str()));

        let signature = sign(&key, &issued.message);
        service.verify(&agent, &signature, &issued.nonce).unwrap();

        // Single use: the same signature cannot authenticate twice.
        let err = service.verify(&agent, &signature, &issued.nonce).unwrap_err();
        assert_eq!(err, AuthError::NonceMissing);
    }

    #[test]
    fn signature_from_wrong_wallet_rejected() {
        let service = service();
        let (_, agent) = wallet();
        let (other_key, _) = wallet();

        let issued = service.issue_nonce(&agent);
        let signature = sign(&other_key, &issued.message);

        let err = service.verify(&agent, &signature, &issued.nonce).unwrap_err();
        assert_eq!(err, AuthError::SignatureInvalid);

        // A failed attempt does not burn the nonce.
        assert!(service.nonces.lock().unwrap().contains_key(&agent));
    }

    #[test]
    fn stale_nonce_value_rejected() {
        let service = service();
        let (key, agent) = wallet();

        let first = service.issue_nonce(&agent);
        let second = service.issue_nonce(&agent);

        // Signing the superseded challenge fails the nonce match.
        let signature = sign(&key, &first.message);
        let err = service.verify(&agent, &signature, &first.nonce).unwrap_err();
        assert_eq!(err, AuthError::NonceUsed);

        let signature = sign(&key, &second.message);
        service.verify(&agent, &signature, &second.nonce).unwrap();
    }

    #[test]
    fn expired_nonce_rejected() {
        let service = AuthService::new(
            Duration::zero(),
            SessionSigner::new(vec![0x5a; 32], Duration::seconds(60)),
        );
        let (key, agent) = wallet();

        let issued = service.issue_nonce(&agent);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let signature = sign(&key, &issued.message);
        let err = service.verify(&agent, &signature, &issued.nonce).unwrap_err();
        assert_eq!(err, AuthError::NonceExpired);
    }

    #[test]
    fn session_tokens_round_trip_through_the_service() {
        let service = service();
        let (_, agent) = wallet();

        let token =
            service
                .session()
                .issue(&agent, Role::User, SubscriptionTier::SentinelCore);
        let claims = service.session().validate(&token.token).unwrap();
        assert_eq!(claims.agent_id, agent);
        assert_eq!(claims.role, Role::User);
    }

    #[test]
    fn sweep_removes_expired_nonces() {
        let service = AuthService::new(
            Duration::zero(),
            SessionSigner::new(vec![0x5a; 32], Duration::seconds(60)),
        );
        let (_, agent) = wallet();
        let _ = service.issue_nonce(&agent);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(service.sweep_expired(), 1);
    }
}
