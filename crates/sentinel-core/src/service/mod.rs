//! The sentinel context: wiring and request flow.
//!
//! No global mutable state: a [`Sentinel`] owns the key store, hybrid
//! engine, record pipeline, threat engine, registry, and access
//! control, and every operation flows through the same sequence -
//! token check, capability decision, crypto operation, audit record,
//! threat update. Denials feed the threat engine just like successes
//! feed the audit trail; the two cannot drift apart.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::anchor::{
    spawn_anchor_worker, AnchorCoordinator, AnchorSink, BackoffPolicy, NoopAnchor,
};
use crate::asr::{
    determine_pqc_status, ActionKind, AgentStateRecord, AsrPipeline, BatchProof, EventDescriptor,
    Metadata, MetadataValue, PipelineConfig, PipelineError, PqcStatusKind, RecordFilter,
    ThreatLevel,
};
use crate::auth::{AuthError, AuthService, IssuedNonce, SessionClaims, SessionSigner, SessionToken};
use crate::config::{ConfigError, SentinelConfig};
use crate::crypto::SIGNATURE_SIZE;
use crate::governance::{
    verify_heir_claim, AccessController, AccessDenied, AgentRegistry, HeirClaim, HeirClaimError,
    Operation, Role, RuleCode,
};
use crate::identity::{AgentId, IdentityError};
use crate::pqc::{
    aes_decrypt, aes_encrypt, HybridEngine, KeyStore, KeyStoreError, PqcError, RotationOutcome,
    StoredKey, LEGACY_ALGORITHM,
};
use crate::threat::{PtsScore, ThreatEngine, ThreatFactor, TierChange};

/// Errors that refuse startup.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The key store could not be opened.
    #[error("key store: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// The record pipeline could not be opened.
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
}

/// The four outcomes callers see over the wire. Detailed kinds live in
/// the audit trail, not in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireStatus {
    /// Malformed or unprocessable input.
    BadRequest,
    /// Missing or invalid credentials.
    Unauthorized,
    /// Authenticated but not permitted.
    Forbidden,
    /// Internal failure.
    ServerError,
}

/// Errors surfaced by sentinel operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Input could not be parsed.
    #[error("malformed input: {0}")]
    BadInput(String),

    /// Agent identity could not be parsed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Authentication failure.
    #[error(transparent)]
    Unauthenticated(#[from] AuthError),

    /// Capability decision denied the operation.
    #[error(transparent)]
    Denied(#[from] AccessDenied),

    /// Heir claim failed validation.
    #[error(transparent)]
    Heir(#[from] HeirClaimError),

    /// Cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] PqcError),

    /// Audit pipeline failure.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ServiceError {
    /// Maps the error to its wire outcome.
    #[must_use]
    pub fn wire_status(&self) -> WireStatus {
        match self {
            Self::BadInput(_) | Self::Identity(_) => WireStatus::BadRequest,
            Self::Unauthenticated(_) => WireStatus::Unauthorized,
            Self::Denied(_) | Self::Heir(_) => WireStatus::Forbidden,
            Self::Crypto(error) => match error {
                PqcError::Store(KeyStoreError::KeyNotFound { .. }) => WireStatus::BadRequest,
                PqcError::Store(_) => WireStatus::ServerError,
                _ => WireStatus::BadRequest,
            },
            Self::Pipeline(_) => WireStatus::ServerError,
        }
    }
}

/// The assembled core.
pub struct Sentinel {
    config: SentinelConfig,
    engine: HybridEngine,
    pipeline: AsrPipeline,
    threat: Arc<ThreatEngine>,
    registry: Arc<AgentRegistry>,
    access: AccessController,
    auth: AuthService,
}

impl Sentinel {
    /// Opens the core over the configured data directory.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if any store cannot be opened; the
    /// process must not serve requests in that case.
    pub fn open(config: SentinelConfig) -> Result<Self, StartupError> {
        let store = Arc::new(KeyStore::open(
            config.data_dir.join("keys"),
            &config.keystore_passphrase,
        )?);
        Self::assemble(config, store)
    }

    /// Opens the core with an in-memory key store (tests, ephemeral
    /// deployments).
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if the pipeline cannot be opened.
    pub fn open_ephemeral(config: SentinelConfig) -> Result<Self, StartupError> {
        Self::assemble(config, Arc::new(KeyStore::in_memory()))
    }

    fn assemble(config: SentinelConfig, store: Arc<KeyStore>) -> Result<Self, StartupError> {
        let pipeline = AsrPipeline::open(
            &config.data_dir,
            PipelineConfig {
                batch_max: config.batch_max,
                batch_max_age: config.batch_max_age,
            },
        )?;

        let engine = HybridEngine::new(
            Arc::clone(&store),
            config.pqc_level,
            config.key_rotation,
            config.key_grace,
        );

        let registry = Arc::new(AgentRegistry::new(config.strike_threshold));
        let access = AccessController::new(Arc::clone(&registry), config.rate_limit_default);
        let threat = Arc::new(ThreatEngine::new(config.threat_window));

        let auth = AuthService::new(
            config.nonce_lifetime,
            SessionSigner::new(config.session_hmac_key.clone(), config.session_lifetime),
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            pqc_level = %config.pqc_level,
            anchor = ?config.anchor_network,
            "sentinel core ready"
        );

        Ok(Self {
            config,
            engine,
            pipeline,
            threat,
            registry,
            access,
            auth,
        })
    }

    /// Starts the background anchor worker over the given sinks.
    ///
    /// Must be called from within a tokio runtime. Without a worker,
    /// batches still close and stay `Pending` locally.
    pub fn start_anchor(
        &self,
        primary: Arc<dyn AnchorSink>,
        secondary: Option<Arc<dyn AnchorSink>>,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::new(AnchorCoordinator::new(
            primary,
            secondary,
            BackoffPolicy::default(),
        ));
        spawn_anchor_worker(self.pipeline.clone(), coordinator)
    }

    /// Starts the anchor worker with the local no-op sink.
    pub fn start_local_anchor(&self) -> tokio::task::JoinHandle<()> {
        self.start_anchor(Arc::new(NoopAnchor::new()), None)
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    /// Issues a login nonce for a wallet address.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Identity`] for a malformed address.
    pub fn issue_nonce(&self, wallet_address: &str) -> Result<IssuedNonce, ServiceError> {
        let agent_id = AgentId::parse(wallet_address)?;
        Ok(self.auth.issue_nonce(&agent_id))
    }

    /// Verifies a wallet signature and issues a session token.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Unauthenticated`] on any verification
    /// failure; failures count toward the agent's signature-failure
    /// factor.
    pub fn verify_wallet(
        &self,
        wallet_address: &str,
        signature_hex: &str,
        nonce: &str,
    ) -> Result<SessionToken, ServiceError> {
        let agent_id = AgentId::parse(wallet_address)?;
        let signature = hex::decode(signature_hex.trim_start_matches("0x"))
            .map_err(|_| ServiceError::BadInput("signature is not hex".into()))?;
        if signature.len() != SIGNATURE_SIZE {
            return Err(ServiceError::BadInput(format!(
                "signature must be {SIGNATURE_SIZE} bytes"
            )));
        }

        if let Err(error) = self.auth.verify(&agent_id, &signature, nonce) {
            self.note_threat(&agent_id, ThreatFactor::SignatureFailure)?;
            self.record_event(
                &agent_id,
                ActionKind::SignatureFail,
                ThreatLevel::Alert,
                PqcStatusKind::Safe,
                metadata([
                    ("rule", MetadataValue::from(RuleCode::Rc101.to_string())),
                    ("reason", MetadataValue::from(error.to_string())),
                ]),
            )?;
            return Err(error.into());
        }

        self.registry.mark_authenticated(&agent_id);
        let profile = self.registry.get_or_register(&agent_id);
        let token = self
            .auth
            .session()
            .issue(&agent_id, profile.role, profile.tier);

        self.record_event(
            &agent_id,
            ActionKind::Authenticate,
            ThreatLevel::Info,
            PqcStatusKind::Safe,
            metadata([("role", MetadataValue::from(profile.role.to_string()))]),
        )?;

        Ok(token)
    }

    // ------------------------------------------------------------------
    // Crypto operations
    // ------------------------------------------------------------------

    /// Generates a keypair owned by the caller.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the token, capability decision, or
    /// key generation fails.
    pub fn generate_keypair(&self, token: &str) -> Result<StoredKey, ServiceError> {
        let claims = self.require_session(token, Operation::KeyGenerate)?;
        let stored = self.engine.generate_keypair(&claims.agent_id)?;

        self.record_event(
            &claims.agent_id,
            ActionKind::KeyGenerate,
            ThreatLevel::Info,
            PqcStatusKind::Safe,
            metadata([
                ("key_id", MetadataValue::from(stored.metadata.key_id.clone())),
                (
                    "algorithm",
                    MetadataValue::from(stored.metadata.algorithm.name()),
                ),
            ]),
        )?;
        Ok(stored)
    }

    /// Hybrid-encrypts `plaintext` to the caller's keypair `key_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the token, capability decision, or
    /// encryption fails.
    pub fn encrypt_hybrid(
        &self,
        token: &str,
        key_id: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ServiceError> {
        let claims = self.require_session(token, Operation::EncryptHybrid)?;
        let envelope = self.engine.encrypt_hybrid(key_id, plaintext)?;

        self.record_crypto_event(&claims.agent_id, ActionKind::EncryptHybrid, key_id)?;
        Ok(envelope)
    }

    /// Decrypts a hybrid envelope with the caller's keypair `key_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`]; authentication failures are recorded
    /// against the caller's signature-failure factor.
    pub fn decrypt_hybrid(
        &self,
        token: &str,
        key_id: &str,
        envelope: &[u8],
    ) -> Result<Vec<u8>, ServiceError> {
        let claims = self.require_session(token, Operation::Decrypt)?;
        self.require_key_owner(&claims, key_id)?;

        match self.engine.decrypt(key_id, envelope) {
            Ok(plaintext) => {
                self.record_crypto_event(&claims.agent_id, ActionKind::Decrypt, key_id)?;
                Ok(plaintext)
            },
            Err(error) => {
                if matches!(
                    error,
                    PqcError::AuthenticationFailure | PqcError::StaleKey { .. }
                ) {
                    self.note_threat(&claims.agent_id, ThreatFactor::SignatureFailure)?;
                    self.record_event(
                        &claims.agent_id,
                        ActionKind::SignatureFail,
                        ThreatLevel::Alert,
                        PqcStatusKind::Safe,
                        metadata([
                            ("operation", MetadataValue::from("decrypt")),
                            ("reason", MetadataValue::from(error.to_string())),
                        ]),
                    )?;
                }
                Err(error.into())
            },
        }
    }

    /// Encrypts with the classical password-based fallback.
    ///
    /// The operation succeeds but counts toward the caller's
    /// quantum-risk factor: the fallback is not quantum-resistant.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the token or capability decision
    /// fails.
    pub fn encrypt_aes(
        &self,
        token: &str,
        password: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ServiceError> {
        let claims = self.require_session(token, Operation::EncryptAes)?;
        let envelope = aes_encrypt(password.as_bytes(), plaintext);

        self.note_threat(&claims.agent_id, ThreatFactor::QuantumRisk)?;
        self.record_event(
            &claims.agent_id,
            ActionKind::EncryptAes,
            ThreatLevel::Warning,
            determine_pqc_status(LEGACY_ALGORITHM, 0),
            metadata([("algorithm", MetadataValue::from(LEGACY_ALGORITHM))]),
        )?;
        Ok(envelope)
    }

    /// Decrypts a password-based envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`]; wrong-password failures are recorded
    /// against the caller's signature-failure factor.
    pub fn decrypt_aes(
        &self,
        token: &str,
        password: &str,
        envelope: &[u8],
    ) -> Result<Vec<u8>, ServiceError> {
        let claims = self.require_session(token, Operation::Decrypt)?;

        match aes_decrypt(password.as_bytes(), envelope) {
            Ok(plaintext) => {
                self.note_threat(&claims.agent_id, ThreatFactor::QuantumRisk)?;
                self.record_event(
                    &claims.agent_id,
                    ActionKind::Decrypt,
                    ThreatLevel::Warning,
                    determine_pqc_status(LEGACY_ALGORITHM, 0),
                    metadata([("algorithm", MetadataValue::from(LEGACY_ALGORITHM))]),
                )?;
                Ok(plaintext)
            },
            Err(error) => {
                if matches!(error, PqcError::AuthenticationFailure) {
                    self.note_threat(&claims.agent_id, ThreatFactor::SignatureFailure)?;
                    self.record_event(
                        &claims.agent_id,
                        ActionKind::SignatureFail,
                        ThreatLevel::Alert,
                        PqcStatusKind::Warning,
                        metadata([("operation", MetadataValue::from("decrypt_aes"))]),
                    )?;
                }
                Err(error.into())
            },
        }
    }

    /// Rotates the caller's keypair `key_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the token, capability decision, or
    /// rotation fails.
    pub fn rotate_key(&self, token: &str, key_id: &str) -> Result<RotationOutcome, ServiceError> {
        let claims = self.require_session(token, Operation::KeyRotate)?;
        self.require_key_owner(&claims, key_id)?;
        let outcome = self.engine.rotate(key_id)?;

        self.record_event(
            &claims.agent_id,
            ActionKind::KeyRotate,
            ThreatLevel::Info,
            PqcStatusKind::Safe,
            metadata([
                ("old_key_id", MetadataValue::from(outcome.old_key_id.clone())),
                (
                    "new_key_id",
                    MetadataValue::from(outcome.new_key.metadata.key_id.clone()),
                ),
            ]),
        )?;
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Audit and scoring queries
    // ------------------------------------------------------------------

    /// Retrieves an agent's audit records. Agents read their own trail;
    /// admins read any.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the token or capability decision
    /// fails.
    pub fn records_for(
        &self,
        token: &str,
        agent: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<AgentStateRecord>, ServiceError> {
        let claims = self.require_session(token, Operation::AsrRead)?;
        let subject = AgentId::parse(agent)?;
        self.require_self_or_admin(&claims, &subject)?;
        Ok(self.pipeline.records_for(&subject, filter)?)
    }

    /// Retrieves the inclusion proof for a batched record.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the token or capability decision
    /// fails.
    pub fn proof_for(&self, token: &str, asr_id: &str) -> Result<Option<BatchProof>, ServiceError> {
        let _claims = self.require_session(token, Operation::AsrRead)?;
        Ok(self.pipeline.proof_for(asr_id)?)
    }

    /// Retrieves an agent's current threat score.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the token or capability decision
    /// fails.
    pub fn pts(&self, token: &str, agent: &str) -> Result<PtsScore, ServiceError> {
        let claims = self.require_session(token, Operation::PtsRead)?;
        let subject = AgentId::parse(agent)?;
        self.require_self_or_admin(&claims, &subject)?;
        Ok(self.threat.score(&subject))
    }

    // ------------------------------------------------------------------
    // Governance
    // ------------------------------------------------------------------

    /// Admin operation: clears an agent's strikes and lifts its ban.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the token or capability decision
    /// fails.
    pub fn reset_strikes(&self, token: &str, agent: &str) -> Result<(), ServiceError> {
        let claims = self.require_session(token, Operation::StrikeReset)?;
        let subject = AgentId::parse(agent)?;

        self.registry.reset_strikes(&subject);
        self.record_event(
            &subject,
            ActionKind::StrikeReset,
            ThreatLevel::Info,
            PqcStatusKind::Safe,
            metadata([("admin", MetadataValue::from(claims.agent_id.to_string()))]),
        )?;
        Ok(())
    }

    /// Designates an heir for the calling agent.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the token is invalid or the heir
    /// address malformed.
    pub fn designate_heir(&self, token: &str, heir: &str) -> Result<(), ServiceError> {
        let claims = self.session_claims(token)?;
        let heir_id = AgentId::parse(heir)?;
        self.registry.designate_heir(&claims.agent_id, heir_id);
        Ok(())
    }

    /// Executes a signed heir claim over an inactive agent.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the claim fails validation.
    pub fn claim_heir(&self, claim: &HeirClaim) -> Result<(), ServiceError> {
        let profile = self
            .registry
            .get(&claim.original)
            .ok_or(AccessDenied::UnknownAgent)
            .map_err(ServiceError::Denied)?;

        verify_heir_claim(claim, &profile, self.config.heir_inactivity, Utc::now())?;

        self.registry.transfer_to_heir(&claim.original, &claim.heir);
        let moved = self
            .engine
            .reassign_keys(&claim.original, &claim.heir)
            .map_err(ServiceError::Crypto)?;

        self.record_event(
            &claim.original,
            ActionKind::HeirTransfer,
            ThreatLevel::Alert,
            PqcStatusKind::Safe,
            metadata([
                ("rule", MetadataValue::from(RuleCode::Rc102.to_string())),
                ("heir", MetadataValue::from(claim.heir.to_string())),
                (
                    "keys_transferred",
                    MetadataValue::from(i64::try_from(moved).unwrap_or(i64::MAX)),
                ),
            ]),
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The record pipeline (for workers and diagnostics).
    #[must_use]
    pub fn pipeline(&self) -> &AsrPipeline {
        &self.pipeline
    }

    /// The agent registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The threat engine.
    #[must_use]
    pub fn threat(&self) -> &Arc<ThreatEngine> {
        &self.threat
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &SentinelConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn session_claims(&self, token: &str) -> Result<SessionClaims, ServiceError> {
        Ok(self.auth.session().validate(token)?)
    }

    /// Token check plus capability decision; denials are audited and
    /// scored before the error propagates.
    fn require_session(
        &self,
        token: &str,
        operation: Operation,
    ) -> Result<SessionClaims, ServiceError> {
        let claims = self.session_claims(token)?;
        let tier = self.threat.tier(&claims.agent_id);

        if let Err(denied) = self.access.authorize(&claims.agent_id, operation, tier) {
            self.record_denial(&claims.agent_id, &denied)?;
            return Err(denied.into());
        }
        Ok(claims)
    }

    /// Secret-key operations are confined to the key's owner (or an
    /// admin). Encrypting *to* a key needs no ownership.
    fn require_key_owner(
        &self,
        claims: &SessionClaims,
        key_id: &str,
    ) -> Result<(), ServiceError> {
        let metadata = self.engine.key_metadata(key_id)?;
        self.require_self_or_admin(claims, &metadata.owner)
    }

    fn require_self_or_admin(
        &self,
        claims: &SessionClaims,
        subject: &AgentId,
    ) -> Result<(), ServiceError> {
        // The registry holds the live role; the token only records the
        // role at issuance.
        let role = self
            .registry
            .get(&claims.agent_id)
            .map_or(claims.role, |profile| profile.role);
        if claims.agent_id == *subject || role == Role::Admin {
            return Ok(());
        }
        let denied = AccessDenied::RoleRequired {
            required: Role::Admin,
            actual: role,
        };
        self.record_denial(&claims.agent_id, &denied)?;
        Err(denied.into())
    }

    fn record_denial(
        &self,
        agent_id: &AgentId,
        denied: &AccessDenied,
    ) -> Result<(), ServiceError> {
        match denied {
            AccessDenied::RateLimited { limit } => {
                self.note_threat(agent_id, ThreatFactor::RateLimitHit)?;
                self.record_event(
                    agent_id,
                    ActionKind::RateLimitHit,
                    ThreatLevel::Caution,
                    PqcStatusKind::Safe,
                    metadata([("limit", MetadataValue::from(*limit))]),
                )?;
            },
            _ => {
                self.note_threat(agent_id, ThreatFactor::AccessViolation)?;
                self.record_event(
                    agent_id,
                    ActionKind::AccessViolation,
                    ThreatLevel::Alert,
                    PqcStatusKind::Safe,
                    metadata([("reason", MetadataValue::from(denied.to_string()))]),
                )?;

                // An already-banned agent cannot accrue further strikes.
                if matches!(denied, AccessDenied::Banned) {
                    return Ok(());
                }
                let outcome = self.registry.issue_strike(agent_id);
                self.record_event(
                    agent_id,
                    ActionKind::Strike,
                    ThreatLevel::Warning,
                    PqcStatusKind::Safe,
                    metadata([
                        ("rule", MetadataValue::from(RuleCode::Rc201.to_string())),
                        ("count", MetadataValue::from(u32::from(outcome.count))),
                    ]),
                )?;
                if outcome.banned_now {
                    self.record_event(
                        agent_id,
                        ActionKind::Ban,
                        ThreatLevel::Critical,
                        PqcStatusKind::Safe,
                        metadata([
                            ("rule", MetadataValue::from(RuleCode::Rc201.to_string())),
                            (
                                "threshold",
                                MetadataValue::from(u32::from(self.registry.strike_threshold())),
                            ),
                        ]),
                    )?;
                }
            },
        }
        Ok(())
    }

    /// Records a successful crypto operation with the key's current
    /// safety classification.
    fn record_crypto_event(
        &self,
        agent_id: &AgentId,
        action: ActionKind,
        key_id: &str,
    ) -> Result<(), ServiceError> {
        let (algorithm, age_days) = match self.engine.key_metadata(key_id) {
            Ok(meta) => (
                meta.algorithm.name().to_string(),
                (Utc::now() - meta.created_at).num_days(),
            ),
            Err(_) => (String::from("unknown"), 0),
        };

        self.record_event(
            agent_id,
            action,
            ThreatLevel::Info,
            determine_pqc_status(&algorithm, age_days),
            metadata([
                ("key_id", MetadataValue::from(key_id)),
                ("algorithm", MetadataValue::from(algorithm)),
            ]),
        )?;
        Ok(())
    }

    fn record_event(
        &self,
        agent_id: &AgentId,
        action: ActionKind,
        threat_level: ThreatLevel,
        pqc_status: PqcStatusKind,
        metadata: Metadata,
    ) -> Result<String, ServiceError> {
        Ok(self.pipeline.submit(EventDescriptor {
            agent_id: agent_id.clone(),
            action,
            threat_level,
            pqc_status,
            metadata,
        })?)
    }

    /// Feeds the threat engine and audits any tier transition exactly
    /// once.
    #[allow(clippy::cast_possible_truncation)] // Scores are clamped to [0, 1000].
    fn note_threat(&self, agent_id: &AgentId, factor: ThreatFactor) -> Result<(), ServiceError> {
        if let Some(TierChange { from, to }) = self.threat.record(agent_id, factor) {
            let pts = self.threat.score(agent_id).total.round() as i64;
            let level = if to > from {
                ThreatLevel::Warning
            } else {
                ThreatLevel::Info
            };
            self.record_event(
                agent_id,
                ActionKind::TierTransition,
                level,
                PqcStatusKind::Safe,
                metadata([
                    ("from", MetadataValue::from(from.to_string())),
                    ("to", MetadataValue::from(to.to_string())),
                    ("pts", MetadataValue::from(pts)),
                ]),
            )?;
        }
        Ok(())
    }
}

/// Builds a metadata map from key/value pairs.
fn metadata<const N: usize>(pairs: [(&str, MetadataValue); N]) -> Metadata {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_status_mapping() {
        let bad = ServiceError::BadInput("nope".into());
        assert_eq!(bad.wire_status(), WireStatus::BadRequest);

        let unauthorized = ServiceError::Unauthenticated(AuthError::InvalidToken);
        assert_eq!(unauthorized.wire_status(), WireStatus::Unauthorized);

        let forbidden = ServiceError::Denied(AccessDenied::Banned);
        assert_eq!(forbidden.wire_status(), WireStatus::Forbidden);

        let crypto = ServiceError::Crypto(PqcError::AuthenticationFailure);
        assert_eq!(crypto.wire_status(), WireStatus::BadRequest);
    }
}
