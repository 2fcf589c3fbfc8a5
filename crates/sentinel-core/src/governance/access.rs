//! Roles, tiers, agent registry, and the capability decision.
//!
//! Mutex poisoning indicates a panic in another thread, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::AgentId;
use crate::threat::PtsTier;

/// Agent role lattice. Ordering is authorization strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Never authenticated.
    None,
    /// Standard authenticated agent.
    User,
    /// Elevated operational role.
    Sentinel,
    /// Full administrative access.
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::User => f.write_str("user"),
            Self::Sentinel => f.write_str("sentinel"),
            Self::Admin => f.write_str("admin"),
        }
    }
}

/// Subscription tiers with their capability envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    /// Entry tier, classical crypto only.
    LegacyBuilder,
    /// Standard tier with PQC enabled.
    SentinelCore,
    /// Top tier with PQC and anchoring.
    AutonomousGuild,
}

impl SubscriptionTier {
    /// Requests allowed per minute.
    #[must_use]
    pub const fn quota_per_minute(self) -> u32 {
        match self {
            Self::LegacyBuilder => 5,
            Self::SentinelCore => 10,
            Self::AutonomousGuild => 100,
        }
    }

    /// Whether the tier may use post-quantum operations.
    #[must_use]
    pub const fn pqc_enabled(self) -> bool {
        !matches!(self, Self::LegacyBuilder)
    }

    /// Whether the tier's batches are anchored in real time.
    #[must_use]
    pub const fn anchor_enabled(self) -> bool {
        matches!(self, Self::AutonomousGuild)
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LegacyBuilder => f.write_str("legacy_builder"),
            Self::SentinelCore => f.write_str("sentinel_core"),
            Self::AutonomousGuild => f.write_str("autonomous_guild"),
        }
    }
}

/// Operations subject to the capability decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Hybrid encryption.
    EncryptHybrid,
    /// AES-only encryption.
    EncryptAes,
    /// Decryption.
    Decrypt,
    /// Keypair generation.
    KeyGenerate,
    /// Key rotation.
    KeyRotate,
    /// Audit record retrieval.
    AsrRead,
    /// Threat score retrieval.
    PtsRead,
    /// Administrative strike reset.
    StrikeReset,
}

impl Operation {
    /// Minimum role required to perform the operation.
    #[must_use]
    pub const fn required_role(self) -> Role {
        match self {
            Self::EncryptHybrid
            | Self::EncryptAes
            | Self::Decrypt
            | Self::KeyGenerate
            | Self::AsrRead
            | Self::PtsRead => Role::User,
            Self::KeyRotate => Role::Sentinel,
            Self::StrikeReset => Role::Admin,
        }
    }

    /// Whether the operation stays available under a critical threat
    /// tier.
    #[must_use]
    pub const fn read_only(self) -> bool {
        matches!(self, Self::AsrRead | Self::PtsRead)
    }
}

/// Registered state of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Canonical agent address.
    pub agent_id: AgentId,
    /// Current role.
    pub role: Role,
    /// Subscription tier.
    pub tier: SubscriptionTier,
    /// Rolling strike count, capped at the ban threshold.
    pub strike_count: u8,
    /// Whether the agent was revoked by an heir transfer.
    pub revoked: bool,
    /// Last successful activity.
    pub last_activity: DateTime<Utc>,
    /// Designated heir, if any.
    pub heir: Option<AgentId>,
    /// First-seen instant.
    pub registered_at: DateTime<Utc>,
}

/// Result of issuing a strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrikeOutcome {
    /// Strike count after the strike.
    pub count: u8,
    /// Whether this strike crossed the ban threshold.
    pub banned_now: bool,
}

/// In-memory registry of agent profiles.
pub struct AgentRegistry {
    agents: Mutex<HashMap<AgentId, AgentProfile>>,
    strike_threshold: u8,
}

impl AgentRegistry {
    /// Creates a registry with the given ban threshold.
    #[must_use]
    pub fn new(strike_threshold: u8) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            strike_threshold,
        }
    }

    /// The configured ban threshold.
    #[must_use]
    pub const fn strike_threshold(&self) -> u8 {
        self.strike_threshold
    }

    /// Returns the profile for `agent_id`, creating a `Role::None`
    /// entry on first sight.
    #[must_use]
    pub fn get_or_register(&self, agent_id: &AgentId) -> AgentProfile {
        let mut agents = self.agents.lock().expect("registry lock");
        agents
            .entry(agent_id.clone())
            .or_insert_with(|| fresh_profile(agent_id))
            .clone()
    }

    /// Returns the profile for `agent_id` if it exists.
    #[must_use]
    pub fn get(&self, agent_id: &AgentId) -> Option<AgentProfile> {
        self.agents
            .lock()
            .expect("registry lock")
            .get(agent_id)
            .cloned()
    }

    /// Whether the agent is banned (strike count at the threshold).
    #[must_use]
    pub fn is_banned(&self, agent_id: &AgentId) -> bool {
        self.get(agent_id)
            .is_some_and(|profile| profile.strike_count >= self.strike_threshold)
    }

    /// Promotes a never-authenticated agent to `User`; no-op otherwise.
    pub fn mark_authenticated(&self, agent_id: &AgentId) {
        self.update(agent_id, |profile| {
            if profile.role == Role::None {
                profile.role = Role::User;
            }
            profile.last_activity = Utc::now();
        });
    }

    /// Records activity for the agent.
    pub fn note_activity(&self, agent_id: &AgentId) {
        self.update(agent_id, |profile| profile.last_activity = Utc::now());
    }

    /// Sets the agent's role.
    pub fn set_role(&self, agent_id: &AgentId, role: Role) {
        self.update(agent_id, |profile| profile.role = role);
    }

    /// Sets the agent's subscription tier.
    pub fn set_tier(&self, agent_id: &AgentId, tier: SubscriptionTier) {
        self.update(agent_id, |profile| profile.tier = tier);
    }

    /// Designates an heir for the agent.
    pub fn designate_heir(&self, agent_id: &AgentId, heir: AgentId) {
        self.update(agent_id, |profile| profile.heir = Some(heir));
    }

    /// Issues a strike, capping at the ban threshold.
    #[must_use]
    pub fn issue_strike(&self, agent_id: &AgentId) -> StrikeOutcome {
        let mut agents = self.agents.lock().expect("registry lock");
        let profile = agents
            .entry(agent_id.clone())
            .or_insert_with(|| fresh_profile(agent_id));

        let was_banned = profile.strike_count >= self.strike_threshold;
        profile.strike_count = profile
            .strike_count
            .saturating_add(1)
            .min(self.strike_threshold);
        let banned = profile.strike_count >= self.strike_threshold;

        StrikeOutcome {
            count: profile.strike_count,
            banned_now: banned && !was_banned,
        }
    }

    /// Clears strikes and the ban (admin action). Restores `User` if
    /// the ban had been in place.
    pub fn reset_strikes(&self, agent_id: &AgentId) {
        self.update(agent_id, |profile| {
            profile.strike_count = 0;
            if profile.role == Role::None {
                profile.role = Role::User;
            }
        });
    }

    /// Executes the registry half of an heir transfer: the heir takes
    /// over as `User`, the original is revoked and demoted.
    pub fn transfer_to_heir(&self, original: &AgentId, heir: &AgentId) {
        let mut agents = self.agents.lock().expect("registry lock");

        if let Some(profile) = agents.get_mut(original) {
            profile.revoked = true;
            profile.role = Role::None;
            profile.heir = None;
        }

        let heir_profile = agents
            .entry(heir.clone())
            .or_insert_with(|| fresh_profile(heir));
        if heir_profile.role == Role::None {
            heir_profile.role = Role::User;
        }
        heir_profile.last_activity = Utc::now();
    }

    fn update(&self, agent_id: &AgentId, f: impl FnOnce(&mut AgentProfile)) {
        let mut agents = self.agents.lock().expect("registry lock");
        let profile = agents
            .entry(agent_id.clone())
            .or_insert_with(|| fresh_profile(agent_id));
        f(profile);
    }
}

fn fresh_profile(agent_id: &AgentId) -> AgentProfile {
    let now = Utc::now();
    AgentProfile {
        agent_id: agent_id.clone(),
        role: Role::None,
        tier: SubscriptionTier::LegacyBuilder,
        strike_count: 0,
        revoked: false,
        last_activity: now,
        heir: None,
        registered_at: now,
    }
}

/// Reasons an operation is denied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessDenied {
    /// The agent has reached the strike threshold.
    #[error("agent is banned")]
    Banned,

    /// The agent was revoked by an heir transfer.
    #[error("agent is revoked")]
    Revoked,

    /// The agent has never authenticated.
    #[error("unknown agent")]
    UnknownAgent,

    /// The agent's role is insufficient.
    #[error("operation requires role {required}, agent has {actual}")]
    RoleRequired {
        /// Minimum role for the operation.
        required: Role,
        /// The agent's current role.
        actual: Role,
    },

    /// The agent's threat tier is critical and the operation mutates.
    #[error("threat tier is critical: operation locked")]
    CriticalTierLocked,

    /// The per-minute quota is exhausted.
    #[error("rate limit exceeded: {limit} requests per minute")]
    RateLimited {
        /// The quota that was hit.
        limit: u32,
    },
}

/// Fixed-window quota state: requests per `(agent, minute)`.
type QuotaMap = HashMap<(AgentId, i64), u32>;

/// The capability decision point.
pub struct AccessController {
    registry: std::sync::Arc<AgentRegistry>,
    quotas: Mutex<QuotaMap>,
    default_quota: u32,
}

impl AccessController {
    /// Creates a controller over the shared registry.
    #[must_use]
    pub fn new(registry: std::sync::Arc<AgentRegistry>, default_quota: u32) -> Self {
        Self {
            registry,
            quotas: Mutex::new(HashMap::new()),
            default_quota,
        }
    }

    /// Decides whether `agent_id` may perform `operation` now.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] naming the first failed check, in the
    /// fixed order: ban, role, critical-tier lockdown, quota.
    pub fn authorize(
        &self,
        agent_id: &AgentId,
        operation: Operation,
        tier: PtsTier,
    ) -> Result<(), AccessDenied> {
        self.authorize_at(agent_id, operation, tier, Utc::now())
    }

    /// [`Self::authorize`] with an explicit clock, for tests.
    ///
    /// # Errors
    ///
    /// See [`Self::authorize`].
    pub fn authorize_at(
        &self,
        agent_id: &AgentId,
        operation: Operation,
        tier: PtsTier,
        now: DateTime<Utc>,
    ) -> Result<(), AccessDenied> {
        let Some(profile) = self.registry.get(agent_id) else {
            return Err(AccessDenied::UnknownAgent);
        };

        if profile.strike_count >= self.registry.strike_threshold() {
            return Err(AccessDenied::Banned);
        }
        if profile.revoked {
            return Err(AccessDenied::Revoked);
        }
        if profile.role < operation.required_role() {
            return Err(AccessDenied::RoleRequired {
                required: operation.required_role(),
                actual: profile.role,
            });
        }
        if tier == PtsTier::Critical && !operation.read_only() {
            return Err(AccessDenied::CriticalTierLocked);
        }

        let limit = if profile.tier.quota_per_minute() > 0 {
            profile.tier.quota_per_minute()
        } else {
            self.default_quota
        };
        self.consume_quota(agent_id, limit, now)?;

        self.registry.note_activity(agent_id);
        Ok(())
    }

    fn consume_quota(
        &self,
        agent_id: &AgentId,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<(), AccessDenied> {
        let minute = now.timestamp() / 60;
        let mut quotas = self.quotas.lock().expect("quota lock");

        // Old windows are dead weight; drop them once the map grows.
        if quotas.len() > 1024 {
            quotas.retain(|(_, m), _| *m == minute);
        }

        let count = quotas.entry((agent_id.clone(), minute)).or_insert(0);
        if *count >= limit {
            return Err(AccessDenied::RateLimited { limit });
        }
        *count += 1;
        Ok(())
    }
}
