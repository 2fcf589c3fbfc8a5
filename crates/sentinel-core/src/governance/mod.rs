//! Governance: agent registry, rule codes, and access control.
//!
//! Four rule codes constrain every request path:
//!
//! - **RC-1.01** - mutating operations require a valid session token.
//! - **RC-1.02** - prolonged inactivity lets a designated heir claim the
//!   agent's role and key ownership.
//! - **RC-2.01** - three strikes ban the agent until an admin reset.
//! - **RC-3.02** - anchor failures route through a secondary sink
//!   before a batch is marked failed.
//!
//! The capability decision itself is a fixed sequence: ban check, role
//! check, threat-tier lockdown, then the per-minute quota.

mod access;
mod rules;

pub use access::{
    AccessController, AccessDenied, AgentProfile, AgentRegistry, Operation, Role, StrikeOutcome,
    SubscriptionTier,
};
pub use rules::{heir_claim_message, verify_heir_claim, HeirClaim, HeirClaimError, RuleCode};
