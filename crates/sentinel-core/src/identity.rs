//! Agent identity handling.
//!
//! An agent is identified by a 20-byte blockchain address. Addresses are
//! canonicalized to lowercase hexadecimal with a `0x` prefix at parse
//! time so that every downstream comparison (auth recovery, registry
//! lookups, ASR queries) operates on a single representation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the raw address in bytes.
pub const ADDRESS_SIZE: usize = 20;

/// Errors produced when parsing an agent identity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The address is missing the `0x` prefix.
    #[error("address must start with 0x: {input}")]
    MissingPrefix {
        /// The offending input.
        input: String,
    },

    /// The address body is not 40 hex characters.
    #[error("address must be 20 bytes of hex, got {len} characters")]
    BadLength {
        /// Number of hex characters found.
        len: usize,
    },

    /// The address contains non-hexadecimal characters.
    #[error("address contains non-hex characters")]
    NotHex,
}

/// A canonicalized agent identity: `0x` followed by 40 lowercase hex
/// characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Parses and canonicalizes an address string.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the input is not a `0x`-prefixed
    /// 20-byte hex address.
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        let body = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
            .ok_or_else(|| IdentityError::MissingPrefix {
                input: input.to_string(),
            })?;

        if body.len() != ADDRESS_SIZE * 2 {
            return Err(IdentityError::BadLength { len: body.len() });
        }
        if !body.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdentityError::NotHex);
        }

        Ok(Self(format!("0x{}", body.to_ascii_lowercase())))
    }

    /// Builds an identity from raw address bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; ADDRESS_SIZE]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    /// Returns the canonical string form (`0x` + 40 lowercase hex chars).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_canonicalizes_case() {
        let id = AgentId::parse("0x00A329C0648769A73afAc7F9381E08FB43dBEA72").unwrap();
        assert_eq!(id.as_str(), "0x00a329c0648769a73afac7f9381e08fb43dbea72");
    }

    #[test]
    fn parse_rejects_missing_prefix() {
        let err = AgentId::parse("00a329c0648769a73afac7f9381e08fb43dbea72").unwrap_err();
        assert!(matches!(err, IdentityError::MissingPrefix { .. }));
    }

    #[test]
    fn parse_rejects_short_input() {
        let err = AgentId::parse("0xabcd").unwrap_err();
        assert_eq!(err, IdentityError::BadLength { len: 4 });
    }

    #[test]
    fn parse_rejects_non_hex() {
        let err = AgentId::parse("0xzza329c0648769a73afac7f9381e08fb43dbea72").unwrap_err();
        assert_eq!(err, IdentityError::NotHex);
    }

    #[test]
    fn from_bytes_round_trips() {
        let bytes = [0xab; ADDRESS_SIZE];
        let id = AgentId::from_bytes(&bytes);
        assert_eq!(AgentId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn serde_round_trip_enforces_canonical_form() {
        let json = "\"0x00A329C0648769A73AFAC7F9381E08FB43DBEA72\"";
        let id: AgentId = serde_json::from_str(json).unwrap();
        assert_eq!(id.as_str(), "0x00a329c0648769a73afac7f9381e08fb43dbea72");

        let bad: Result<AgentId, _> = serde_json::from_str("\"not-an-address\"");
        assert!(bad.is_err());
    }
}
