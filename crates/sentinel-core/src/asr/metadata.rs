//! Dynamic metadata bags for audit records.
//!
//! Metadata is a tagged-variant tree so canonicalization is total and
//! unambiguous: only null, booleans, integers, strings, lists, and maps
//! exist. Floats are rejected at deserialization time rather than
//! silently reformatted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A metadata mapping with deterministically ordered keys.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer; floats are not representable.
    Int(i64),
    /// UTF-8 string.
    Str(String),
    /// Ordered list.
    List(Vec<MetadataValue>),
    /// Nested mapping with sorted keys.
    Map(Metadata),
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for MetadataValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}
