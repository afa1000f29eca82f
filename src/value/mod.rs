//! In-memory value objects.
//!
//! A [`Value`] is the opaque unit the cache stores against a key: a byte
//! string, a list, a set, a sorted set, or a hash. The store never
//! introspects values — it only moves them between the in-memory dictionary
//! and the disk payload codec in [`crate::payload`].
//!
//! Collections use ordered containers so that the encoded byte
//! representation of a value is deterministic.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

/// Error returned when a payload carries an unrecognised type tag.
#[derive(Debug, Error)]
#[error("unknown value type tag: {0}")]
pub struct UnknownTypeTag(pub u8);

/// The type of a [`Value`], carried as a one-byte tag in disk payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    /// Plain byte string.
    Str = 0,
    /// Ordered list of byte strings.
    List = 1,
    /// Unordered set of unique byte strings.
    Set = 2,
    /// Set of members each scored by a float.
    ZSet = 3,
    /// Field → value map.
    Hash = 4,
}

impl ValueKind {
    /// Decodes a payload type tag back into a kind.
    pub fn from_tag(tag: u8) -> Result<Self, UnknownTypeTag> {
        match tag {
            0 => Ok(ValueKind::Str),
            1 => Ok(ValueKind::List),
            2 => Ok(ValueKind::Set),
            3 => Ok(ValueKind::ZSet),
            4 => Ok(ValueKind::Hash),
            other => Err(UnknownTypeTag(other)),
        }
    }

    /// Human-readable type name, as reported by `TYPE`-style commands.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Str => "string",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::ZSet => "zset",
            ValueKind::Hash => "hash",
        }
    }
}

/// A value object held in the in-memory dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Plain byte string.
    Str(Vec<u8>),
    /// Ordered list of byte strings.
    List(Vec<Vec<u8>>),
    /// Set of unique byte strings.
    Set(BTreeSet<Vec<u8>>),
    /// Member → score map; iteration order is member order.
    ZSet(BTreeMap<Vec<u8>, f64>),
    /// Field → value map.
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
}

impl Value {
    /// Returns the kind tag for this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Set(_) => ValueKind::Set,
            Value::ZSet(_) => ValueKind::ZSet,
            Value::Hash(_) => ValueKind::Hash,
        }
    }

    /// Convenience constructor for string values.
    pub fn string(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Str(bytes.into())
    }

    /// Returns the string contents, or `None` for non-string values.
    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            Value::Str(bytes) => Some(bytes),
            _ => None,
        }
    }
}
