//! Entity identifiers.
//!
//! Persisted entities are addressed by a [`TaggedId`] such as `a:1`: the short
//! tag of their entity type plus the surrogate key. Unsaved entities carry a
//! session-local placeholder (`#3`) until commit assigns the permanent id.
//! Inside a session every entity is also reachable through a copyable
//! [`EntityRef`] handle that stays stable across id promotion.

use crate::value::Value;
use serde::Serialize;
use std::fmt;

/// The value part of a persisted id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum IdValue {
    /// Integer surrogate key.
    Int(i64),
    /// UUID surrogate key.
    Uuid([u8; 16]),
}

impl IdValue {
    /// Parse the value part of a tagged id.
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(i) = s.parse::<i64>() {
            return Some(IdValue::Int(i));
        }
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(IdValue::Uuid(bytes))
    }

    /// Convert to a column value.
    pub fn to_value(&self) -> Value {
        match self {
            IdValue::Int(i) => Value::BigInt(*i),
            IdValue::Uuid(u) => Value::Uuid(*u),
        }
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Int(i) => write!(f, "{i}"),
            IdValue::Uuid(u) => {
                for (i, b) in u.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        f.write_str("-")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// A permanent, type-tagged entity id (`a:1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaggedId {
    tag: &'static str,
    value: IdValue,
}

impl TaggedId {
    /// Create a tagged id.
    pub const fn new(tag: &'static str, value: IdValue) -> Self {
        Self { tag, value }
    }

    /// Create an integer tagged id.
    pub const fn int(tag: &'static str, value: i64) -> Self {
        Self {
            tag,
            value: IdValue::Int(value),
        }
    }

    /// The entity type tag.
    pub const fn tag(&self) -> &'static str {
        self.tag
    }

    /// The surrogate key.
    pub const fn value(&self) -> IdValue {
        self.value
    }
}

impl fmt::Display for TaggedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.value)
    }
}

/// The id an entity currently carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EntityId {
    /// Session-local id of an entity that has not been assigned a permanent id.
    Placeholder(u64),
    /// Permanent id.
    Persisted(TaggedId),
}

impl EntityId {
    /// The permanent id, if one has been assigned.
    pub fn persisted(&self) -> Option<TaggedId> {
        match self {
            EntityId::Placeholder(_) => None,
            EntityId::Persisted(id) => Some(*id),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, EntityId::Placeholder(_))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Placeholder(n) => write!(f, "#{n}"),
            EntityId::Persisted(id) => id.fmt(f),
        }
    }
}

impl From<TaggedId> for EntityId {
    fn from(id: TaggedId) -> Self {
        EntityId::Persisted(id)
    }
}

/// Handle to an entity tracked by a session.
///
/// Handles are only meaningful for the session that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityRef(u32);

impl EntityRef {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity@{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_id_display() {
        assert_eq!(TaggedId::int("a", 1).to_string(), "a:1");
        assert_eq!(EntityId::Placeholder(3).to_string(), "#3");
        assert_eq!(EntityId::from(TaggedId::int("b", 12)).to_string(), "b:12");
    }

    #[test]
    fn test_uuid_round_trip_through_display() {
        let bytes = [
            0x55, 0x0e, 0x84, 0x00, 0xe2, 0x9b, 0x41, 0xd4, 0xa7, 0x16, 0x44, 0x66, 0x55, 0x44,
            0x00, 0x00,
        ];
        let id = TaggedId::new("t", IdValue::Uuid(bytes));
        assert_eq!(id.to_string(), "t:550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(
            IdValue::parse("550e8400-e29b-41d4-a716-446655440000"),
            Some(IdValue::Uuid(bytes))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(IdValue::parse("12"), Some(IdValue::Int(12)));
        assert_eq!(IdValue::parse("abc"), None);
        assert_eq!(IdValue::parse(""), None);
    }

    #[test]
    fn test_placeholder_has_no_persisted_id() {
        assert!(EntityId::Placeholder(1).persisted().is_none());
        assert!(EntityId::Placeholder(1).is_placeholder());
        let id = TaggedId::int("a", 7);
        assert_eq!(EntityId::from(id).persisted(), Some(id));
    }
}
