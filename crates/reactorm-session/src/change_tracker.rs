//! Change tracking for persisted entities.
//!
//! Each persisted entity records the original value of a column the first
//! time it is written. Writing the original value back removes the entry, so
//! an entity is dirty exactly when it still has originals.
//!
//! Separately, the session keeps a [`ChangeLog`] of field writes, creations
//! and deletions since the reaction engine last drained it.

use reactorm_core::{EntityRef, TaggedId, Value};
use std::collections::{BTreeMap, HashSet};

/// A reference slot as stored: unset, a not-yet-resolved id, or a tracked entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RefValue {
    Null,
    /// A foreign key read from a row; resolved through the identity map on access.
    Id(TaggedId),
    Entity(EntityRef),
}

/// The value a column had before the first write since the last commit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Original {
    Value(Value),
    Reference(RefValue),
}

/// Per-entity map from column name to its original value.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangeTracker {
    originals: BTreeMap<&'static str, Original>,
}

impl ChangeTracker {
    pub fn is_dirty(&self) -> bool {
        !self.originals.is_empty()
    }

    pub fn original(&self, field: &str) -> Option<&Original> {
        self.originals.get(field)
    }

    /// Record `old` as the original of `field` unless one is already kept.
    /// Returns the kept original.
    pub fn record(&mut self, field: &'static str, old: Original) -> &Original {
        self.originals.entry(field).or_insert(old)
    }

    /// Forget `field`: its current value equals the original again.
    pub fn revert(&mut self, field: &str) {
        self.originals.remove(field);
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        self.originals.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.originals.clear();
    }
}

/// One entry of the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Change {
    Field(EntityRef, &'static str),
    Created(EntityRef),
    Deleted(EntityRef),
}

impl Change {
    pub fn entity(&self) -> EntityRef {
        match self {
            Change::Field(e, _) | Change::Created(e) | Change::Deleted(e) => *e,
        }
    }
}

/// Changes since the reaction engine last looked.
///
/// Each change is kept once, in first-seen order, so a session that never
/// commits holds at most one entry per entity and field.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangeLog {
    entries: Vec<Change>,
    seen: HashSet<Change>,
}

impl ChangeLog {
    pub fn push(&mut self, change: Change) {
        if self.seen.insert(change) {
            self.entries.push(change);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Take every entry.
    pub fn drain(&mut self) -> Vec<Change> {
        self.seen.clear();
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }
}
