//! Identity map: at most one tracked entity per permanent id.
//!
//! Keys combine the entity type with the surrogate key, so the same numeric
//! id under two different types never collides. Loading a row whose id is
//! already mapped returns the existing handle and leaves its in-memory state
//! untouched.

use reactorm_core::{EntityRef, IdValue, TaggedId};
use std::collections::HashMap;

/// Unique key for an entity in the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Entity type tag.
    tag: &'static str,
    /// Surrogate key value.
    value: IdValue,
}

impl ObjectKey {
    pub fn from_id(id: &TaggedId) -> Self {
        Self {
            tag: id.tag(),
            value: id.value(),
        }
    }
}

/// Maps permanent ids to session handles.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, EntityRef>,
}

impl IdentityMap {
    pub fn get(&self, id: &TaggedId) -> Option<EntityRef> {
        self.entries.get(&ObjectKey::from_id(id)).copied()
    }

    pub fn contains(&self, id: &TaggedId) -> bool {
        self.entries.contains_key(&ObjectKey::from_id(id))
    }

    /// Map `id` to `entity`. An existing mapping wins and is returned.
    pub fn insert(&mut self, id: &TaggedId, entity: EntityRef) -> EntityRef {
        *self.entries.entry(ObjectKey::from_id(id)).or_insert(entity)
    }

    pub fn remove(&mut self, id: &TaggedId) -> Option<EntityRef> {
        self.entries.remove(&ObjectKey::from_id(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_mapping_wins() {
        let mut map = IdentityMap::default();
        let id = TaggedId::int("a", 1);
        assert_eq!(map.insert(&id, EntityRef::new(0)), EntityRef::new(0));
        assert_eq!(map.insert(&id, EntityRef::new(5)), EntityRef::new(0));
        assert_eq!(map.get(&id), Some(EntityRef::new(0)));
    }

    #[test]
    fn test_same_value_different_tags() {
        let mut map = IdentityMap::default();
        map.insert(&TaggedId::int("a", 1), EntityRef::new(0));
        map.insert(&TaggedId::int("b", 1), EntityRef::new(1));
        assert_eq!(map.get(&TaggedId::int("b", 1)), Some(EntityRef::new(1)));
        assert_eq!(map.get(&TaggedId::int("a", 1)), Some(EntityRef::new(0)));
    }

    #[test]
    fn test_remove() {
        let mut map = IdentityMap::default();
        let id = TaggedId::int("a", 1);
        map.insert(&id, EntityRef::new(0));
        assert_eq!(map.remove(&id), Some(EntityRef::new(0)));
        assert!(!map.contains(&id));
        assert!(map.remove(&id).is_none());
    }
}
