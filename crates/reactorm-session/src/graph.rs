//! The in-memory entity graph owned by a session.
//!
//! Entities live in an arena addressed by [`EntityRef`]. Each entity stores
//! one [`Slot`] per declared field, in declaration order. References read
//! from rows stay as ids until accessed and resolve through the identity map
//! at read time, so loading a target later makes the reference readable
//! without touching the referencing entity.
//!
//! All reads here are pure: reactive values are computed on the fly from
//! loaded data and fall back to the last stored value only when the data is
//! not loaded.

use crate::change_tracker::{ChangeLog, ChangeTracker, Original, RefValue};
use crate::identity_map::IdentityMap;
use reactorm_core::{
    EntityId, EntityMetadata, EntityReader, EntityRef, Error, FieldKind, FieldMeta, Metadata,
    Result, Row, TaggedId, TypeError, Value,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ObjectState {
    /// Created in this session, not yet written.
    New,
    /// Loaded from (or written to) the store.
    Persistent,
    /// Persistent and marked for deletion at the next commit.
    Deleted,
    /// No longer part of the unit of work: a new entity deleted before
    /// commit, or an entity whose deletion was committed.
    Detached,
}

/// Loaded state of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CollectionSlot {
    pub loaded: bool,
    pub items: Vec<EntityRef>,
}

impl CollectionSlot {
    pub fn loaded(items: Vec<EntityRef>) -> Self {
        Self {
            loaded: true,
            items,
        }
    }
}

/// Storage for one field of one entity.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    Value(Value),
    /// A reactive value that has never been computed or loaded.
    Unset,
    Reference(RefValue),
    Collection(CollectionSlot),
    /// Recursive relations store nothing of their own.
    Walk,
}

impl Slot {
    /// Initial slot of a freshly created entity.
    pub fn for_new(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Primitive { .. } => Slot::Value(Value::Null),
            FieldKind::ManyToOne { .. }
            | FieldKind::Polymorphic { .. }
            | FieldKind::ReactiveReference { .. } => Slot::Reference(RefValue::Null),
            FieldKind::OneToMany { .. }
            | FieldKind::OneToOne { .. }
            | FieldKind::ManyToMany { .. } => Slot::Collection(CollectionSlot::loaded(Vec::new())),
            FieldKind::ReactiveField { .. } => Slot::Unset,
            FieldKind::ReactiveCollection { .. } => Slot::Collection(CollectionSlot::default()),
            FieldKind::Recursive { .. } => Slot::Walk,
        }
    }

    /// Slot of an entity materialized from a stored row.
    pub fn from_row(field: &FieldMeta, row: &Row) -> Self {
        match &field.kind {
            FieldKind::Primitive { .. } => Slot::Value(row.get(field.name)),
            FieldKind::ReactiveField { persisted, .. } => {
                if *persisted {
                    Slot::Value(row.get(field.name))
                } else {
                    Slot::Unset
                }
            }
            FieldKind::ManyToOne { .. }
            | FieldKind::Polymorphic { .. }
            | FieldKind::ReactiveReference { .. } => Slot::Reference(
                row.reference(field.name)
                    .map_or(RefValue::Null, RefValue::Id),
            ),
            FieldKind::OneToMany { .. }
            | FieldKind::OneToOne { .. }
            | FieldKind::ManyToMany { .. }
            | FieldKind::ReactiveCollection { .. } => Slot::Collection(CollectionSlot::default()),
            FieldKind::Recursive { .. } => Slot::Walk,
        }
    }

    /// Drop state that was derived in memory rather than read from a row.
    fn forget_derived(&mut self, kind: &FieldKind) {
        match kind {
            FieldKind::OneToMany { .. }
            | FieldKind::OneToOne { .. }
            | FieldKind::ManyToMany { .. }
            | FieldKind::ReactiveCollection { .. } => *self = Slot::Collection(CollectionSlot::default()),
            FieldKind::ReactiveField { persisted: false, .. } => *self = Slot::Unset,
            _ => {}
        }
    }
}

/// One tracked entity.
#[derive(Debug, Clone)]
pub(crate) struct EntityData {
    pub entity_type: &'static str,
    pub id: EntityId,
    pub state: ObjectState,
    pub slots: Vec<Slot>,
    pub changes: ChangeTracker,
}

impl EntityData {
    /// New or persistent: visible to reads, searches and collections.
    pub fn is_live(&self) -> bool {
        matches!(self.state, ObjectState::New | ObjectState::Persistent)
    }
}

/// A reference slot after identity map lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolved {
    Null,
    Entity(EntityRef),
    /// Points at a row that has not been loaded.
    Missing(TaggedId),
}

impl Resolved {
    pub fn entity(self) -> Option<EntityRef> {
        match self {
            Resolved::Entity(e) => Some(e),
            Resolved::Null | Resolved::Missing(_) => None,
        }
    }
}

/// Canonical key of a pending join row between two tracked entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct LinkKey {
    pub table: &'static str,
    pub sides: [(&'static str, EntityRef); 2],
}

impl LinkKey {
    pub fn new(
        table: &'static str,
        left: (&'static str, EntityRef),
        right: (&'static str, EntityRef),
    ) -> Self {
        let sides = if left.0 <= right.0 {
            [left, right]
        } else {
            [right, left]
        };
        Self { table, sides }
    }

    /// The entity on the other side from `column`.
    pub fn other(&self, column: &str) -> Option<EntityRef> {
        match self.sides {
            [(c, _), (_, e)] if c == column => Some(e),
            [(_, e), (c, _)] if c == column => Some(e),
            _ => None,
        }
    }

    pub fn side(&self, column: &str) -> Option<EntityRef> {
        self.sides.iter().find(|(c, _)| *c == column).map(|(_, e)| *e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkDelta {
    Added,
    Removed,
}

/// Join rows added or removed since the last commit.
///
/// Adding then removing the same pair (or the reverse) cancels out.
#[derive(Debug, Clone, Default)]
pub(crate) struct LinkDeltas {
    entries: BTreeMap<LinkKey, LinkDelta>,
}

impl LinkDeltas {
    pub fn get(&self, key: &LinkKey) -> Option<LinkDelta> {
        self.entries.get(key).copied()
    }

    pub fn insert(&mut self, key: LinkKey, delta: LinkDelta) {
        self.entries.insert(key, delta);
    }

    pub fn remove(&mut self, key: &LinkKey) {
        self.entries.remove(key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LinkKey, LinkDelta)> {
        self.entries.iter().map(|(k, d)| (k, *d))
    }

    /// Partners of `entity` through `column` of `table`, with their delta.
    pub fn partners<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
        entity: EntityRef,
    ) -> impl Iterator<Item = (EntityRef, LinkDelta)> + 'a {
        self.entries.iter().filter_map(move |(key, delta)| {
            if key.table == table && key.side(column) == Some(entity) {
                key.other(column).map(|other| (other, *delta))
            } else {
                None
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// All entities tracked by a session plus the bookkeeping that must roll
/// back together with them.
#[derive(Debug, Clone, Default)]
pub(crate) struct EntityGraph {
    pub entities: Vec<EntityData>,
    pub identity: IdentityMap,
    /// Tracked entities per type, excluding detached ones.
    pub by_type: HashMap<&'static str, BTreeSet<EntityRef>>,
    /// Ids looked up in the store and not found.
    pub not_found: HashSet<TaggedId>,
    pub links: LinkDeltas,
    pub log: ChangeLog,
}

impl EntityGraph {
    pub fn push(&mut self, data: EntityData) -> EntityRef {
        let e = EntityRef::new(self.entities.len() as u32);
        if let Some(id) = data.id.persisted() {
            self.identity.insert(&id, e);
        }
        self.by_type.entry(data.entity_type).or_default().insert(e);
        self.entities.push(data);
        e
    }

    /// Roll back to `snapshot`, taken when a commit started, without
    /// invalidating handles given out since.
    ///
    /// The arena never shrinks. Rows loaded after the snapshot stay tracked
    /// with their stored values; entities created after it are detached.
    pub fn restore(&mut self, metadata: &Metadata, snapshot: EntityGraph) {
        let current = std::mem::replace(self, snapshot);
        let start = self.entities.len();
        for (i, mut data) in current.entities.into_iter().enumerate().skip(start) {
            let e = EntityRef::new(i as u32);
            let loaded = matches!(data.state, ObjectState::Persistent | ObjectState::Deleted);
            match (loaded, data.id.persisted()) {
                (true, Some(id)) => {
                    data.state = ObjectState::Persistent;
                    if let Ok(meta) = metadata.entity(data.entity_type) {
                        let EntityData { slots, changes, .. } = &mut data;
                        for (fm, slot) in meta.fields().iter().zip(slots.iter_mut()) {
                            match changes.original(fm.name) {
                                Some(Original::Value(v)) => *slot = Slot::Value(v.clone()),
                                Some(Original::Reference(r)) => *slot = Slot::Reference(r.clone()),
                                None => slot.forget_derived(&fm.kind),
                            }
                        }
                    }
                    self.identity.insert(&id, e);
                    self.by_type.entry(data.entity_type).or_default().insert(e);
                }
                _ => data.state = ObjectState::Detached,
            }
            data.changes.clear();
            self.entities.push(data);
        }
        for id in current.not_found {
            if !self.identity.contains(&id) {
                self.not_found.insert(id);
            }
        }
    }

    pub fn entity(&self, e: EntityRef) -> Result<&EntityData> {
        self.entities.get(e.index()).ok_or(Error::UnknownEntity(e))
    }

    pub fn entity_mut(&mut self, e: EntityRef) -> Result<&mut EntityData> {
        self.entities.get_mut(e.index()).ok_or(Error::UnknownEntity(e))
    }

    pub fn is_live(&self, e: EntityRef) -> bool {
        self.entity(e).is_ok_and(EntityData::is_live)
    }

    /// Tracked entities of a type (new, persistent or marked deleted).
    pub fn of_type(&self, entity_type: &str) -> impl Iterator<Item = EntityRef> + '_ {
        self.by_type.get(entity_type).into_iter().flatten().copied()
    }

    pub fn count_of_type(&self, entity_type: &str) -> usize {
        self.by_type.get(entity_type).map_or(0, BTreeSet::len)
    }

    /// Stop tracking `e` by type and id.
    pub fn detach(&mut self, e: EntityRef) {
        let Ok(data) = self.entity_mut(e) else {
            return;
        };
        data.state = ObjectState::Detached;
        let (entity_type, id) = (data.entity_type, data.id);
        if let Some(set) = self.by_type.get_mut(entity_type) {
            set.remove(&e);
        }
        if let Some(id) = id.persisted() {
            if self.identity.get(&id) == Some(e) {
                self.identity.remove(&id);
            }
        }
    }

    pub fn resolve(&self, value: &RefValue) -> Resolved {
        match value {
            RefValue::Null => Resolved::Null,
            RefValue::Entity(e) => Resolved::Entity(*e),
            RefValue::Id(id) => match self.identity.get(id) {
                Some(e) => Resolved::Entity(e),
                None if self.not_found.contains(id) => Resolved::Null,
                None => Resolved::Missing(*id),
            },
        }
    }

    pub fn same_target(&self, a: &RefValue, b: &RefValue) -> bool {
        self.resolve(a) == self.resolve(b)
    }

    /// The permanent id a reference column would be written as.
    pub fn ref_id(&self, value: &RefValue) -> Option<TaggedId> {
        match value {
            RefValue::Null => None,
            RefValue::Id(id) => Some(*id),
            RefValue::Entity(e) => self
                .entity(*e)
                .ok()
                .filter(|d| d.state != ObjectState::Detached)
                .and_then(|d| d.id.persisted()),
        }
    }

    /// Slot of `field` on `e`, with the entity and field metadata.
    pub fn slot<'a>(
        &'a self,
        metadata: &'a Metadata,
        e: EntityRef,
        field: &str,
    ) -> Result<(&'a EntityData, &'a EntityMetadata, &'a FieldMeta, &'a Slot)> {
        let data = self.entity(e)?;
        let meta = metadata.entity(data.entity_type)?;
        let (index, field) = meta.resolve(field)?;
        Ok((data, meta, field, &data.slots[index]))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// A primitive or reactive field value.
    pub fn read_value(&self, metadata: &Metadata, e: EntityRef, field: &str) -> Result<Value> {
        let (_, meta, fm, slot) = self.slot(metadata, e, field)?;
        match &fm.kind {
            FieldKind::Primitive { .. } => Ok(slot_value(slot)),
            FieldKind::ReactiveField { compute, .. } => {
                let reader = StateReader::new(self, metadata);
                match compute.call(&reader, e) {
                    Ok(value) => Ok(value),
                    Err(err) if err.is_not_loaded() => match slot {
                        Slot::Value(cached) => Ok(cached.clone()),
                        _ => Err(err),
                    },
                    Err(err) => Err(err),
                }
            }
            other => Err(mismatch("primitive or reactive field", other, meta, fm)),
        }
    }

    /// A reference. One-to-one collections read as their single live item.
    pub fn read_reference(
        &self,
        metadata: &Metadata,
        e: EntityRef,
        field: &str,
    ) -> Result<Option<EntityRef>> {
        let (data, meta, fm, slot) = self.slot(metadata, e, field)?;
        match &fm.kind {
            FieldKind::ManyToOne { .. } | FieldKind::Polymorphic { .. } => {
                self.resolve_slot(data, fm, slot)
            }
            FieldKind::ReactiveReference { compute, .. } => {
                let reader = StateReader::new(self, metadata);
                match compute.call(&reader, e) {
                    Ok(target) => Ok(target),
                    Err(err) if err.is_not_loaded() => self.resolve_slot(data, fm, slot),
                    Err(err) => Err(err),
                }
            }
            FieldKind::OneToOne { .. } => {
                Ok(self.live_items(data, fm, slot)?.into_iter().next())
            }
            other => Err(mismatch("reference", other, meta, fm)),
        }
    }

    /// A collection, without entities marked for deletion.
    pub fn read_collection(
        &self,
        metadata: &Metadata,
        e: EntityRef,
        field: &str,
    ) -> Result<Vec<EntityRef>> {
        let (data, meta, fm, slot) = self.slot(metadata, e, field)?;
        match &fm.kind {
            FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. } | FieldKind::ManyToMany { .. } => {
                self.live_items(data, fm, slot)
            }
            FieldKind::ReactiveCollection { compute, .. } => {
                let reader = StateReader::new(self, metadata);
                match compute.call(&reader, e) {
                    Ok(items) => Ok(items.into_iter().filter(|i| self.is_live(*i)).collect()),
                    Err(err) if err.is_not_loaded() => self.live_items(data, fm, slot),
                    Err(err) => Err(err),
                }
            }
            FieldKind::Recursive { .. } => crate::recursive::walk(self, metadata, e, fm.name),
            other => Err(mismatch("collection", other, meta, fm)),
        }
    }

    fn resolve_slot(
        &self,
        data: &EntityData,
        fm: &FieldMeta,
        slot: &Slot,
    ) -> Result<Option<EntityRef>> {
        let Slot::Reference(value) = slot else {
            return Ok(None);
        };
        match self.resolve(value) {
            Resolved::Null => Ok(None),
            Resolved::Entity(target) => Ok(Some(target)),
            Resolved::Missing(_) => Err(Error::NotLoaded {
                entity: data.id,
                relation: fm.name,
            }),
        }
    }

    fn live_items(&self, data: &EntityData, fm: &FieldMeta, slot: &Slot) -> Result<Vec<EntityRef>> {
        match slot {
            Slot::Collection(c) if c.loaded => {
                Ok(c.items.iter().copied().filter(|i| self.is_live(*i)).collect())
            }
            _ => Err(Error::NotLoaded {
                entity: data.id,
                relation: fm.name,
            }),
        }
    }
}

fn slot_value(slot: &Slot) -> Value {
    match slot {
        Slot::Value(v) => v.clone(),
        _ => Value::Null,
    }
}

pub(crate) fn mismatch(
    expected: &'static str,
    kind: &FieldKind,
    meta: &EntityMetadata,
    fm: &FieldMeta,
) -> Error {
    Error::Type(TypeError {
        expected,
        actual: kind.label().to_string(),
        field: Some(format!("{}.{}", meta.name, fm.name)),
    })
}

/// Read-only view of a graph handed to reactive computations and rules.
pub(crate) struct StateReader<'a> {
    graph: &'a EntityGraph,
    metadata: &'a Metadata,
}

impl<'a> StateReader<'a> {
    pub fn new(graph: &'a EntityGraph, metadata: &'a Metadata) -> Self {
        Self { graph, metadata }
    }
}

impl EntityReader for StateReader<'_> {
    fn entity_type(&self, entity: EntityRef) -> Result<&'static str> {
        Ok(self.graph.entity(entity)?.entity_type)
    }

    fn id(&self, entity: EntityRef) -> Result<EntityId> {
        Ok(self.graph.entity(entity)?.id)
    }

    fn get(&self, entity: EntityRef, field: &str) -> Result<Value> {
        self.graph.read_value(self.metadata, entity, field)
    }

    fn reference(&self, entity: EntityRef, field: &str) -> Result<Option<EntityRef>> {
        self.graph.read_reference(self.metadata, entity, field)
    }

    fn collection(&self, entity: EntityRef, field: &str) -> Result<Vec<EntityRef>> {
        self.graph.read_collection(self.metadata, entity, field)
    }
}
