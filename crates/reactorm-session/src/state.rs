//! Session state and the synchronous mutation API.
//!
//! Every mutation goes through here, whichever handle issued it: the write
//! guard is checked first, then the entity must not be marked for deletion,
//! then plugins run, and only then is the graph touched. Each write keeps
//! the change tracker, inverse collections, the exact-match index and the
//! change log consistent with each other.

use crate::SessionConfig;
use crate::change_tracker::{Change, ChangeTracker, Original, RefValue};
use crate::graph::{CollectionSlot, EntityData, EntityGraph, LinkDelta, LinkKey, ObjectState, Slot, mismatch};
use crate::hooks::HookRegistry;
use crate::index::{ExactMatchIndex, IndexKey};
use crate::loader::LoadQueue;
use crate::plugin::SessionPlugin;
use crate::write_guard::{Actor, WriteGuard};
use reactorm_core::{
    EntityId, EntityMetadata, EntityRef, Error, FieldKind, FieldMeta, Metadata, Result, Row,
    TypeError, Value,
};
use std::sync::Arc;

/// An initial or assigned field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldInit {
    Value(Value),
    Reference(Option<EntityRef>),
    Collection(Vec<EntityRef>),
}

impl FieldInit {
    fn expected(&self) -> &'static str {
        match self {
            FieldInit::Value(_) => "primitive field",
            FieldInit::Reference(_) => "reference",
            FieldInit::Collection(_) => "one-to-many or many-to-many collection",
        }
    }

    fn fits(&self, kind: &FieldKind) -> bool {
        match (self, kind) {
            (FieldInit::Value(_), FieldKind::Primitive { .. }) => true,
            (
                FieldInit::Reference(_),
                FieldKind::ManyToOne { .. } | FieldKind::Polymorphic { .. } | FieldKind::OneToOne { .. },
            ) => true,
            (FieldInit::Collection(_), FieldKind::OneToMany { .. } | FieldKind::ManyToMany { .. }) => {
                true
            }
            _ => false,
        }
    }
}

impl From<Value> for FieldInit {
    fn from(value: Value) -> Self {
        FieldInit::Value(value)
    }
}

impl From<&str> for FieldInit {
    fn from(value: &str) -> Self {
        FieldInit::Value(value.into())
    }
}

impl From<String> for FieldInit {
    fn from(value: String) -> Self {
        FieldInit::Value(value.into())
    }
}

impl From<i64> for FieldInit {
    fn from(value: i64) -> Self {
        FieldInit::Value(value.into())
    }
}

impl From<i32> for FieldInit {
    fn from(value: i32) -> Self {
        FieldInit::Value(value.into())
    }
}

impl From<bool> for FieldInit {
    fn from(value: bool) -> Self {
        FieldInit::Value(value.into())
    }
}

impl From<f64> for FieldInit {
    fn from(value: f64) -> Self {
        FieldInit::Value(value.into())
    }
}

impl From<EntityRef> for FieldInit {
    fn from(target: EntityRef) -> Self {
        FieldInit::Reference(Some(target))
    }
}

impl From<Option<EntityRef>> for FieldInit {
    fn from(target: Option<EntityRef>) -> Self {
        FieldInit::Reference(target)
    }
}

impl From<Vec<EntityRef>> for FieldInit {
    fn from(items: Vec<EntityRef>) -> Self {
        FieldInit::Collection(items)
    }
}

pub(crate) struct SessionState {
    pub config: SessionConfig,
    pub graph: EntityGraph,
    /// Never rolled back, so placeholder ids are never reused.
    pub next_placeholder: u64,
    pub guard: WriteGuard,
    pub index: ExactMatchIndex,
    pub loader: LoadQueue,
    pub hooks: HookRegistry,
    pub plugins: Vec<Arc<dyn SessionPlugin>>,
}

impl SessionState {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            graph: EntityGraph::default(),
            next_placeholder: 0,
            guard: WriteGuard::default(),
            index: ExactMatchIndex::default(),
            loader: LoadQueue::default(),
            hooks: HookRegistry::default(),
            plugins: Vec::new(),
        }
    }

    pub fn check_write(&self, actor: Actor, operation: &'static str) -> Result<()> {
        self.guard.check(self.config.mode, actor, operation)
    }

    fn live(&self, e: EntityRef, operation: &'static str) -> Result<&EntityData> {
        let data = self.graph.entity(e)?;
        if data.is_live() {
            Ok(data)
        } else {
            Err(Error::EntityDeleted {
                entity: data.id,
                operation,
            })
        }
    }

    fn set_plugins(
        &self,
        actor: Actor,
        entity_type: &'static str,
        e: EntityRef,
        field: &'static str,
        value: &FieldInit,
    ) -> Result<()> {
        if actor == Actor::Engine {
            return Ok(());
        }
        for plugin in &self.plugins {
            plugin.before_set_field(entity_type, e, field, value)?;
        }
        Ok(())
    }

    /// Run `before_get_field` plugins for a read by `actor`.
    pub fn get_plugins(&self, metadata: &Metadata, actor: Actor, e: EntityRef, field: &str) -> Result<()> {
        if actor == Actor::Engine || self.plugins.is_empty() {
            return Ok(());
        }
        let (data, _, fm, _) = self.graph.slot(metadata, e, field)?;
        for plugin in &self.plugins {
            plugin.before_get_field(data.entity_type, e, fm.name)?;
        }
        Ok(())
    }

    // ========================================================================
    // Public mutations
    // ========================================================================

    pub fn create(
        &mut self,
        metadata: &Metadata,
        actor: Actor,
        entity_type: &str,
        fields: Vec<(&str, FieldInit)>,
    ) -> Result<EntityRef> {
        self.check_write(actor, "create an entity")?;
        let meta = metadata.entity(entity_type)?;
        for (name, init) in &fields {
            let fm = meta.field_meta(name)?;
            if !init.fits(&fm.kind) {
                return Err(mismatch(init.expected(), &fm.kind, meta, fm));
            }
        }

        self.next_placeholder += 1;
        let e = self.graph.push(EntityData {
            entity_type: meta.name,
            id: EntityId::Placeholder(self.next_placeholder),
            state: ObjectState::New,
            slots: meta.fields().iter().map(|f| Slot::for_new(&f.kind)).collect(),
            changes: ChangeTracker::default(),
        });
        self.index.on_track(&self.graph, metadata, e)?;
        self.graph.log.push(Change::Created(e));
        if let Some(observer) = &self.config.observer {
            observer.entity_created(meta.name, e);
        }
        tracing::trace!(entity_type = meta.name, %e, "Created entity");

        for (name, init) in fields {
            match init {
                FieldInit::Value(value) => self.set_value(metadata, actor, e, name, value)?,
                FieldInit::Reference(target) => self.set_reference(metadata, actor, e, name, target)?,
                FieldInit::Collection(items) => {
                    for item in items {
                        self.add(metadata, actor, e, name, item)?;
                    }
                }
            }
        }
        Ok(e)
    }

    pub fn set_value(
        &mut self,
        metadata: &Metadata,
        actor: Actor,
        e: EntityRef,
        field: &str,
        value: Value,
    ) -> Result<()> {
        self.check_write(actor, "set a field")?;
        let data = self.live(e, "set a field")?;
        let meta = metadata.entity(data.entity_type)?;
        let fm = meta.field_meta(field)?;
        if !matches!(fm.kind, FieldKind::Primitive { .. }) {
            return Err(mismatch("primitive field", &fm.kind, meta, fm));
        }
        self.set_plugins(actor, meta.name, e, fm.name, &FieldInit::Value(value.clone()))?;
        self.write_value(metadata, e, fm.name, value)?;
        Ok(())
    }

    pub fn set_reference(
        &mut self,
        metadata: &Metadata,
        actor: Actor,
        e: EntityRef,
        field: &str,
        target: Option<EntityRef>,
    ) -> Result<()> {
        self.check_write(actor, "set a reference")?;
        let data = self.live(e, "set a reference")?;
        let meta = metadata.entity(data.entity_type)?;
        let fm = meta.field_meta(field)?;
        match &fm.kind {
            FieldKind::ManyToOne { .. } | FieldKind::Polymorphic { .. } => {
                if let Some(target) = target {
                    self.check_target(meta, fm, target, "set a reference")?;
                }
                self.set_plugins(actor, meta.name, e, fm.name, &FieldInit::Reference(target))?;
                self.write_reference(metadata, e, fm.name, target.map_or(RefValue::Null, RefValue::Entity))?;
                Ok(())
            }
            FieldKind::OneToOne { inverse, .. } => {
                if let Some(target) = target {
                    self.check_target(meta, fm, target, "set a reference")?;
                }
                self.set_plugins(actor, meta.name, e, fm.name, &FieldInit::Reference(target))?;
                let current = self.graph.read_reference(metadata, e, fm.name)?;
                if current == target {
                    return Ok(());
                }
                if let Some(previous) = current {
                    self.write_reference(metadata, previous, inverse, RefValue::Null)?;
                }
                if let Some(target) = target {
                    self.write_reference(metadata, target, inverse, RefValue::Entity(e))?;
                }
                Ok(())
            }
            other => Err(mismatch("many-to-one, polymorphic or one-to-one reference", other, meta, fm)),
        }
    }

    pub fn add(
        &mut self,
        metadata: &Metadata,
        actor: Actor,
        e: EntityRef,
        field: &str,
        item: EntityRef,
    ) -> Result<()> {
        self.check_write(actor, "add to a collection")?;
        let data = self.live(e, "add to a collection")?;
        let meta = metadata.entity(data.entity_type)?;
        let fm = meta.field_meta(field)?;
        match &fm.kind {
            FieldKind::OneToMany { inverse, .. } => {
                self.check_target(meta, fm, item, "add to a collection")?;
                self.live(item, "add to a collection")?;
                self.set_plugins(actor, meta.name, e, fm.name, &FieldInit::Collection(vec![item]))?;
                self.write_reference(metadata, item, inverse, RefValue::Entity(e))?;
                Ok(())
            }
            FieldKind::ManyToMany { .. } => {
                self.check_target(meta, fm, item, "add to a collection")?;
                self.live(item, "add to a collection")?;
                self.set_plugins(actor, meta.name, e, fm.name, &FieldInit::Collection(vec![item]))?;
                self.link(metadata, e, fm, item, LinkDelta::Added)
            }
            other => Err(mismatch("one-to-many or many-to-many collection", other, meta, fm)),
        }
    }

    pub fn remove(
        &mut self,
        metadata: &Metadata,
        actor: Actor,
        e: EntityRef,
        field: &str,
        item: EntityRef,
    ) -> Result<()> {
        self.check_write(actor, "remove from a collection")?;
        let data = self.live(e, "remove from a collection")?;
        let meta = metadata.entity(data.entity_type)?;
        let fm = meta.field_meta(field)?;
        match &fm.kind {
            FieldKind::OneToMany { inverse, .. } => {
                self.set_plugins(actor, meta.name, e, fm.name, &FieldInit::Collection(vec![item]))?;
                let (_, _, _, slot) = self.graph.slot(metadata, item, inverse)?;
                let points_here = match slot {
                    Slot::Reference(value) => self.graph.resolve(value).entity() == Some(e),
                    _ => false,
                };
                if points_here {
                    self.write_reference(metadata, item, inverse, RefValue::Null)?;
                }
                Ok(())
            }
            FieldKind::ManyToMany { .. } => {
                self.set_plugins(actor, meta.name, e, fm.name, &FieldInit::Collection(vec![item]))?;
                self.link(metadata, e, fm, item, LinkDelta::Removed)
            }
            other => Err(mismatch("one-to-many or many-to-many collection", other, meta, fm)),
        }
    }

    pub fn delete(&mut self, actor: Actor, e: EntityRef) -> Result<()> {
        self.check_write(actor, "delete an entity")?;
        let data = self.graph.entity(e)?;
        let entity_type = data.entity_type;
        match data.state {
            ObjectState::Deleted | ObjectState::Detached => return Ok(()),
            ObjectState::New => {
                self.graph.detach(e);
                self.index.on_untrack(entity_type, e);
            }
            ObjectState::Persistent => {
                self.graph.entity_mut(e)?.state = ObjectState::Deleted;
            }
        }
        self.graph.log.push(Change::Deleted(e));
        if let Some(observer) = &self.config.observer {
            observer.entity_deleted(entity_type, e);
        }
        tracing::trace!(entity_type, %e, "Marked entity for deletion");
        Ok(())
    }

    fn check_target(
        &self,
        meta: &EntityMetadata,
        fm: &FieldMeta,
        target: EntityRef,
        operation: &'static str,
    ) -> Result<()> {
        let data = self.graph.entity(target)?;
        if data.state == ObjectState::Detached {
            return Err(Error::EntityDeleted {
                entity: data.id,
                operation,
            });
        }
        if fm.kind.targets().contains(&data.entity_type) {
            Ok(())
        } else {
            Err(Error::Type(TypeError {
                expected: "entity of a declared target type",
                actual: data.entity_type.to_string(),
                field: Some(format!("{}.{}", meta.name, fm.name)),
            }))
        }
    }

    // ========================================================================
    // Unguarded writes
    // ========================================================================

    /// Store a value slot. Returns whether the value changed.
    pub fn write_value(
        &mut self,
        metadata: &Metadata,
        e: EntityRef,
        field: &str,
        value: Value,
    ) -> Result<bool> {
        let data = self.graph.entity(e)?;
        let entity_type = data.entity_type;
        let (index, fm) = metadata.entity(entity_type)?.resolve(field)?;
        if matches!(&data.slots[index], Slot::Value(current) if current.same_as(&value)) {
            return Ok(false);
        }
        let tracked = data.state == ObjectState::Persistent && fm.kind.is_column();

        let new_key = IndexKey::of_slot(&Slot::Value(value.clone()));
        let data = self.graph.entity_mut(e)?;
        let old = std::mem::replace(&mut data.slots[index], Slot::Value(value.clone()));
        if tracked {
            let previous = match &old {
                Slot::Value(v) => v.clone(),
                _ => Value::Null,
            };
            let kept = data.changes.record(fm.name, Original::Value(previous));
            if matches!(kept, Original::Value(original) if original.same_as(&value)) {
                data.changes.revert(fm.name);
            }
        }
        self.index.on_change(entity_type, fm.name, e, IndexKey::of_slot(&old), new_key);
        self.graph.log.push(Change::Field(e, fm.name));
        if let Some(observer) = &self.config.observer {
            observer.field_set(entity_type, e, fm.name);
        }
        Ok(true)
    }

    /// Store a reference slot, keeping loaded inverse collections in step.
    /// Returns whether the target changed.
    pub fn write_reference(
        &mut self,
        metadata: &Metadata,
        e: EntityRef,
        field: &str,
        value: RefValue,
    ) -> Result<bool> {
        let data = self.graph.entity(e)?;
        let entity_type = data.entity_type;
        let meta = metadata.entity(entity_type)?;
        let (index, fm) = meta.resolve(field)?;
        let Slot::Reference(current) = &data.slots[index] else {
            return Err(mismatch("reference", &fm.kind, meta, fm));
        };
        if self.graph.same_target(current, &value) {
            return Ok(false);
        }
        let inverse = match &fm.kind {
            FieldKind::ManyToOne { inverse, .. }
            | FieldKind::Polymorphic { inverse, .. }
            | FieldKind::ReactiveReference { inverse, .. } => *inverse,
            _ => None,
        };
        let tracked = data.state == ObjectState::Persistent && fm.kind.is_column();

        let data = self.graph.entity_mut(e)?;
        let old = std::mem::replace(&mut data.slots[index], Slot::Reference(value.clone()));
        let Slot::Reference(old) = old else {
            return Ok(false);
        };
        if tracked {
            let kept = data.changes.record(fm.name, Original::Reference(old.clone())).clone();
            if let Original::Reference(original) = kept {
                if self.graph.same_target(&original, &value) {
                    self.graph.entity_mut(e)?.changes.revert(fm.name);
                }
            }
        }

        if let Some(inverse) = inverse {
            if let Some(previous) = self.graph.resolve(&old).entity() {
                self.collection_edit(metadata, previous, inverse, e, false)?;
            }
            if let Some(next) = self.graph.resolve(&value).entity() {
                let next_meta = metadata.entity(self.graph.entity(next)?.entity_type)?;
                if matches!(next_meta.field_meta(inverse)?.kind, FieldKind::OneToOne { .. }) {
                    // A one-to-one holds a single entity: unhook the one it replaces.
                    let displaced: Vec<EntityRef> = self
                        .graph
                        .read_collection(metadata, next, inverse)
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|d| *d != e)
                        .collect();
                    for d in displaced {
                        self.write_reference(metadata, d, fm.name, RefValue::Null)?;
                    }
                }
                self.collection_edit(metadata, next, inverse, e, true)?;
            }
        }

        self.index.on_change(
            entity_type,
            fm.name,
            e,
            IndexKey::of_slot(&Slot::Reference(old)),
            IndexKey::of_slot(&Slot::Reference(value)),
        );
        self.graph.log.push(Change::Field(e, fm.name));
        if let Some(observer) = &self.config.observer {
            observer.field_set(entity_type, e, fm.name);
        }
        Ok(true)
    }

    /// Store a computed collection. Returns whether its items changed.
    pub fn write_collection(
        &mut self,
        metadata: &Metadata,
        e: EntityRef,
        field: &str,
        items: Vec<EntityRef>,
    ) -> Result<bool> {
        let data = self.graph.entity(e)?;
        let entity_type = data.entity_type;
        let (index, fm) = metadata.entity(entity_type)?.resolve(field)?;
        let next = Slot::Collection(CollectionSlot::loaded(items));
        if data.slots[index] == next {
            return Ok(false);
        }
        self.graph.entity_mut(e)?.slots[index] = next;
        self.graph.log.push(Change::Field(e, fm.name));
        Ok(true)
    }

    /// Add or remove `item` in `owner.field` if that collection is loaded.
    fn collection_edit(
        &mut self,
        metadata: &Metadata,
        owner: EntityRef,
        field: &str,
        item: EntityRef,
        insert: bool,
    ) -> Result<()> {
        let owner_type = self.graph.entity(owner)?.entity_type;
        let (index, fm) = metadata.entity(owner_type)?.resolve(field)?;
        let data = self.graph.entity_mut(owner)?;
        if let Slot::Collection(c) = &mut data.slots[index] {
            if c.loaded {
                if insert {
                    if !c.items.contains(&item) {
                        c.items.push(item);
                    }
                } else {
                    c.items.retain(|i| *i != item);
                }
            }
        }
        self.graph.log.push(Change::Field(owner, fm.name));
        Ok(())
    }

    /// Record a join row change, cancelling an opposite pending change.
    fn link(
        &mut self,
        metadata: &Metadata,
        e: EntityRef,
        fm: &FieldMeta,
        item: EntityRef,
        delta: LinkDelta,
    ) -> Result<()> {
        let FieldKind::ManyToMany {
            inverse,
            join_table,
            column,
            other_column,
            ..
        } = &fm.kind
        else {
            return Ok(());
        };
        let key = LinkKey::new(*join_table, (*column, e), (*other_column, item));
        let listed = match self.graph.slot(metadata, e, fm.name)?.3 {
            Slot::Collection(c) if c.loaded => Some(c.items.contains(&item)),
            _ => None,
        };
        match (self.graph.links.get(&key), delta) {
            (Some(pending), _) if pending == delta => return Ok(()),
            (Some(_), _) => self.graph.links.remove(&key),
            (None, LinkDelta::Added) if listed == Some(true) => return Ok(()),
            (None, LinkDelta::Removed) if listed == Some(false) => return Ok(()),
            (None, _) => self.graph.links.insert(key, delta),
        }
        let insert = delta == LinkDelta::Added;
        self.collection_edit(metadata, e, fm.name, item, insert)?;
        if let Some(inverse) = inverse {
            self.collection_edit(metadata, item, inverse, e, insert)?;
        }
        if let Some(observer) = &self.config.observer {
            observer.field_set(self.graph.entity(e)?.entity_type, e, fm.name);
        }
        Ok(())
    }

    // ========================================================================
    // Rows
    // ========================================================================

    /// Track a stored row, or return the entity already tracked for its id.
    pub fn register_row(&mut self, metadata: &Metadata, row: &Row) -> Result<EntityRef> {
        if let Some(e) = self.graph.identity.get(&row.id) {
            return Ok(e);
        }
        let meta = metadata.entity_for_id(&row.id)?;
        let e = self.graph.push(EntityData {
            entity_type: meta.name,
            id: EntityId::Persisted(row.id),
            state: ObjectState::Persistent,
            slots: meta.fields().iter().map(|f| Slot::from_row(f, row)).collect(),
            changes: ChangeTracker::default(),
        });
        self.graph.not_found.remove(&row.id);
        self.index.on_track(&self.graph, metadata, e)?;
        Ok(e)
    }

    /// Whether `e` carries a non-null soft-delete marker.
    pub fn is_soft_deleted(&self, metadata: &Metadata, e: EntityRef) -> Result<bool> {
        let data = self.graph.entity(e)?;
        let meta = metadata.entity(data.entity_type)?;
        let Some(column) = meta.soft_delete else {
            return Ok(false);
        };
        let (index, _) = meta.resolve(column)?;
        Ok(matches!(&data.slots[index], Slot::Value(v) if !v.is_null()))
    }
}
