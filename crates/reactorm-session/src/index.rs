//! Exact-match lookup over in-memory entities.
//!
//! Searches that must see unsaved changes combine a store query with a scan
//! of tracked entities. Once a type has more tracked entities than the
//! configured threshold, the scan is replaced by a per-field hash index that
//! is built lazily on first use and maintained on every write.
//!
//! Candidates from the index are always re-checked against current
//! in-memory values, so a stale or colliding bucket never yields a wrong
//! result.

use crate::change_tracker::RefValue;
use crate::graph::{EntityGraph, Slot};
use reactorm_core::{
    EntityMetadata, EntityRef, Error, Filter, Metadata, Result, TaggedId, TypeError,
    Value,
};
use std::collections::{BTreeSet, HashMap};

/// The expected value of one field in a search.
#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    Value(Value),
    /// A tracked entity, saved or not.
    Entity(EntityRef),
    /// A permanent id, whether or not the entity is loaded.
    Id(TaggedId),
    Null,
}

/// A conjunction of field equalities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    entries: Vec<(&'static str, Match)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.entries.push((field, Match::Value(value.into())));
        self
    }

    pub fn entity(mut self, field: &'static str, entity: EntityRef) -> Self {
        self.entries.push((field, Match::Entity(entity)));
        self
    }

    pub fn id(mut self, field: &'static str, id: TaggedId) -> Self {
        self.entries.push((field, Match::Id(id)));
        self
    }

    pub fn is_null(mut self, field: &'static str) -> Self {
        self.entries.push((field, Match::Null));
        self
    }

    pub fn entries(&self) -> &[(&'static str, Match)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reject fields that are not stored columns.
    pub(crate) fn check(&self, meta: &EntityMetadata) -> Result<()> {
        for (field, _) in &self.entries {
            let fm = meta.field_meta(field)?;
            if !fm.kind.is_column() {
                return Err(Error::Type(TypeError {
                    expected: "column field",
                    actual: fm.kind.label().to_string(),
                    field: Some(format!("{}.{}", meta.name, field)),
                }));
            }
        }
        Ok(())
    }

    /// The equivalent store filter, or `None` when a criterion names an
    /// entity without a permanent id (no stored row can match it).
    pub(crate) fn to_filter(&self, graph: &EntityGraph, meta: &EntityMetadata) -> Result<Option<Filter>> {
        let mut filter = Filter::new();
        for (field, expected) in &self.entries {
            let is_ref = meta.field_meta(field)?.kind.is_reference();
            filter = match expected {
                Match::Value(v) if is_ref && v.is_null() => filter.eq_ref(field, None),
                Match::Value(v) => filter.eq(field, v.clone()),
                Match::Null if is_ref => filter.eq_ref(field, None),
                Match::Null => filter.eq(field, Value::Null),
                Match::Id(id) => filter.eq_ref(field, Some(*id)),
                Match::Entity(e) => match graph.entity(*e)?.id.persisted() {
                    Some(id) => filter.eq_ref(field, Some(id)),
                    None => return Ok(None),
                },
            };
        }
        Ok(Some(filter))
    }
}

/// Whether `e`'s current in-memory values satisfy `criteria`.
pub(crate) fn matches(
    graph: &EntityGraph,
    metadata: &Metadata,
    e: EntityRef,
    criteria: &Criteria,
) -> Result<bool> {
    for (field, expected) in criteria.entries() {
        let (_, _, _, slot) = graph.slot(metadata, e, field)?;
        if !slot_matches(graph, slot, expected) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn slot_matches(graph: &EntityGraph, slot: &Slot, expected: &Match) -> bool {
    let id_of = |e: EntityRef| graph.entity(e).ok().and_then(|d| d.id.persisted());
    match (slot, expected) {
        (Slot::Value(v), Match::Value(x)) => v.same_as(x),
        (Slot::Value(v), Match::Null) => v.is_null(),
        (Slot::Unset, Match::Null) => true,
        (Slot::Unset, Match::Value(x)) => x.is_null(),
        (Slot::Reference(r), Match::Null) => *r == RefValue::Null,
        (Slot::Reference(r), Match::Value(x)) => x.is_null() && *r == RefValue::Null,
        (Slot::Reference(RefValue::Entity(y)), Match::Entity(x)) => x == y,
        (Slot::Reference(RefValue::Id(t)), Match::Entity(x)) => {
            graph.identity.get(t) == Some(*x) || id_of(*x) == Some(*t)
        }
        (Slot::Reference(RefValue::Id(u)), Match::Id(t)) => t == u,
        (Slot::Reference(RefValue::Entity(y)), Match::Id(t)) => id_of(*y) == Some(*t),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum IndexKey {
    Null,
    Value(u64),
    Entity(EntityRef),
    Id(TaggedId),
}

impl IndexKey {
    pub fn of_slot(slot: &Slot) -> Option<Self> {
        match slot {
            Slot::Value(v) if v.is_null() => Some(IndexKey::Null),
            Slot::Value(v) => Some(IndexKey::Value(v.hash_key())),
            Slot::Unset | Slot::Reference(RefValue::Null) => Some(IndexKey::Null),
            Slot::Reference(RefValue::Id(id)) => Some(IndexKey::Id(*id)),
            Slot::Reference(RefValue::Entity(e)) => Some(IndexKey::Entity(*e)),
            Slot::Collection(_) | Slot::Walk => None,
        }
    }

    /// Every key a stored slot equal to `expected` may be filed under.
    fn candidates(graph: &EntityGraph, expected: &Match) -> Vec<Self> {
        match expected {
            Match::Null => vec![IndexKey::Null],
            Match::Value(v) if v.is_null() => vec![IndexKey::Null],
            Match::Value(v) => vec![IndexKey::Value(v.hash_key())],
            Match::Entity(e) => {
                let mut keys = vec![IndexKey::Entity(*e)];
                if let Some(id) = graph.entity(*e).ok().and_then(|d| d.id.persisted()) {
                    keys.push(IndexKey::Id(id));
                }
                keys
            }
            Match::Id(id) => {
                let mut keys = vec![IndexKey::Id(*id)];
                if let Some(e) = graph.identity.get(id) {
                    keys.push(IndexKey::Entity(e));
                }
                keys
            }
        }
    }
}

type Buckets = HashMap<IndexKey, BTreeSet<EntityRef>>;

/// Lazily built per-(type, field) hash buckets.
#[derive(Debug, Default)]
pub(crate) struct ExactMatchIndex {
    fields: HashMap<(&'static str, &'static str), Buckets>,
}

impl ExactMatchIndex {
    pub fn indexed_fields(&self) -> usize {
        self.fields.len()
    }

    fn build(&mut self, graph: &EntityGraph, meta: &EntityMetadata, field: &'static str) -> Result<()> {
        if self.fields.contains_key(&(meta.name, field)) {
            return Ok(());
        }
        let (index, _) = meta.resolve(field)?;
        let mut buckets = Buckets::new();
        for e in graph.of_type(meta.name) {
            let data = graph.entity(e)?;
            if let Some(key) = IndexKey::of_slot(&data.slots[index]) {
                buckets.entry(key).or_default().insert(e);
            }
        }
        tracing::debug!(
            entity_type = meta.name,
            field,
            buckets = buckets.len(),
            "Built exact-match index"
        );
        self.fields.insert((meta.name, field), buckets);
        Ok(())
    }

    /// Candidates for `criteria`: the intersection of every field's buckets.
    pub fn lookup(
        &mut self,
        graph: &EntityGraph,
        meta: &EntityMetadata,
        criteria: &Criteria,
    ) -> Result<BTreeSet<EntityRef>> {
        let mut result: Option<BTreeSet<EntityRef>> = None;
        for (field, expected) in criteria.entries() {
            let name = meta.field_meta(field)?.name;
            self.build(graph, meta, name)?;
            let buckets = &self.fields[&(meta.name, name)];
            let hits: BTreeSet<EntityRef> = IndexKey::candidates(graph, expected)
                .iter()
                .filter_map(|k| buckets.get(k))
                .flatten()
                .copied()
                .collect();
            result = Some(match result {
                Some(acc) => acc.intersection(&hits).copied().collect(),
                None => hits,
            });
        }
        Ok(result.unwrap_or_else(|| graph.of_type(meta.name).collect()))
    }

    /// A slot of an indexed field changed from `old` to `new`.
    pub fn on_change(
        &mut self,
        entity_type: &'static str,
        field: &'static str,
        e: EntityRef,
        old: Option<IndexKey>,
        new: Option<IndexKey>,
    ) {
        let Some(buckets) = self.fields.get_mut(&(entity_type, field)) else {
            return;
        };
        if let Some(old) = old {
            if let Some(set) = buckets.get_mut(&old) {
                set.remove(&e);
            }
        }
        if let Some(new) = new {
            buckets.entry(new).or_default().insert(e);
        }
    }

    /// File a newly tracked entity under every indexed field of its type.
    pub fn on_track(&mut self, graph: &EntityGraph, metadata: &Metadata, e: EntityRef) -> Result<()> {
        let data = graph.entity(e)?;
        let meta = metadata.entity(data.entity_type)?;
        for ((entity_type, field), buckets) in &mut self.fields {
            if *entity_type != data.entity_type {
                continue;
            }
            let (index, _) = meta.resolve(field)?;
            if let Some(key) = IndexKey::of_slot(&data.slots[index]) {
                buckets.entry(key).or_default().insert(e);
            }
        }
        Ok(())
    }

    /// Remove a detached entity from every bucket.
    pub fn on_untrack(&mut self, entity_type: &str, e: EntityRef) {
        for ((t, _), buckets) in &mut self.fields {
            if *t == entity_type {
                for set in buckets.values_mut() {
                    set.remove(&e);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}
