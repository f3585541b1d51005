//! Batched relation loading.
//!
//! Load requests go through one queue per session. An operation enqueues the
//! keys it needs, yields once so that concurrently running operations can
//! enqueue theirs, then drains the whole queue: one driver call per entity
//! tag and one per (type, relation) group. Keys already in flight are awaited
//! instead of re-issued, so two operations asking for the same relation
//! share one round trip.

use crate::change_tracker::Original;
use crate::graph::{CollectionSlot, LinkDelta, ObjectState, Resolved, Slot};
use crate::state::SessionState;
use crate::{Session, Shared};
use reactorm_core::{
    Cx, Driver, EntityMetadata, EntityRef, Error, FieldKind, Filter, FindOptions, HintTree,
    LinkRow, Metadata, Outcome, Result, TaggedId,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::poll_fn;
use std::task::{Poll, Waker};

/// Rounds a caller retries keys whose loader (another operation) failed.
const MAX_LOAD_ROUNDS: usize = 3;
const MAX_POPULATE_DEPTH: usize = 32;

/// Something that can be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum LoadKey {
    /// A row by id.
    Entity(TaggedId),
    /// A one-to-many, one-to-one or many-to-many collection of an entity.
    Relation(EntityRef, &'static str),
}

/// Counters for the load queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    /// Queue drains that issued driver calls.
    pub batches: usize,
    /// Driver calls issued by the loader.
    pub driver_calls: usize,
}

#[derive(Debug, Default)]
pub(crate) struct LoadQueue {
    queued: Vec<LoadKey>,
    queued_set: HashSet<LoadKey>,
    in_flight: HashSet<LoadKey>,
    waiters: Vec<Waker>,
    pub stats: LoaderStats,
}

impl LoadQueue {
    fn enqueue(&mut self, key: LoadKey) {
        if !self.in_flight.contains(&key) && self.queued_set.insert(key) {
            self.queued.push(key);
        }
    }

    fn is_pending(&self, key: &LoadKey) -> bool {
        self.in_flight.contains(key) || self.queued_set.contains(key)
    }

    /// Move every queued key in flight.
    fn take_batch(&mut self) -> Vec<LoadKey> {
        let batch = std::mem::take(&mut self.queued);
        self.queued_set.clear();
        self.in_flight.extend(batch.iter().copied());
        batch
    }

    /// Land `keys` and hand back every waiter to wake.
    fn finish(&mut self, keys: &[LoadKey]) -> Vec<Waker> {
        for key in keys {
            self.in_flight.remove(key);
        }
        std::mem::take(&mut self.waiters)
    }
}

/// Lands in-flight keys however the load ends, waking everyone waiting on them.
struct InFlight<'a> {
    shared: &'a Shared,
    keys: &'a [LoadKey],
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let waiters = self.shared.lock().loader.finish(self.keys);
        for waker in waiters {
            waker.wake();
        }
    }
}

async fn yield_now() {
    let mut yielded = false;
    poll_fn(|task_cx| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            task_cx.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await;
}

// ============================================================================
// What is loaded
// ============================================================================

impl SessionState {
    pub(crate) fn is_satisfied(&self, metadata: &Metadata, key: &LoadKey) -> bool {
        match key {
            LoadKey::Entity(id) => {
                self.graph.identity.contains(id) || self.graph.not_found.contains(id)
            }
            LoadKey::Relation(e, field) => match self.graph.slot(metadata, *e, field) {
                Ok((_, _, _, Slot::Collection(c))) => c.loaded,
                _ => true,
            },
        }
    }

    /// What must be loaded before `e.field` can be read, if anything.
    pub(crate) fn key_for(&self, metadata: &Metadata, e: EntityRef, field: &str) -> Result<Option<LoadKey>> {
        let (data, _, fm, slot) = self.graph.slot(metadata, e, field)?;
        Ok(match (&fm.kind, slot) {
            (
                FieldKind::ManyToOne { .. }
                | FieldKind::Polymorphic { .. }
                | FieldKind::ReactiveReference { .. },
                Slot::Reference(value),
            ) => match self.graph.resolve(value) {
                Resolved::Missing(id) => Some(LoadKey::Entity(id)),
                Resolved::Null | Resolved::Entity(_) => None,
            },
            (
                FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. } | FieldKind::ManyToMany { .. },
                Slot::Collection(c),
            ) if !c.loaded && data.state != ObjectState::New => Some(LoadKey::Relation(e, fm.name)),
            _ => None,
        })
    }

    /// The original target of a changed reference, when it is not loaded.
    pub(crate) fn original_key(&self, metadata: &Metadata, e: EntityRef, field: &str) -> Option<LoadKey> {
        let (data, _, fm, _) = self.graph.slot(metadata, e, field).ok()?;
        match data.changes.original(fm.name)? {
            Original::Reference(value) => match self.graph.resolve(value) {
                Resolved::Missing(id) => Some(LoadKey::Entity(id)),
                _ => None,
            },
            Original::Value(_) => None,
        }
    }

    /// Entities `e.field` currently reaches, for descending a load tree.
    fn reached(&self, metadata: &Metadata, e: EntityRef, field: &str) -> Vec<EntityRef> {
        let Ok((_, _, fm, _)) = self.graph.slot(metadata, e, field) else {
            return Vec::new();
        };
        match &fm.kind {
            FieldKind::ManyToOne { .. }
            | FieldKind::Polymorphic { .. }
            | FieldKind::ReactiveReference { .. }
            | FieldKind::OneToOne { .. } => self
                .graph
                .read_reference(metadata, e, field)
                .ok()
                .flatten()
                .into_iter()
                .collect(),
            FieldKind::OneToMany { .. }
            | FieldKind::ManyToMany { .. }
            | FieldKind::ReactiveCollection { .. }
            | FieldKind::Recursive { .. } => {
                self.graph.read_collection(metadata, e, field).unwrap_or_default()
            }
            FieldKind::Primitive { .. } | FieldKind::ReactiveField { .. } => Vec::new(),
        }
    }

    /// Fill the unloaded one-to-many (or one-to-one) `field` of every parent
    /// from the tracked children whose foreign key points at it.
    fn finish_children(
        &mut self,
        metadata: &Metadata,
        owner_type: &str,
        field: &str,
        parents: &[EntityRef],
    ) -> Result<()> {
        let (index, fm) = metadata.entity(owner_type)?.resolve(field)?;
        let (FieldKind::OneToMany { target, inverse } | FieldKind::OneToOne { target, inverse }) =
            &fm.kind
        else {
            return Ok(());
        };
        let (inverse_index, _) = metadata.entity(target)?.resolve(inverse)?;
        let mut found: BTreeMap<EntityRef, Vec<EntityRef>> =
            parents.iter().map(|p| (*p, Vec::new())).collect();
        let children: Vec<EntityRef> = self.graph.of_type(target).collect();
        for child in children {
            if self.is_soft_deleted(metadata, child)? {
                continue;
            }
            if let Slot::Reference(value) = &self.graph.entity(child)?.slots[inverse_index] {
                if let Some(parent) = self.graph.resolve(value).entity() {
                    if let Some(items) = found.get_mut(&parent) {
                        items.push(child);
                    }
                }
            }
        }
        for (parent, items) in found {
            if let Slot::Collection(c) = &mut self.graph.entity_mut(parent)?.slots[index] {
                if !c.loaded {
                    *c = CollectionSlot::loaded(items);
                }
            }
        }
        Ok(())
    }

    /// Fill the unloaded many-to-many `field` of every parent from stored
    /// join rows, with pending additions and removals applied.
    fn finish_links(
        &mut self,
        metadata: &Metadata,
        owner_type: &str,
        field: &str,
        parents: &[EntityRef],
        links: &[LinkRow],
    ) -> Result<()> {
        let (index, fm) = metadata.entity(owner_type)?.resolve(field)?;
        let FieldKind::ManyToMany {
            join_table,
            column,
            other_column,
            ..
        } = &fm.kind
        else {
            return Ok(());
        };
        for parent in parents {
            let Some(id) = self.graph.entity(*parent)?.id.persisted() else {
                continue;
            };
            let mut items: Vec<EntityRef> = Vec::new();
            for link in links.iter().filter(|l| l.get(column) == Some(id)) {
                let Some(other) = link.get(other_column).and_then(|o| self.graph.identity.get(&o)) else {
                    continue;
                };
                if !items.contains(&other) && !self.is_soft_deleted(metadata, other)? {
                    items.push(other);
                }
            }
            let pending: Vec<(EntityRef, LinkDelta)> =
                self.graph.links.partners(join_table, column, *parent).collect();
            for (other, delta) in pending {
                match delta {
                    LinkDelta::Added if !items.contains(&other) => items.push(other),
                    LinkDelta::Added => {}
                    LinkDelta::Removed => items.retain(|i| *i != other),
                }
            }
            if let Slot::Collection(c) = &mut self.graph.entity_mut(*parent)?.slots[index] {
                if !c.loaded {
                    *c = CollectionSlot::loaded(items);
                }
            }
        }
        Ok(())
    }
}

/// Add the hints of reactive fields named in `tree` to it, until nothing new
/// is added. A recursive field also loads one hop of its relation and is
/// named again on the entities that hop reaches.
fn expand_reactive(meta: &EntityMetadata, tree: &HintTree) -> HintTree {
    let mut out = tree.clone();
    loop {
        let before = out.node_count();
        let snapshot = out.clone();
        for (name, _) in snapshot.iter() {
            let Ok(fm) = meta.field_meta(name) else {
                continue;
            };
            if let Some(hint) = fm.kind.reactive_hint() {
                out.merge(&hint.to_tree());
            }
            if let FieldKind::Recursive { relation } = fm.kind {
                out.insert_path(&[relation, fm.name]);
            }
        }
        if out.node_count() == before {
            return out;
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl<D: Driver> Session<D> {
    /// Load every key not yet satisfied, coalescing with concurrent callers.
    pub(crate) async fn ensure_loaded(&self, cx: &Cx, keys: Vec<LoadKey>) -> Outcome<(), Error> {
        let metadata = &self.shared.metadata;
        let mine: Vec<LoadKey> = {
            let mut state = self.shared.lock();
            let mine: Vec<LoadKey> = keys
                .into_iter()
                .filter(|k| !state.is_satisfied(metadata, k))
                .collect();
            for key in &mine {
                state.loader.enqueue(*key);
            }
            mine
        };
        if mine.is_empty() {
            return Outcome::Ok(());
        }

        // Let concurrent operations queue their requests first.
        yield_now().await;

        for _ in 0..MAX_LOAD_ROUNDS {
            let batch = self.shared.lock().loader.take_batch();
            if !batch.is_empty() {
                let in_flight = InFlight {
                    shared: &self.shared,
                    keys: &batch,
                };
                let outcome = self.execute_loads(cx, &batch).await;
                drop(in_flight);
                try_outcome!(outcome);
            }
            self.wait_for(&mine).await;

            let retry = {
                let mut state = self.shared.lock();
                let retry: Vec<LoadKey> = mine
                    .iter()
                    .copied()
                    .filter(|k| !state.is_satisfied(metadata, k) && !state.loader.is_pending(k))
                    .collect();
                for key in &retry {
                    state.loader.enqueue(*key);
                }
                retry
            };
            if retry.is_empty() {
                break;
            }
            tracing::debug!(keys = retry.len(), "Retrying loads left by another operation");
        }
        Outcome::Ok(())
    }

    async fn wait_for(&self, keys: &[LoadKey]) {
        poll_fn(|task_cx| {
            let mut state = self.shared.lock();
            if keys.iter().any(|k| state.loader.in_flight.contains(k)) {
                state.loader.waiters.push(task_cx.waker().clone());
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
        .await;
    }

    #[tracing::instrument(level = "debug", skip(self, cx, batch), fields(keys = batch.len()))]
    async fn execute_loads(&self, cx: &Cx, batch: &[LoadKey]) -> Outcome<(), Error> {
        let metadata = &self.shared.metadata;
        let mut ids: BTreeMap<&'static str, Vec<TaggedId>> = BTreeMap::new();
        let mut relations: BTreeMap<(&'static str, &'static str), Vec<EntityRef>> = BTreeMap::new();
        {
            let state = self.shared.lock();
            for key in batch {
                match key {
                    LoadKey::Entity(id) => ids.entry(id.tag()).or_default().push(*id),
                    LoadKey::Relation(e, field) => {
                        if let Ok(data) = state.graph.entity(*e) {
                            relations.entry((data.entity_type, *field)).or_default().push(*e);
                        }
                    }
                }
            }
        }

        for (tag, ids) in ids {
            let meta = try_result!(metadata.by_tag(tag));
            try_outcome!(self.load_rows(cx, meta, &ids).await);
        }
        for ((owner_type, field), parents) in relations {
            try_outcome!(self.load_relation(cx, owner_type, field, &parents).await);
        }
        self.shared.lock().loader.stats.batches += 1;
        Outcome::Ok(())
    }

    /// Load rows by id and register them. Ids the store does not have are
    /// remembered as missing.
    pub(crate) async fn load_rows(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        ids: &[TaggedId],
    ) -> Outcome<Vec<EntityRef>, Error> {
        let rows = try_outcome!(self.driver.load_by_ids(cx, meta, ids).await);
        let mut state = self.shared.lock();
        state.loader.stats.driver_calls += 1;
        let mut loaded = Vec::with_capacity(rows.len());
        for row in &rows {
            loaded.push(try_result!(state.register_row(&self.shared.metadata, row)));
        }
        for id in ids {
            if !state.graph.identity.contains(id) {
                state.graph.not_found.insert(*id);
            }
        }
        if let Some(observer) = &state.config.observer {
            observer.rows_loaded(meta.name, rows.len());
        }
        Outcome::Ok(loaded)
    }

    async fn load_relation(
        &self,
        cx: &Cx,
        owner_type: &'static str,
        field: &'static str,
        parents: &[EntityRef],
    ) -> Outcome<(), Error> {
        let metadata = &self.shared.metadata;
        let meta = try_result!(metadata.entity(owner_type));
        let fm = try_result!(meta.field_meta(field));
        let ids: Vec<TaggedId> = {
            let state = self.shared.lock();
            parents
                .iter()
                .filter_map(|p| state.graph.entity(*p).ok().and_then(|d| d.id.persisted()))
                .collect()
        };
        tracing::trace!(owner_type, field, parents = parents.len(), "Loading relation");

        match &fm.kind {
            FieldKind::OneToMany { target, inverse } | FieldKind::OneToOne { target, inverse } => {
                if !ids.is_empty() {
                    let target_meta = try_result!(metadata.entity(target));
                    let filter = Filter::new().in_refs(inverse, ids);
                    let rows = try_outcome!(
                        self.driver
                            .find(cx, target_meta, &filter, &FindOptions::new())
                            .await
                    );
                    let mut state = self.shared.lock();
                    state.loader.stats.driver_calls += 1;
                    for row in &rows {
                        try_result!(state.register_row(metadata, row));
                    }
                    if let Some(observer) = &state.config.observer {
                        observer.rows_loaded(target_meta.name, rows.len());
                    }
                }
                try_result!(self.shared.lock().finish_children(metadata, owner_type, field, parents));
            }
            FieldKind::ManyToMany {
                target,
                join_table,
                column,
                other_column,
                ..
            } => {
                let links = if ids.is_empty() {
                    Vec::new()
                } else {
                    let links = try_outcome!(self.driver.find_links(cx, join_table, column, &ids).await);
                    self.shared.lock().loader.stats.driver_calls += 1;
                    links
                };
                let missing: Vec<TaggedId> = {
                    let state = self.shared.lock();
                    let mut seen = BTreeSet::new();
                    links
                        .iter()
                        .filter_map(|l| l.get(other_column))
                        .filter(|id| {
                            !state.graph.identity.contains(id) && !state.graph.not_found.contains(id)
                        })
                        .filter(|id| seen.insert(*id))
                        .collect()
                };
                if !missing.is_empty() {
                    let target_meta = try_result!(metadata.entity(target));
                    try_outcome!(self.load_rows(cx, target_meta, &missing).await);
                }
                try_result!(self.shared.lock().finish_links(metadata, owner_type, field, parents, &links));
            }
            _ => {}
        }
        Outcome::Ok(())
    }

    /// Load everything `tree` reaches from each of `entities`, level by
    /// level. Reactive fields named in the tree pull in their own hints.
    pub(crate) async fn populate_tree(
        &self,
        cx: &Cx,
        entities: &[EntityRef],
        tree: &HintTree,
    ) -> Outcome<(), Error> {
        let metadata = &self.shared.metadata;
        let mut level: BTreeMap<EntityRef, HintTree> =
            entities.iter().map(|e| (*e, tree.clone())).collect();
        let mut depth = 0;

        while !level.is_empty() {
            depth += 1;
            if depth > MAX_POPULATE_DEPTH {
                tracing::warn!(depth, "Populate stopped at maximum depth");
                break;
            }

            let (expanded, keys) = {
                let state = self.shared.lock();
                let mut expanded = Vec::with_capacity(level.len());
                let mut keys = Vec::new();
                for (e, tree) in &level {
                    let Ok(data) = state.graph.entity(*e) else {
                        continue;
                    };
                    let meta = try_result!(metadata.entity(data.entity_type));
                    let tree = expand_reactive(meta, tree);
                    for (name, _) in tree.iter() {
                        if let Ok(Some(key)) = state.key_for(metadata, *e, name) {
                            keys.push(key);
                        }
                    }
                    expanded.push((*e, tree));
                }
                (expanded, keys)
            };
            try_outcome!(self.ensure_loaded(cx, keys).await);

            level = {
                let state = self.shared.lock();
                let mut next: BTreeMap<EntityRef, HintTree> = BTreeMap::new();
                for (e, tree) in &expanded {
                    for (name, sub) in tree.iter() {
                        if sub.is_empty() {
                            continue;
                        }
                        for target in state.reached(metadata, *e, name) {
                            next.entry(target).or_default().merge(sub);
                        }
                    }
                }
                next
            };
        }
        Outcome::Ok(())
    }
}
