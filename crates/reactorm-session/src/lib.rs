//! Session and reactive unit of work for reactorm.
//!
//! `reactorm-session` is the **unit-of-work layer**. A [`Session`] tracks
//! every entity loaded or created during one logical operation, records what
//! changed, keeps derived (reactive) values up to date and commits the whole
//! change set to the store in one batch.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one live instance per tagged id.
//! - **Change tracking**: new, dirty and deleted entities, plus join row
//!   additions and removals, with original values retained.
//! - **Reactions**: at commit, changes are traced backward through reversed
//!   dependency hints to the reactive values they affect, which are
//!   recalculated until nothing changes.
//! - **Write guard**: while a commit runs, only that commit's hooks may
//!   mutate, through the [`HookScope`] they are handed.
//!
//! # Concurrency
//!
//! A `Session` is a cheap handle; clones share one state. Operations never
//! hold the state lock across an `.await`, so overlapping async operations on
//! one session interleave safely, and their load requests are batched
//! together.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(MemoryDriver::new(), metadata)?;
//! let author = session.create("Author", vec![("firstName", "a1".into())])?;
//! let book = session.create("Book", vec![("title", "b1".into()), ("author", author.into())])?;
//! session.commit(&cx).await;
//! ```

/// Unwrap an `Outcome`, returning early with anything but `Ok`.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            reactorm_core::Outcome::Ok(v) => v,
            reactorm_core::Outcome::Err(e) => return reactorm_core::Outcome::Err(e),
            reactorm_core::Outcome::Cancelled(r) => return reactorm_core::Outcome::Cancelled(r),
            reactorm_core::Outcome::Panicked(p) => return reactorm_core::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return reactorm_core::Outcome::Err(e),
        }
    };
}

mod change_tracker;
pub mod commit;
mod graph;
pub mod hooks;
mod identity_map;
pub mod index;
mod loader;
pub mod observer;
pub mod pending;
pub mod plugin;
mod reactions;
mod recursive;
pub mod reverse_hint;
mod state;
mod write_guard;

pub use commit::CommitSummary;
pub use graph::ObjectState;
pub use hooks::{HookEvent, HookFn};
pub use index::{Criteria, Match};
pub use loader::LoaderStats;
pub use observer::{SessionObserver, TracingObserver};
pub use pending::PendingChange;
pub use plugin::SessionPlugin;
pub use reverse_hint::{PathStep, ReversedPath, reverse_hint};
pub use state::FieldInit;

use crate::change_tracker::Original;
use crate::graph::EntityData;
use crate::loader::LoadKey;
use crate::reverse_hint::ReactiveGraph;
use crate::state::SessionState;
use crate::write_guard::Actor;
use reactorm_core::{
    Cx, Driver, EntityId, EntityRef, Error, Filter, FindOptions, Hint, HintTree, Metadata,
    Outcome, Result, TaggedId, Value,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ============================================================================
// Configuration
// ============================================================================

/// How a session treats writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionMode {
    /// Normal operation.
    #[default]
    ReadWrite,
    /// Every mutation fails with [`Error::ReadOnly`].
    ReadOnly,
    /// Commits run every stage except the store write.
    InMemoryWrites,
}

/// Configuration for session behavior.
#[derive(Clone)]
pub struct SessionConfig {
    pub mode: SessionMode,
    /// Live entities of one type above which in-memory searches use the
    /// exact-match index instead of a scan.
    pub index_threshold: usize,
    /// Passes of pre-write hooks a commit runs before giving up.
    pub max_hook_passes: usize,
    /// Reaction iterations a commit runs before giving up.
    pub max_reaction_iterations: usize,
    pub observer: Option<Arc<dyn SessionObserver>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::ReadWrite,
            index_threshold: 1_000,
            max_hook_passes: 10,
            max_reaction_iterations: 100,
            observer: None,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("mode", &self.mode)
            .field("index_threshold", &self.index_threshold)
            .field("max_hook_passes", &self.max_hook_passes)
            .field("max_reaction_iterations", &self.max_reaction_iterations)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn index_threshold(mut self, threshold: usize) -> Self {
        self.index_threshold = threshold;
        self
    }

    #[must_use]
    pub fn max_hook_passes(mut self, passes: usize) -> Self {
        self.max_hook_passes = passes;
        self
    }

    #[must_use]
    pub fn max_reaction_iterations(mut self, iterations: usize) -> Self {
        self.max_reaction_iterations = iterations;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct Shared {
    pub metadata: Arc<Metadata>,
    pub reactions: ReactiveGraph,
    state: Mutex<SessionState>,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(
        &self,
        actor: Actor,
        operation: &'static str,
        f: impl FnOnce(&SessionState, &Metadata) -> Result<T>,
    ) -> Result<T> {
        let state = self.lock();
        state.guard.check_scope(actor, operation)?;
        f(&state, self.metadata.as_ref())
    }

    fn write<T>(&self, f: impl FnOnce(&mut SessionState, &Metadata) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        f(&mut state, self.metadata.as_ref())
    }

    fn entity<T>(
        &self,
        actor: Actor,
        e: EntityRef,
        f: impl FnOnce(&SessionState, &EntityData) -> T,
    ) -> Result<T> {
        self.read(actor, "inspect an entity", |state, _| {
            let data = state.graph.entity(e)?;
            Ok(f(state, data))
        })
    }

    fn get(&self, actor: Actor, e: EntityRef, field: &str) -> Result<Value> {
        self.read(actor, "read a field", |state, md| {
            state.get_plugins(md, actor, e, field)?;
            state.graph.read_value(md, e, field)
        })
    }

    fn reference(&self, actor: Actor, e: EntityRef, field: &str) -> Result<Option<EntityRef>> {
        self.read(actor, "read a reference", |state, md| {
            state.get_plugins(md, actor, e, field)?;
            state.graph.read_reference(md, e, field)
        })
    }

    fn collection(&self, actor: Actor, e: EntityRef, field: &str) -> Result<Vec<EntityRef>> {
        self.read(actor, "read a collection", |state, md| {
            state.get_plugins(md, actor, e, field)?;
            state.graph.read_collection(md, e, field)
        })
    }

    fn original_value(&self, actor: Actor, e: EntityRef, field: &str) -> Result<Option<Value>> {
        self.read(actor, "read an original value", |state, md| {
            let (data, _, fm, _) = state.graph.slot(md, e, field)?;
            Ok(data.changes.original(fm.name).map(|original| match original {
                Original::Value(v) => v.clone(),
                Original::Reference(r) => state
                    .graph
                    .ref_id(r)
                    .map_or(Value::Null, |id| id.value().to_value()),
            }))
        })
    }
}

// ============================================================================
// Session
// ============================================================================

/// Debug information about session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    /// Tracked entities, detached ones excluded.
    pub tracked: usize,
    pub pending_new: usize,
    pub pending_dirty: usize,
    pub pending_delete: usize,
    pub pending_links: usize,
    pub committing: bool,
    pub indexed_fields: usize,
    pub loader: LoaderStats,
}

/// One unit of work over a store.
pub struct Session<D: Driver> {
    pub(crate) shared: Arc<Shared>,
    pub(crate) driver: Arc<D>,
}

impl<D: Driver> Clone for Session<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            driver: Arc::clone(&self.driver),
        }
    }
}

impl<D: Driver> fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.debug_info())
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Session<D> {
    /// Create a session with the default configuration.
    ///
    /// Fails with [`Error::Config`] when a reactive hint cannot be reversed.
    pub fn new(driver: D, metadata: Arc<Metadata>) -> Result<Self> {
        Self::with_config(driver, metadata, SessionConfig::default())
    }

    pub fn with_config(driver: D, metadata: Arc<Metadata>, config: SessionConfig) -> Result<Self> {
        let reactions = ReactiveGraph::build(&metadata)?;
        tracing::debug!(
            entity_types = metadata.entities().count(),
            mode = ?config.mode,
            "Session created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                metadata,
                reactions,
                state: Mutex::new(SessionState::new(config)),
            }),
            driver: Arc::new(driver),
        })
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn metadata(&self) -> &Metadata {
        &self.shared.metadata
    }

    pub fn mode(&self) -> SessionMode {
        self.shared.lock().config.mode
    }

    /// Register a plugin. Plugins run in registration order.
    pub fn add_plugin(&self, plugin: Arc<dyn SessionPlugin>) {
        tracing::debug!(plugin = plugin.name(), "Plugin registered");
        self.shared.lock().plugins.push(plugin);
    }

    // ========================================================================
    // Field access
    // ========================================================================

    /// A primitive or reactive field value.
    ///
    /// Reactive values are computed from loaded data; when their hint is not
    /// loaded the last stored value is returned.
    pub fn get(&self, e: EntityRef, field: &str) -> Result<Value> {
        self.shared.get(Actor::Session, e, field)
    }

    pub fn set(&self, e: EntityRef, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.shared
            .write(|state, md| state.set_value(md, Actor::Session, e, field, value))
    }

    /// A loaded reference. Fails with [`Error::NotLoaded`] when its target
    /// has not been loaded.
    pub fn reference(&self, e: EntityRef, field: &str) -> Result<Option<EntityRef>> {
        self.shared.reference(Actor::Session, e, field)
    }

    pub fn set_reference(&self, e: EntityRef, field: &str, target: Option<EntityRef>) -> Result<()> {
        self.shared
            .write(|state, md| state.set_reference(md, Actor::Session, e, field, target))
    }

    /// A loaded collection, without entities marked for deletion.
    pub fn collection(&self, e: EntityRef, field: &str) -> Result<Vec<EntityRef>> {
        self.shared.collection(Actor::Session, e, field)
    }

    pub fn add(&self, e: EntityRef, field: &str, item: EntityRef) -> Result<()> {
        self.shared
            .write(|state, md| state.add(md, Actor::Session, e, field, item))
    }

    pub fn remove(&self, e: EntityRef, field: &str, item: EntityRef) -> Result<()> {
        self.shared
            .write(|state, md| state.remove(md, Actor::Session, e, field, item))
    }

    /// Mark `e` for deletion. A new entity is dropped from the unit of work.
    pub fn delete(&self, e: EntityRef) -> Result<()> {
        self.shared.write(|state, _| state.delete(Actor::Session, e))
    }

    /// Create an entity with a placeholder id.
    pub fn create(&self, entity_type: &str, fields: Vec<(&str, FieldInit)>) -> Result<EntityRef> {
        self.shared
            .write(|state, md| state.create(md, Actor::Session, entity_type, fields))
    }

    /// Entities reachable through a recursive field, nearest first.
    ///
    /// Fails with [`Error::Cycle`] when the walk revisits an entity on its
    /// path, and with [`Error::NotLoaded`] when it reaches unloaded data.
    pub fn recursive(&self, e: EntityRef, field: &str) -> Result<Vec<EntityRef>> {
        self.shared.collection(Actor::Session, e, field)
    }

    // ========================================================================
    // Entity state
    // ========================================================================

    pub fn state(&self, e: EntityRef) -> Result<ObjectState> {
        self.shared.entity(Actor::Session, e, |_, d| d.state)
    }

    pub fn is_new(&self, e: EntityRef) -> Result<bool> {
        self.shared
            .entity(Actor::Session, e, |_, d| d.state == ObjectState::New)
    }

    /// Whether a persisted entity has unsaved field changes.
    pub fn is_dirty(&self, e: EntityRef) -> Result<bool> {
        self.shared.entity(Actor::Session, e, |_, d| {
            d.state == ObjectState::Persistent && d.changes.is_dirty()
        })
    }

    pub fn is_deleted(&self, e: EntityRef) -> Result<bool> {
        self.shared.entity(Actor::Session, e, |_, d| {
            matches!(d.state, ObjectState::Deleted | ObjectState::Detached)
        })
    }

    pub fn changed_fields(&self, e: EntityRef) -> Result<Vec<&'static str>> {
        self.shared
            .entity(Actor::Session, e, |_, d| d.changes.changed_fields())
    }

    /// The value `field` had before its first unsaved change, if it changed.
    /// References read as the id value of their original target.
    pub fn original_value(&self, e: EntityRef, field: &str) -> Result<Option<Value>> {
        self.shared.original_value(Actor::Session, e, field)
    }

    pub fn id(&self, e: EntityRef) -> Result<EntityId> {
        self.shared.entity(Actor::Session, e, |_, d| d.id)
    }

    pub fn entity_type(&self, e: EntityRef) -> Result<&'static str> {
        self.shared.entity(Actor::Session, e, |_, d| d.entity_type)
    }

    /// The tracked entity with this permanent id, without loading.
    pub fn lookup(&self, id: TaggedId) -> Option<EntityRef> {
        self.shared.lock().graph.identity.get(&id)
    }

    /// What the next commit would write.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        pending::pending_changes(&self.shared.lock().graph)
    }

    pub fn debug_info(&self) -> SessionDebugInfo {
        let state = self.shared.lock();
        let mut info = SessionDebugInfo {
            tracked: 0,
            pending_new: 0,
            pending_dirty: 0,
            pending_delete: 0,
            pending_links: state.graph.links.len(),
            committing: state.guard.is_committing(),
            indexed_fields: state.index.indexed_fields(),
            loader: state.loader.stats.clone(),
        };
        for data in &state.graph.entities {
            match data.state {
                ObjectState::New => info.pending_new += 1,
                ObjectState::Persistent if data.changes.is_dirty() => info.pending_dirty += 1,
                ObjectState::Deleted => info.pending_delete += 1,
                ObjectState::Persistent | ObjectState::Detached => {}
            }
            if data.state != ObjectState::Detached {
                info.tracked += 1;
            }
        }
        info
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Register a commit hook for `event` on `entity_type`.
    pub fn on(
        &self,
        event: HookEvent,
        entity_type: &str,
        hook: impl FnMut(&HookScope, EntityRef) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let name = self.shared.metadata.entity(entity_type)?.name;
        self.shared.lock().hooks.register(event, name, Box::new(hook));
        tracing::debug!(event = event.name(), entity_type = name, "Hook registered");
        Ok(())
    }

    pub fn before_create(
        &self,
        entity_type: &str,
        hook: impl FnMut(&HookScope, EntityRef) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.on(HookEvent::BeforeCreate, entity_type, hook)
    }

    pub fn before_update(
        &self,
        entity_type: &str,
        hook: impl FnMut(&HookScope, EntityRef) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.on(HookEvent::BeforeUpdate, entity_type, hook)
    }

    pub fn before_delete(
        &self,
        entity_type: &str,
        hook: impl FnMut(&HookScope, EntityRef) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.on(HookEvent::BeforeDelete, entity_type, hook)
    }

    pub fn after_validation(
        &self,
        entity_type: &str,
        hook: impl FnMut(&HookScope, EntityRef) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.on(HookEvent::AfterValidation, entity_type, hook)
    }

    pub fn before_commit(
        &self,
        entity_type: &str,
        hook: impl FnMut(&HookScope, EntityRef) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.on(HookEvent::BeforeCommit, entity_type, hook)
    }

    pub fn after_commit(
        &self,
        entity_type: &str,
        hook: impl FnMut(&HookScope, EntityRef) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.on(HookEvent::AfterCommit, entity_type, hook)
    }

    // ========================================================================
    // Loading and searching
    // ========================================================================

    /// Load one entity by id. Returns the tracked instance when there is one;
    /// `None` when the store has no such row or it is soft-deleted.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(id = %id))]
    pub async fn load(&self, cx: &Cx, id: TaggedId) -> Outcome<Option<EntityRef>, Error> {
        let loaded = try_outcome!(self.load_all(cx, &[id]).await);
        Outcome::Ok(loaded.into_iter().next())
    }

    /// Load several entities by id in one batch, in request order. Missing
    /// and soft-deleted rows are skipped.
    pub async fn load_all(&self, cx: &Cx, ids: &[TaggedId]) -> Outcome<Vec<EntityRef>, Error> {
        let metadata = &self.shared.metadata;
        for id in ids {
            try_result!(metadata.entity_for_id(id));
        }
        let keys = ids.iter().map(|id| LoadKey::Entity(*id)).collect();
        try_outcome!(self.ensure_loaded(cx, keys).await);

        let state = self.shared.lock();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(e) = state.graph.identity.get(id) else {
                continue;
            };
            if !try_result!(state.is_soft_deleted(metadata, e)) && !out.contains(&e) {
                out.push(e);
            }
        }
        Outcome::Ok(out)
    }

    /// Stored entities of `entity_type` matching `filter`, registered through
    /// the identity map. Entities marked for deletion are left out.
    #[tracing::instrument(level = "debug", skip(self, cx, filter, options))]
    pub async fn find(
        &self,
        cx: &Cx,
        entity_type: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let metadata = &self.shared.metadata;
        let meta = try_result!(metadata.entity(entity_type));
        try_result!(self.before_find(meta.name, filter));

        let rows = try_outcome!(self.driver.find(cx, meta, filter, options).await);
        let mut state = self.shared.lock();
        state.loader.stats.driver_calls += 1;
        if let Some(observer) = &state.config.observer {
            observer.rows_loaded(meta.name, rows.len());
        }
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let e = try_result!(state.register_row(metadata, row));
            if !state.graph.is_live(e) || out.contains(&e) {
                continue;
            }
            if !options.include_soft_deleted && try_result!(state.is_soft_deleted(metadata, e)) {
                continue;
            }
            out.push(e);
        }
        tracing::debug!(entity_type = meta.name, found = out.len(), "Find complete");
        Outcome::Ok(out)
    }

    /// Entities matching every criterion among stored rows and everything
    /// tracked in memory, new and changed entities included, judged by their
    /// current in-memory values.
    #[tracing::instrument(level = "debug", skip(self, cx, criteria))]
    pub async fn find_with_new_or_changed(
        &self,
        cx: &Cx,
        entity_type: &str,
        criteria: &Criteria,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let metadata = &self.shared.metadata;
        let meta = try_result!(metadata.entity(entity_type));
        try_result!(criteria.check(meta));
        let filter = {
            let state = self.shared.lock();
            try_result!(criteria.to_filter(&state.graph, meta))
        };

        if let Some(filter) = &filter {
            try_outcome!(self.find(cx, meta.name, filter, &FindOptions::new()).await);
        } else {
            tracing::debug!(entity_type = meta.name, "Criteria name an unsaved entity; store skipped");
            try_result!(self.before_find(meta.name, &Filter::new()));
        }

        let mut state = self.shared.lock();
        let threshold = state.config.index_threshold;
        let candidates: BTreeSet<EntityRef> = if state.graph.count_of_type(meta.name) > threshold {
            let SessionState { index, graph, .. } = &mut *state;
            try_result!(index.lookup(graph, meta, criteria))
        } else {
            state.graph.of_type(meta.name).collect()
        };
        let mut out = Vec::new();
        for e in candidates {
            if !state.graph.is_live(e) || try_result!(state.is_soft_deleted(metadata, e)) {
                continue;
            }
            if try_result!(index::matches(&state.graph, metadata, e, criteria)) {
                out.push(e);
            }
        }
        Outcome::Ok(out)
    }

    fn before_find(&self, entity_type: &'static str, filter: &Filter) -> Result<()> {
        let plugins = self.shared.lock().plugins.clone();
        for plugin in &plugins {
            plugin.before_find(entity_type, filter)?;
        }
        Ok(())
    }

    /// Load whatever `e.field` needs, including the hint of a reactive
    /// field, and read it as a reference.
    pub async fn load_reference(
        &self,
        cx: &Cx,
        e: EntityRef,
        field: &str,
    ) -> Outcome<Option<EntityRef>, Error> {
        try_outcome!(self.load_field(cx, e, field).await);
        Outcome::Ok(try_result!(self.reference(e, field)))
    }

    pub async fn load_collection(
        &self,
        cx: &Cx,
        e: EntityRef,
        field: &str,
    ) -> Outcome<Vec<EntityRef>, Error> {
        try_outcome!(self.load_field(cx, e, field).await);
        Outcome::Ok(try_result!(self.collection(e, field)))
    }

    /// Load the hint of a reactive field and read its current value.
    pub async fn load_value(&self, cx: &Cx, e: EntityRef, field: &str) -> Outcome<Value, Error> {
        try_outcome!(self.load_field(cx, e, field).await);
        Outcome::Ok(try_result!(self.get(e, field)))
    }

    async fn load_field(&self, cx: &Cx, e: EntityRef, field: &str) -> Outcome<(), Error> {
        let name = {
            let state = self.shared.lock();
            let (_, _, fm, _) = try_result!(state.graph.slot(&self.shared.metadata, e, field));
            fm.name
        };
        let mut tree = HintTree::new();
        tree.insert_path(&[name]);
        self.populate_tree(cx, &[e], &tree).await
    }

    /// Load everything `hint` reaches from each of `entities`. Requests from
    /// concurrent operations are batched together.
    #[tracing::instrument(level = "debug", skip(self, cx, hint), fields(entities = entities.len()))]
    pub async fn populate(&self, cx: &Cx, entities: &[EntityRef], hint: &Hint) -> Outcome<(), Error> {
        let tree = hint.to_tree();
        {
            let state = self.shared.lock();
            for e in entities {
                let data = try_result!(state.graph.entity(*e));
                let meta = try_result!(self.shared.metadata.entity(data.entity_type));
                for (name, _) in tree.iter() {
                    try_result!(meta.field_meta(name));
                }
            }
        }
        self.populate_tree(cx, entities, &tree).await
    }

    /// Load the relation behind a recursive field as far as it goes, then
    /// walk it.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn load_recursive(
        &self,
        cx: &Cx,
        e: EntityRef,
        field: &str,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let metadata = &self.shared.metadata;
        let mut last: Option<LoadKey> = None;
        loop {
            let key = {
                let state = self.shared.lock();
                match state.graph.read_collection(metadata, e, field) {
                    Ok(found) => return Outcome::Ok(found),
                    Err(Error::NotLoaded { entity, relation }) => {
                        let key = find_tracked(&state, entity)
                            .and_then(|owner| state.key_for(metadata, owner, relation).ok().flatten());
                        match key {
                            Some(key) if last != Some(key) => key,
                            _ => return Outcome::Err(Error::NotLoaded { entity, relation }),
                        }
                    }
                    Err(err) => return Outcome::Err(err),
                }
            };
            last = Some(key);
            try_outcome!(self.ensure_loaded(cx, vec![key]).await);
        }
    }
}

fn find_tracked(state: &SessionState, id: EntityId) -> Option<EntityRef> {
    match id {
        EntityId::Persisted(id) => state.graph.identity.get(&id),
        EntityId::Placeholder(_) => state
            .graph
            .entities
            .iter()
            .position(|d| d.id == id)
            .and_then(|i| u32::try_from(i).ok())
            .map(EntityRef::new),
    }
}

// ============================================================================
// Hook scope
// ============================================================================

/// The handle a commit hook receives.
///
/// While its commit's hook window is open (the `before_create`,
/// `before_update` and `before_delete` hooks) it may mutate; other hooks can
/// only read. Once the commit finishes, every use fails with
/// [`Error::StaleHookScope`].
#[derive(Clone)]
pub struct HookScope {
    pub(crate) shared: Arc<Shared>,
    pub(crate) token: u64,
}

impl fmt::Debug for HookScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookScope").field("token", &self.token).finish()
    }
}

impl HookScope {
    fn actor(&self) -> Actor {
        Actor::Hook(self.token)
    }

    pub fn get(&self, e: EntityRef, field: &str) -> Result<Value> {
        self.shared.get(self.actor(), e, field)
    }

    pub fn set(&self, e: EntityRef, field: &str, value: impl Into<Value>) -> Result<()> {
        let (actor, value) = (self.actor(), value.into());
        self.shared
            .write(|state, md| state.set_value(md, actor, e, field, value))
    }

    pub fn reference(&self, e: EntityRef, field: &str) -> Result<Option<EntityRef>> {
        self.shared.reference(self.actor(), e, field)
    }

    pub fn set_reference(&self, e: EntityRef, field: &str, target: Option<EntityRef>) -> Result<()> {
        let actor = self.actor();
        self.shared
            .write(|state, md| state.set_reference(md, actor, e, field, target))
    }

    pub fn collection(&self, e: EntityRef, field: &str) -> Result<Vec<EntityRef>> {
        self.shared.collection(self.actor(), e, field)
    }

    pub fn add(&self, e: EntityRef, field: &str, item: EntityRef) -> Result<()> {
        let actor = self.actor();
        self.shared.write(|state, md| state.add(md, actor, e, field, item))
    }

    pub fn remove(&self, e: EntityRef, field: &str, item: EntityRef) -> Result<()> {
        let actor = self.actor();
        self.shared
            .write(|state, md| state.remove(md, actor, e, field, item))
    }

    pub fn delete(&self, e: EntityRef) -> Result<()> {
        let actor = self.actor();
        self.shared.write(|state, _| state.delete(actor, e))
    }

    pub fn create(&self, entity_type: &str, fields: Vec<(&str, FieldInit)>) -> Result<EntityRef> {
        let actor = self.actor();
        self.shared
            .write(|state, md| state.create(md, actor, entity_type, fields))
    }

    pub fn id(&self, e: EntityRef) -> Result<EntityId> {
        self.shared.entity(self.actor(), e, |_, d| d.id)
    }

    pub fn entity_type(&self, e: EntityRef) -> Result<&'static str> {
        self.shared.entity(self.actor(), e, |_, d| d.entity_type)
    }

    pub fn is_new(&self, e: EntityRef) -> Result<bool> {
        self.shared
            .entity(self.actor(), e, |_, d| d.state == ObjectState::New)
    }

    pub fn changed_fields(&self, e: EntityRef) -> Result<Vec<&'static str>> {
        self.shared
            .entity(self.actor(), e, |_, d| d.changes.changed_fields())
    }

    pub fn original_value(&self, e: EntityRef, field: &str) -> Result<Option<Value>> {
        self.shared.original_value(self.actor(), e, field)
    }
}
