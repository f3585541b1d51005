//! The commit pipeline.
//!
//! Stages run in order: pre-write hooks, cycle checks and validation,
//! reactions, audit stamps and id assignment, the store write, post-commit
//! hooks, and clearing. A failure before the write restores the tracked
//! state captured when the commit started; a failure during the write keeps
//! every pending change (and the assigned ids) so the commit can be retried.

use crate::graph::{EntityGraph, ObjectState, Slot, StateReader};
use crate::hooks::HookEvent;
use crate::pending::build_batch;
use crate::recursive::check_cycles;
use crate::state::SessionState;
use crate::write_guard::CommitStage;
use crate::{HookScope, Session, SessionMode, Shared};
use reactorm_core::{
    Cx, Driver, EntityId, EntityRef, Error, Metadata, Outcome, Result, ValidationError, Value,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a successful commit did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub linked: usize,
    pub unlinked: usize,
    /// Stored reactive values that changed.
    pub recalculated: usize,
    /// Passes of pre-write hooks run before no entity needed another.
    pub hook_passes: usize,
}

/// Ends the commit however it finishes. Restores the starting state unless
/// the commit completed or reached the store write.
struct CommitGuard<'a> {
    shared: &'a Shared,
    token: u64,
    snapshot: Option<EntityGraph>,
    completed: bool,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let restore = !self.completed && state.guard.stage().is_none_or(CommitStage::before_write);
        if restore {
            if let Some(snapshot) = self.snapshot.take() {
                state.graph.restore(&self.shared.metadata, snapshot);
                state.index.clear();
                tracing::debug!("Commit failed before the write; session state restored");
            }
        }
        state.guard.finish(self.token);
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as i64)
}

impl SessionState {
    /// Entities the commit writes, with the pre-write hook event they get.
    fn hook_targets(&self) -> Vec<(HookEvent, &'static str, EntityRef)> {
        let mut out = Vec::new();
        for (i, data) in self.graph.entities.iter().enumerate() {
            let event = match data.state {
                ObjectState::New => HookEvent::BeforeCreate,
                ObjectState::Persistent if data.changes.is_dirty() => HookEvent::BeforeUpdate,
                ObjectState::Deleted => HookEvent::BeforeDelete,
                ObjectState::Persistent | ObjectState::Detached => continue,
            };
            out.push((event, data.entity_type, EntityRef::new(i as u32)));
        }
        out
    }

    /// Required fields and rules of every new or changed live entity. All
    /// failures are collected.
    fn validate(&self, metadata: &Metadata) -> Result<ValidationError> {
        let reader = StateReader::new(&self.graph, metadata);
        let mut all = ValidationError::new();
        for (i, data) in self.graph.entities.iter().enumerate() {
            let checked = match data.state {
                ObjectState::New => true,
                ObjectState::Persistent => data.changes.is_dirty(),
                ObjectState::Deleted | ObjectState::Detached => false,
            };
            if !checked {
                continue;
            }
            let e = EntityRef::new(i as u32);
            let meta = metadata.entity(data.entity_type)?;
            let mut errors = ValidationError::new();
            for (fm, slot) in meta.fields().iter().zip(&data.slots) {
                if fm.kind.is_required() && !self.is_set(slot) {
                    errors.add_required(fm.name);
                }
            }
            for rule in &meta.rules {
                rule.check(&reader, e, &mut errors)?;
            }
            if !errors.is_empty() {
                all.extend(errors.with_entity(data.id));
            }
        }
        Ok(all)
    }

    fn is_set(&self, slot: &Slot) -> bool {
        match slot {
            Slot::Value(v) => !v.is_null(),
            Slot::Reference(value) => self.graph.ref_id(value).is_some() || self.graph.resolve(value).entity().is_some(),
            Slot::Unset => false,
            Slot::Collection(_) | Slot::Walk => true,
        }
    }

    /// Stamp audit columns of entities about to be inserted or updated.
    fn stamp(&mut self, metadata: &Metadata, now: i64) -> Result<()> {
        let targets: Vec<(EntityRef, ObjectState, &'static str)> = self
            .graph
            .entities
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                d.state == ObjectState::New
                    || (d.state == ObjectState::Persistent && d.changes.is_dirty())
            })
            .map(|(i, d)| (EntityRef::new(i as u32), d.state, d.entity_type))
            .collect();
        for (e, state, entity_type) in targets {
            let Some(ts) = metadata.entity(entity_type)?.timestamps else {
                continue;
            };
            if state == ObjectState::New {
                self.write_value(metadata, e, ts.created_at, Value::Timestamp(now))?;
            }
            self.write_value(metadata, e, ts.updated_at, Value::Timestamp(now))?;
        }
        Ok(())
    }

    /// New entities still carrying placeholders, by type.
    fn unassigned(&self) -> BTreeMap<&'static str, Vec<EntityRef>> {
        let mut out: BTreeMap<&'static str, Vec<EntityRef>> = BTreeMap::new();
        for (i, data) in self.graph.entities.iter().enumerate() {
            if data.state == ObjectState::New && data.id.is_placeholder() {
                out.entry(data.entity_type).or_default().push(EntityRef::new(i as u32));
            }
        }
        out
    }

    /// Promote written entities and forget what was pending.
    fn clear_committed(&mut self) {
        let mut detached = Vec::new();
        for (i, data) in self.graph.entities.iter_mut().enumerate() {
            match data.state {
                ObjectState::New => data.state = ObjectState::Persistent,
                ObjectState::Deleted => detached.push((EntityRef::new(i as u32), data.entity_type)),
                ObjectState::Persistent | ObjectState::Detached => {}
            }
            data.changes.clear();
        }
        for (e, entity_type) in detached {
            self.graph.detach(e);
            self.index.on_untrack(entity_type, e);
        }
        self.graph.links.clear();
        self.graph.log.clear();
    }
}

impl<D: Driver> Session<D> {
    /// Commit every pending change.
    ///
    /// Fails with [`Error::CommitInProgress`] when another commit on this
    /// session has not finished.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&self, cx: &Cx) -> Outcome<CommitSummary, Error> {
        let (token, snapshot) = {
            let mut state = self.shared.lock();
            let token = try_result!(state.guard.begin());
            (token, state.graph.clone())
        };
        let mut guard = CommitGuard {
            shared: &self.shared,
            token,
            snapshot: Some(snapshot),
            completed: false,
        };
        let outcome = self.run_commit(cx, token).await;
        if matches!(outcome, Outcome::Ok(_)) {
            guard.completed = true;
        }
        drop(guard);
        outcome
    }

    async fn run_commit(&self, cx: &Cx, token: u64) -> Outcome<CommitSummary, Error> {
        let metadata = &self.shared.metadata;
        let mut summary = CommitSummary::default();

        // 1. Pre-write hooks, until no entity newly needs one.
        let max_passes = self.shared.lock().config.max_hook_passes;
        let mut hooked: HashSet<(EntityRef, HookEvent)> = HashSet::new();
        for pass in 0..=max_passes {
            let due: Vec<(HookEvent, &'static str, EntityRef)> = {
                let mut state = self.shared.lock();
                state.guard.enter(CommitStage::Hooks);
                state
                    .hook_targets()
                    .into_iter()
                    .filter(|(event, t, e)| !hooked.contains(&(*e, *event)) && state.hooks.has(*event, t))
                    .collect()
            };
            if due.is_empty() {
                break;
            }
            if pass == max_passes {
                return Outcome::Err(Error::ReactionLimit {
                    stage: "hooks",
                    iterations: max_passes,
                });
            }
            summary.hook_passes += 1;
            for (event, entity_type, e) in due {
                hooked.insert((e, event));
                try_result!(self.fire(token, event, entity_type, e));
            }
        }

        // 2. Cycles and validation.
        let validated: Vec<(&'static str, EntityRef)> = {
            let mut state = self.shared.lock();
            state.guard.enter(CommitStage::Validation);
            try_result!(check_cycles(&state.graph, metadata));
            let errors = try_result!(state.validate(metadata));
            if !errors.is_empty() {
                tracing::debug!(failures = errors.len(), "Validation failed");
                return Outcome::Err(Error::Validation(errors));
            }
            state
                .hook_targets()
                .into_iter()
                .filter(|(event, _, _)| *event != HookEvent::BeforeDelete)
                .map(|(_, t, e)| (t, e))
                .collect()
        };
        for (entity_type, e) in validated {
            try_result!(self.fire(token, HookEvent::AfterValidation, entity_type, e));
        }

        // 3. Reactions.
        summary.recalculated = try_outcome!(self.run_reactions(cx).await);

        // 4. Audit stamps, permanent ids, before_commit.
        let unassigned = {
            let mut state = self.shared.lock();
            state.guard.enter(CommitStage::Flush);
            try_result!(state.stamp(metadata, now_micros()));
            state.unassigned()
        };
        for (entity_type, entities) in unassigned {
            let meta = try_result!(metadata.entity(entity_type));
            let ids = try_outcome!(self.driver.assign_ids(cx, meta, entities.len()).await);
            if ids.len() != entities.len() {
                return Outcome::Err(Error::Custom(format!(
                    "driver assigned {} ids for {} new {entity_type} entities",
                    ids.len(),
                    entities.len()
                )));
            }
            let mut state = self.shared.lock();
            for (e, id) in entities.into_iter().zip(ids) {
                if let Ok(data) = state.graph.entity_mut(e) {
                    data.id = EntityId::Persisted(id);
                }
                state.graph.identity.insert(&id, e);
            }
            tracing::debug!(entity_type, "Assigned permanent ids");
        }
        let written = self.shared.lock().hook_targets();
        for (_, entity_type, e) in &written {
            try_result!(self.fire(token, HookEvent::BeforeCommit, entity_type, *e));
        }

        // 5. The write.
        let (batch, mode) = {
            let mut state = self.shared.lock();
            let batch = try_result!(build_batch(&state.graph, metadata));
            state.guard.enter(CommitStage::Write);
            (batch, state.config.mode)
        };
        summary.inserted = batch.inserts.len();
        summary.updated = batch.updates.len();
        summary.deleted = batch.deletes.len();
        summary.linked = batch.links.len();
        summary.unlinked = batch.unlinks.len();
        if mode == SessionMode::InMemoryWrites {
            tracing::debug!(operations = batch.len(), "In-memory writes: skipping the store");
        } else if !batch.is_empty() {
            try_outcome!(self.driver.execute_write(cx, &batch).await);
        }

        // 6. Post-commit hooks. The write is done: state is cleared even if
        // one of them fails.
        self.shared.lock().guard.enter(CommitStage::AfterCommit);
        let mut after = Ok(());
        for (_, entity_type, e) in &written {
            if let Err(err) = self.fire(token, HookEvent::AfterCommit, entity_type, *e) {
                after = Err(err);
                break;
            }
        }

        // 7. Clear.
        {
            let mut state = self.shared.lock();
            state.clear_committed();
            if let Some(observer) = &state.config.observer {
                observer.commit_finished(&summary);
            }
        }
        tracing::info!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            recalculated = summary.recalculated,
            "Commit complete"
        );
        try_result!(after);
        Outcome::Ok(summary)
    }

    /// Run the hooks for one entity with a scope tied to this commit.
    fn fire(&self, token: u64, event: HookEvent, entity_type: &str, e: EntityRef) -> Result<()> {
        let mut hooks = {
            let mut state = self.shared.lock();
            if !state.hooks.has(event, entity_type) {
                return Ok(());
            }
            state.guard.set_writable(event.can_write());
            std::mem::take(&mut state.hooks)
        };
        let scope = HookScope {
            shared: Arc::clone(&self.shared),
            token,
        };
        tracing::trace!(event = event.name(), entity_type, %e, "Firing hooks");
        let result = hooks.fire(event, &scope, entity_type, e);

        let mut state = self.shared.lock();
        state.guard.set_writable(false);
        let added = std::mem::replace(&mut state.hooks, hooks);
        state.hooks.absorb(added);
        result
    }
}
