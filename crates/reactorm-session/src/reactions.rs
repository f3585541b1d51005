//! The reaction engine: recalculates reactive values until nothing changes.
//!
//! Each iteration drains the change log, maps every change to the reversed
//! paths it triggers, walks those paths back to the owners (loading what the
//! walk crosses), loads the owners' hints and recomputes. Stored results that
//! differ are written back, which logs new changes for the next iteration.

use crate::change_tracker::{Change, Original, RefValue};
use crate::graph::{LinkDelta, Slot, StateReader};
use crate::reverse_hint::{PathStep, ReversedPath};
use crate::state::SessionState;
use crate::write_guard::CommitStage;
use crate::Session;
use reactorm_core::{Cx, Driver, EntityRef, Error, FieldKind, Metadata, Outcome, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Reactive values to recalculate: (owner type, field) to owners.
type Stale = BTreeMap<(&'static str, &'static str), BTreeSet<EntityRef>>;

impl SessionState {
    /// Entities one backward step leads to from `e`, before type filtering.
    ///
    /// References are followed to their current and original targets;
    /// many-to-many collections include partners removed since the last
    /// commit.
    fn step_back(&self, metadata: &Metadata, e: EntityRef, step: &PathStep) -> Vec<EntityRef> {
        let Ok((data, _, fm, slot)) = self.graph.slot(metadata, e, step.relation) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        match (&fm.kind, slot) {
            (
                FieldKind::ManyToOne { .. }
                | FieldKind::Polymorphic { .. }
                | FieldKind::ReactiveReference { .. },
                Slot::Reference(value),
            ) => {
                out.extend(self.graph.resolve(value).entity());
                if let Some(Original::Reference(original)) = data.changes.original(fm.name) {
                    out.extend(self.graph.resolve(original).entity());
                }
            }
            (FieldKind::OneToMany { .. } | FieldKind::OneToOne { .. }, Slot::Collection(c)) => {
                out.extend(c.items.iter().copied());
            }
            (
                FieldKind::ManyToMany {
                    join_table, column, ..
                },
                Slot::Collection(c),
            ) => {
                out.extend(c.items.iter().copied());
                out.extend(
                    self.graph
                        .links
                        .partners(join_table, column, e)
                        .filter(|(_, delta)| *delta == LinkDelta::Removed)
                        .map(|(other, _)| other),
                );
            }
            _ => {}
        }
        out
    }

    /// Recompute one reactive value and store it. Returns whether it changed.
    fn recalculate(&mut self, metadata: &Metadata, e: EntityRef, field: &'static str) -> Result<bool> {
        let (_, _, fm, _) = self.graph.slot(metadata, e, field)?;
        let reader = StateReader::new(&self.graph, metadata);
        let computed = match &fm.kind {
            FieldKind::ReactiveField { compute, .. } => compute.call(&reader, e).map(Computed::Value),
            FieldKind::ReactiveReference { compute, .. } => {
                compute.call(&reader, e).map(Computed::Reference)
            }
            FieldKind::ReactiveCollection { compute, .. } => compute
                .call(&reader, e)
                .map(|items| Computed::Collection(items.into_iter().filter(|i| self.graph.is_live(*i)).collect())),
            _ => return Ok(false),
        };
        let computed = match computed {
            Ok(computed) => computed,
            Err(err) => {
                tracing::debug!(%e, field, error = %err, "Recalculation failed");
                return Err(err);
            }
        };
        match computed {
            Computed::Value(value) => self.write_value(metadata, e, field, value),
            Computed::Reference(target) => {
                self.write_reference(metadata, e, field, target.map_or(RefValue::Null, RefValue::Entity))
            }
            Computed::Collection(items) => self.write_collection(metadata, e, field, items),
        }
    }
}

enum Computed {
    Value(reactorm_core::Value),
    Reference(Option<EntityRef>),
    Collection(Vec<EntityRef>),
}

fn triggers(path: &ReversedPath, change: &Change) -> bool {
    match change {
        Change::Field(_, field) => path.fields.contains(field),
        Change::Created(_) => path.path.is_empty(),
        Change::Deleted(_) => true,
    }
}

impl<D: Driver> Session<D> {
    /// Recalculate until the change log stays empty. Returns how many stored
    /// reactive values changed.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub(crate) async fn run_reactions(&self, cx: &Cx) -> Outcome<usize, Error> {
        let metadata = &self.shared.metadata;
        let reactions = &self.shared.reactions;
        let limit = {
            let mut state = self.shared.lock();
            state.guard.enter(CommitStage::Reactions);
            state.config.max_reaction_iterations
        };
        let mut recalculated = 0;

        for iteration in 0..limit {
            // Group sources by the reversed path they trigger.
            let groups: Vec<(&ReversedPath, BTreeSet<EntityRef>)> = {
                let mut state = self.shared.lock();
                let changes = state.graph.log.drain();
                if changes.is_empty() {
                    tracing::debug!(iterations = iteration, recalculated, "Reactions settled");
                    return Outcome::Ok(recalculated);
                }
                let mut groups: BTreeMap<(&'static str, usize), BTreeSet<EntityRef>> = BTreeMap::new();
                for change in &changes {
                    let Ok(data) = state.graph.entity(change.entity()) else {
                        continue;
                    };
                    for (i, path) in reactions.paths_from(data.entity_type).iter().enumerate() {
                        if triggers(path, change) {
                            groups
                                .entry((data.entity_type, i))
                                .or_default()
                                .insert(change.entity());
                        }
                    }
                }
                groups
                    .into_iter()
                    .map(|((source, i), sources)| (&reactions.paths_from(source)[i], sources))
                    .collect()
            };

            let mut stale = Stale::new();
            for (path, sources) in groups {
                let owners = try_outcome!(self.walk_back(cx, path, sources).await);
                stale
                    .entry((path.owner_type, path.owner_field))
                    .or_default()
                    .extend(owners);
            }

            // One combined load per owner type.
            let mut by_type: BTreeMap<&'static str, BTreeSet<EntityRef>> = BTreeMap::new();
            for ((owner_type, _), owners) in &stale {
                by_type.entry(*owner_type).or_default().extend(owners.iter().copied());
            }
            for (owner_type, owners) in by_type {
                if let Some(tree) = reactions.load_tree(owner_type) {
                    let owners: Vec<EntityRef> = owners.into_iter().collect();
                    try_outcome!(self.populate_tree(cx, &owners, tree).await);
                }
            }

            {
                let mut state = self.shared.lock();
                for ((owner_type, field), owners) in stale {
                    for owner in owners {
                        if !state.graph.is_live(owner) {
                            continue;
                        }
                        if try_result!(state.recalculate(metadata, owner, field)) {
                            recalculated += 1;
                            if let Some(observer) = &state.config.observer {
                                observer.reaction_recalculated(owner_type, owner, field);
                            }
                            tracing::trace!(owner_type, %owner, field, "Recalculated");
                        }
                    }
                }
            }
        }

        let pending = self.shared.lock().graph.log.len();
        tracing::warn!(limit, pending, "Reactions did not settle");
        Outcome::Err(Error::ReactionLimit {
            stage: "reactions",
            iterations: limit,
        })
    }

    /// Owners reached by walking `path` back from `sources`.
    async fn walk_back(
        &self,
        cx: &Cx,
        path: &ReversedPath,
        sources: BTreeSet<EntityRef>,
    ) -> Outcome<BTreeSet<EntityRef>, Error> {
        let mut current = sources;
        for step in &path.path {
            current = if step.transitive {
                try_outcome!(self.step_repeated(cx, step, current).await)
            } else {
                try_outcome!(self.step_once(cx, step, &current).await)
            };
            if current.is_empty() {
                break;
            }
        }
        Outcome::Ok(current)
    }

    /// Entities one backward `step` leads to from `from`, loading what it
    /// crosses.
    async fn step_once(
        &self,
        cx: &Cx,
        step: &PathStep,
        from: &BTreeSet<EntityRef>,
    ) -> Outcome<BTreeSet<EntityRef>, Error> {
        let metadata = &self.shared.metadata;
        let keys = {
            let state = self.shared.lock();
            let mut keys = Vec::new();
            for e in from {
                if let Ok(Some(key)) = state.key_for(metadata, *e, step.relation) {
                    keys.push(key);
                }
                keys.extend(state.original_key(metadata, *e, step.relation));
            }
            keys
        };
        try_outcome!(self.ensure_loaded(cx, keys).await);

        let state = self.shared.lock();
        Outcome::Ok(
            from.iter()
                .flat_map(|e| state.step_back(metadata, *e, step))
                .filter(|e| state.graph.entity(*e).is_ok_and(|d| d.entity_type == step.target))
                .collect(),
        )
    }

    /// Everything reached by repeating `step` one or more times.
    async fn step_repeated(
        &self,
        cx: &Cx,
        step: &PathStep,
        from: BTreeSet<EntityRef>,
    ) -> Outcome<BTreeSet<EntityRef>, Error> {
        let mut reached = BTreeSet::new();
        let mut frontier = from;
        while !frontier.is_empty() {
            let next = try_outcome!(self.step_once(cx, step, &frontier).await);
            frontier = next.into_iter().filter(|e| reached.insert(*e)).collect();
        }
        Outcome::Ok(reached)
    }
}
