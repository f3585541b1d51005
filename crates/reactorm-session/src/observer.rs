//! Session instrumentation.
//!
//! A session reports what it does to an optional [`SessionObserver`] given in
//! its [`crate::SessionConfig`]. Nothing is process-global: two sessions with
//! different observers never see each other's events.
//!
//! Observers are called while the session state is locked and must not call
//! back into the session.

use crate::commit::CommitSummary;
use reactorm_core::EntityRef;

/// Receives session events. Every method defaults to doing nothing.
pub trait SessionObserver: Send + Sync {
    fn field_set(&self, _entity_type: &'static str, _entity: EntityRef, _field: &'static str) {}

    fn entity_created(&self, _entity_type: &'static str, _entity: EntityRef) {}

    fn entity_deleted(&self, _entity_type: &'static str, _entity: EntityRef) {}

    /// Rows of one type materialized from a driver call.
    fn rows_loaded(&self, _entity_type: &'static str, _count: usize) {}

    /// A reactive value was recomputed and its stored value changed.
    fn reaction_recalculated(
        &self,
        _entity_type: &'static str,
        _entity: EntityRef,
        _field: &'static str,
    ) {
    }

    fn commit_finished(&self, _summary: &CommitSummary) {}
}

/// Reports every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn field_set(&self, entity_type: &'static str, entity: EntityRef, field: &'static str) {
        tracing::trace!(entity_type, %entity, field, "Field set");
    }

    fn entity_created(&self, entity_type: &'static str, entity: EntityRef) {
        tracing::trace!(entity_type, %entity, "Entity created");
    }

    fn entity_deleted(&self, entity_type: &'static str, entity: EntityRef) {
        tracing::trace!(entity_type, %entity, "Entity marked for deletion");
    }

    fn rows_loaded(&self, entity_type: &'static str, count: usize) {
        tracing::debug!(entity_type, count, "Rows loaded");
    }

    fn reaction_recalculated(&self, entity_type: &'static str, entity: EntityRef, field: &'static str) {
        tracing::trace!(entity_type, %entity, field, "Reactive value recalculated");
    }

    fn commit_finished(&self, summary: &CommitSummary) {
        tracing::info!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            linked = summary.linked,
            unlinked = summary.unlinked,
            recalculated = summary.recalculated,
            "Commit finished"
        );
    }
}
