//! Commit hooks, registered per entity type.
//!
//! Hooks receive a [`HookScope`] and the entity they fire for. Only the
//! `before_*` hooks of the first commit stage may mutate; the others can read
//! and abort the commit by returning an error.

use crate::HookScope;
use reactorm_core::{EntityRef, Result};

/// Type alias for hook callbacks.
pub type HookFn = Box<dyn FnMut(&HookScope, EntityRef) -> Result<()> + Send>;

/// Commit hook events, in the order a commit fires them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// Fired for every new entity; may mutate.
    BeforeCreate,
    /// Fired for every dirty persisted entity; may mutate.
    BeforeUpdate,
    /// Fired for every entity marked for deletion; may mutate.
    BeforeDelete,
    /// Fired after validation passed.
    AfterValidation,
    /// Fired after ids are assigned, before the write.
    BeforeCommit,
    /// Fired after the write succeeded.
    AfterCommit,
}

impl HookEvent {
    /// Whether hooks for this event may mutate entities.
    pub fn can_write(self) -> bool {
        matches!(
            self,
            HookEvent::BeforeCreate | HookEvent::BeforeUpdate | HookEvent::BeforeDelete
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            HookEvent::BeforeCreate => "before_create",
            HookEvent::BeforeUpdate => "before_update",
            HookEvent::BeforeDelete => "before_delete",
            HookEvent::AfterValidation => "after_validation",
            HookEvent::BeforeCommit => "before_commit",
            HookEvent::AfterCommit => "after_commit",
        }
    }
}

/// Registered hooks, in registration order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<(HookEvent, &'static str, HookFn)>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl HookRegistry {
    pub fn register(&mut self, event: HookEvent, entity_type: &'static str, hook: HookFn) {
        self.hooks.push((event, entity_type, hook));
    }

    pub fn has(&self, event: HookEvent, entity_type: &str) -> bool {
        self.hooks
            .iter()
            .any(|(ev, t, _)| *ev == event && *t == entity_type)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook for `event` on `entity_type`, stopping at the first error.
    pub fn fire(
        &mut self,
        event: HookEvent,
        scope: &HookScope,
        entity_type: &str,
        entity: EntityRef,
    ) -> Result<()> {
        for (ev, t, hook) in &mut self.hooks {
            if *ev == event && *t == entity_type {
                hook(scope, entity)?;
            }
        }
        Ok(())
    }

    /// Append hooks registered elsewhere (while this registry was firing).
    pub fn absorb(&mut self, other: HookRegistry) {
        self.hooks.extend(other.hooks);
    }
}
