//! Session plugins: checks that run before reads, writes and queries.
//!
//! Plugins run in registration order for operations issued by application
//! code and hook scopes. Derived writes made by the reaction engine do not
//! pass through plugins. The first error aborts the operation before it has
//! any effect.

use crate::state::FieldInit;
use reactorm_core::{EntityRef, Filter, Result};

pub trait SessionPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn before_find(&self, _entity_type: &'static str, _filter: &Filter) -> Result<()> {
        Ok(())
    }

    fn before_get_field(
        &self,
        _entity_type: &'static str,
        _entity: EntityRef,
        _field: &'static str,
    ) -> Result<()> {
        Ok(())
    }

    fn before_set_field(
        &self,
        _entity_type: &'static str,
        _entity: EntityRef,
        _field: &'static str,
        _value: &FieldInit,
    ) -> Result<()> {
        Ok(())
    }
}
