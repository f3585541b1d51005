//! Read access handed to reactive computations and validation rules.

use crate::error::Result;
use crate::id::{EntityId, EntityRef};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Synchronous, read-only view of a session's entities.
///
/// Relation reads fail with [`crate::Error::NotLoaded`] when the relation has
/// not been loaded; reactive computations only see data their hint loaded.
pub trait EntityReader {
    fn entity_type(&self, entity: EntityRef) -> Result<&'static str>;

    fn id(&self, entity: EntityRef) -> Result<EntityId>;

    /// A primitive or reactive field value.
    fn get(&self, entity: EntityRef, field: &str) -> Result<Value>;

    /// A reference (many-to-one, polymorphic, one-to-one or reactive reference).
    fn reference(&self, entity: EntityRef, field: &str) -> Result<Option<EntityRef>>;

    /// A collection (one-to-many, many-to-many or reactive collection).
    /// Entities marked for deletion are never included.
    fn collection(&self, entity: EntityRef, field: &str) -> Result<Vec<EntityRef>>;
}

type ComputeFn<T> = dyn Fn(&dyn EntityReader, EntityRef) -> Result<T> + Send + Sync;

/// A pure function deriving a reactive value from loaded data.
pub struct Compute<T>(Arc<ComputeFn<T>>);

impl<T> Compute<T> {
    pub fn new(f: impl Fn(&dyn EntityReader, EntityRef) -> Result<T> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, reader: &dyn EntityReader, entity: EntityRef) -> Result<T> {
        (self.0)(reader, entity)
    }
}

impl<T> Clone for Compute<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Compute<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Compute(..)")
    }
}
