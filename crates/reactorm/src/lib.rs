//! reactorm: a reactive unit-of-work persistence core for domain models.
//!
//! The facade re-exports the pieces an application needs:
//!
//! - [`reactorm_core`]: values, ids, metadata, hints, errors and the
//!   [`Driver`] contract
//! - [`reactorm_session`]: the [`Session`], its hooks, plugins and observer
//! - [`reactorm_memory`]: [`MemoryDriver`], a transactional in-memory store
//!
//! # Example
//!
//! ```ignore
//! use reactorm::prelude::*;
//!
//! let metadata = Arc::new(
//!     Metadata::builder()
//!         .entity(EntityMetadata::new("Author", "a").required("firstName"))
//!         .build()?,
//! );
//! let session = Session::new(MemoryDriver::new(), metadata)?;
//! let author = session.create("Author", vec![("firstName", "a1".into())])?;
//! session.commit(&cx).await;
//! ```

pub use asupersync::{Cx, Outcome};

pub use reactorm_core::{
    Column, Compute, Condition, ConfigError, CycleError, Driver, DriverError, DriverErrorKind,
    EntityId, EntityMetadata, EntityReader, EntityRef, Error, FieldKind, FieldMeta,
    FieldValidationError, Filter, FindOptions, Hint, HintTree, IdKind, IdValue, LinkRow,
    LinkTableOp, Metadata, MetadataBuilder, PendingOp, Result, Row, Step, StepMode, TaggedId,
    Timestamps, TypeError, ValidationError, ValidationErrorKind, ValidationRule, Value,
    WriteBatch,
};
pub use reactorm_memory::{DriverStats, MemoryDriver};
pub use reactorm_session::{
    CommitSummary, Criteria, FieldInit, HookEvent, HookScope, LoaderStats, Match, ObjectState,
    PathStep, PendingChange, ReversedPath, Session, SessionConfig, SessionDebugInfo, SessionMode,
    SessionObserver, SessionPlugin, TracingObserver, reverse_hint,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use reactorm::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Criteria, Cx, EntityMetadata, EntityReader, EntityRef, Error, FieldInit, Filter,
        FindOptions, Hint, HookScope, MemoryDriver, Metadata, Outcome, Result, Row, Session,
        SessionConfig, SessionMode, TaggedId, ValidationRule, Value,
    };
    pub use std::sync::Arc;
}
