//! Core types and traits for reactorm.
//!
//! This crate provides the vocabulary shared by the session and the store
//! drivers:
//!
//! - `Value`, `TaggedId`, `EntityId` and `EntityRef` for data and identity
//! - `Metadata` describing entity types, relations and reactive fields
//! - `Hint` / `HintTree` for load and dependency hints
//! - `Driver` trait for the store collaborator
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod driver;
pub mod error;
pub mod filter;
pub mod hint;
pub mod id;
pub mod metadata;
pub mod reader;
pub mod row;
pub mod validate;
pub mod value;
pub mod write;

pub use driver::Driver;
pub use error::{
    ConfigError, CycleError, DriverError, DriverErrorKind, Error, FieldValidationError, Result,
    TypeError, ValidationError, ValidationErrorKind,
};
pub use filter::{Condition, Filter, FindOptions};
pub use hint::{Hint, HintTree, Step, StepMode};
pub use id::{EntityId, EntityRef, IdValue, TaggedId};
pub use metadata::{
    EntityMetadata, FieldKind, FieldMeta, IdKind, Metadata, MetadataBuilder, Timestamps,
};
pub use reader::{Compute, EntityReader};
pub use row::{Column, Row};
pub use validate::{RuleCheck, ValidationRule, matches_pattern};
pub use value::Value;
pub use write::{FlushOrderer, LinkRow, LinkTableOp, PendingOp, WriteBatch};
