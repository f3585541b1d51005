//! Error types for reactorm operations.

use crate::id::{EntityId, EntityRef};
use std::fmt;

/// The primary error type for all reactorm operations.
#[derive(Debug)]
pub enum Error {
    /// Errors reported by the store driver
    Driver(DriverError),
    /// Type conversion errors
    Type(TypeError),
    /// Metadata or configuration errors
    Config(ConfigError),
    /// Validation errors collected during commit
    Validation(ValidationError),
    /// A self-referential traversal revisited an entity on its own path
    Cycle(CycleError),
    /// Mutation attempted on a read-only session
    ReadOnly {
        /// The rejected operation
        operation: &'static str,
    },
    /// Mutation attempted while a commit is running, outside its hook scope
    WriteGuard {
        /// The rejected operation
        operation: &'static str,
    },
    /// A hook scope was used after the commit that issued it finished
    StaleHookScope {
        /// The rejected operation
        operation: &'static str,
    },
    /// Synchronous access to a relation that has not been loaded
    NotLoaded {
        /// The entity owning the relation
        entity: EntityId,
        /// The relation name
        relation: &'static str,
    },
    /// Field name absent from the entity metadata
    UnknownField {
        /// The entity type
        entity_type: String,
        /// The requested field
        field: String,
    },
    /// Entity type name or tag absent from the metadata
    UnknownEntityType(String),
    /// Entity handle not issued by this session
    UnknownEntity(EntityRef),
    /// Mutation of an entity that is marked for deletion
    EntityDeleted {
        /// The deleted entity
        entity: EntityId,
        /// The rejected operation
        operation: &'static str,
    },
    /// A commit is already in progress on this session
    CommitInProgress,
    /// A fixed-point stage did not settle
    ReactionLimit {
        /// The commit stage that did not settle
        stage: &'static str,
        /// Iterations performed before giving up
        iterations: usize,
    },
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

/// An error reported by the store driver.
#[derive(Debug)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Reading rows failed
    Query,
    /// The write transaction failed
    Write,
    /// A constraint was violated (duplicate id, missing row)
    Constraint,
    /// Lost or unavailable connection
    Connection,
}

impl DriverError {
    /// Create a driver error without an underlying source.
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub field: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

/// The traversal path of a detected cycle.
///
/// The path starts at the entity the traversal began from and ends with the
/// entity that was revisited, so the last id always appears twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub relation: &'static str,
    pub path: Vec<EntityId>,
}

/// Validation failures, possibly across several entities.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Every failure, in the order they were found
    pub errors: Vec<FieldValidationError>,
}

/// A single validation failure for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The failing entity, when known
    pub entity: Option<EntityId>,
    /// The field name that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Required field or reference is missing
    Required,
    /// String is shorter than minimum length
    MinLength,
    /// String is longer than maximum length
    MaxLength,
    /// Value doesn't match regex pattern
    Pattern,
    /// Custom rule failed
    Custom,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            entity: None,
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a required field error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(field, ValidationErrorKind::Required, "is required");
    }

    /// Add a min length error.
    pub fn add_min_length(&mut self, field: impl Into<String>, min: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MinLength,
            format!("must be at least {min} characters, got {actual}"),
        );
    }

    /// Add a max length error.
    pub fn add_max_length(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MaxLength,
            format!("must be at most {max} characters, got {actual}"),
        );
    }

    /// Add a pattern match error.
    pub fn add_pattern(&mut self, field: impl Into<String>, pattern: &str) {
        self.add(
            field,
            ValidationErrorKind::Pattern,
            format!("must match pattern '{pattern}'"),
        );
    }

    /// Add a custom validation error.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }

    /// Attribute every failure without an entity to `entity`.
    pub fn with_entity(mut self, entity: EntityId) -> Self {
        for err in &mut self.errors {
            err.entity.get_or_insert(entity);
        }
        self
    }

    /// Move all failures of `other` into this container.
    pub fn extend(&mut self, other: ValidationError) {
        self.errors.extend(other.errors);
    }

    /// Failures attributed to `entity`.
    pub fn for_entity(&self, entity: EntityId) -> impl Iterator<Item = &FieldValidationError> {
        self.errors.iter().filter(move |e| e.entity == Some(entity))
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Errors raised synchronously by the session guard rules.
    pub fn is_guard_violation(&self) -> bool {
        matches!(
            self,
            Error::ReadOnly { .. } | Error::WriteGuard { .. } | Error::StaleHookScope { .. }
        )
    }

    pub fn is_not_loaded(&self) -> bool {
        matches!(self, Error::NotLoaded { .. })
    }

    /// The validation failures, if this is a validation error.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Error::Validation(v) => Some(v),
            _ => None,
        }
    }

    /// The cycle path, if this is a cycle error.
    pub fn cycle_path(&self) -> Option<&[EntityId]> {
        match self {
            Error::Cycle(c) => Some(&c.path),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Driver(e) => write!(f, "Driver error: {}", e.message),
            Error::Type(e) => {
                if let Some(field) = &e.field {
                    write!(
                        f,
                        "Type error in field '{}': expected {}, found {}",
                        field, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Cycle(e) => write!(f, "Cycle detected: {}", e),
            Error::ReadOnly { operation } => {
                write!(f, "Cannot {} in a read-only session", operation)
            }
            Error::WriteGuard { operation } => write!(
                f,
                "Cannot {} while a commit is in progress outside its hook scope",
                operation
            ),
            Error::StaleHookScope { operation } => write!(
                f,
                "Cannot {} through a hook scope whose commit has finished",
                operation
            ),
            Error::NotLoaded { entity, relation } => {
                write!(f, "{}.{} is not loaded", entity, relation)
            }
            Error::UnknownField { entity_type, field } => {
                write!(f, "Unknown field '{}' on {}", field, entity_type)
            }
            Error::UnknownEntityType(name) => write!(f, "Unknown entity type '{}'", name),
            Error::UnknownEntity(e) => write!(f, "Unknown {}", e),
            Error::EntityDeleted { entity, operation } => {
                write!(f, "Cannot {} on deleted entity {}", operation, entity)
            }
            Error::CommitInProgress => write!(f, "A commit is already in progress"),
            Error::ReactionLimit { stage, iterations } => write!(
                f,
                "Commit stage '{}' did not settle after {} iterations",
                stage, iterations
            ),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Driver(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(
                f,
                "expected {} for field '{}', found {}",
                self.expected, field, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cycle ", self.relation)?;
        for (i, id) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}", id)?;
        }
        Ok(())
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = |err: &FieldValidationError| match err.entity {
            Some(entity) => format!("{}.{}", entity, err.field),
            None => err.field.clone(),
        };
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", label(err), err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", label(err), err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<CycleError> for Error {
    fn from(err: CycleError) -> Self {
        Error::Cycle(err)
    }
}

/// Result type alias for reactorm operations.
pub type Result<T> = std::result::Result<T, Error>;
