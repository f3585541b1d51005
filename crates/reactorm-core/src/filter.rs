//! Equality filters passed to the store driver.

use crate::id::TaggedId;
use crate::row::{Column, Row};
use crate::value::Value;

/// A single filter condition on one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Column equals the given value or reference.
    Eq { field: &'static str, expected: Column },
    /// Column equals any of the given values or references.
    In {
        field: &'static str,
        expected: Vec<Column>,
    },
}

impl Condition {
    pub fn field(&self) -> &'static str {
        match self {
            Condition::Eq { field, .. } | Condition::In { field, .. } => field,
        }
    }

    /// Evaluate against a stored row.
    pub fn matches(&self, row: &Row) -> bool {
        let null = Column::Value(Value::Null);
        let actual = row.column(self.field()).unwrap_or(&null);
        match self {
            Condition::Eq { expected, .. } => column_eq(actual, expected),
            Condition::In { expected, .. } => expected.iter().any(|e| column_eq(actual, e)),
        }
    }
}

fn column_eq(actual: &Column, expected: &Column) -> bool {
    match (actual, expected) {
        (Column::Value(a), Column::Value(b)) => a.same_as(b),
        (Column::Ref(a), Column::Ref(b)) => a == b,
        (a, b) => a.is_null() && b.is_null(),
    }
}

/// A conjunction of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            field,
            expected: Column::Value(value.into()),
        });
        self
    }

    pub fn eq_ref(mut self, field: &'static str, id: Option<TaggedId>) -> Self {
        self.conditions.push(Condition::Eq {
            field,
            expected: Column::Ref(id),
        });
        self
    }

    pub fn in_refs(mut self, field: &'static str, ids: impl IntoIterator<Item = TaggedId>) -> Self {
        self.conditions.push(Condition::In {
            field,
            expected: ids.into_iter().map(|id| Column::Ref(Some(id))).collect(),
        });
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

/// Options for driver `find` calls.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Include rows whose soft-delete marker is set.
    pub include_soft_deleted: bool,
    /// Return at most this many rows.
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `include_soft_deleted` option (builder pattern).
    #[must_use]
    pub fn include_soft_deleted(mut self, value: bool) -> Self {
        self.include_soft_deleted = value;
        self
    }

    /// Set the `limit` option (builder pattern).
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
