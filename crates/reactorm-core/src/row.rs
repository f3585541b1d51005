//! Rows exchanged with the store driver.

use crate::id::TaggedId;
use crate::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;

/// A stored column: either a plain value or a foreign key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Column {
    Value(Value),
    Ref(Option<TaggedId>),
}

impl Column {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Column::Value(v) => Some(v),
            Column::Ref(_) => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<Option<TaggedId>> {
        match self {
            Column::Value(_) => None,
            Column::Ref(id) => Some(*id),
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Column::Value(v) => v.is_null(),
            Column::Ref(id) => id.is_none(),
        }
    }
}

/// One stored entity: its id and the columns of its own table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub id: TaggedId,
    columns: BTreeMap<&'static str, Column>,
}

impl Row {
    pub fn new(id: TaggedId) -> Self {
        Self {
            id,
            columns: BTreeMap::new(),
        }
    }

    /// Builder: set a value column.
    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.columns.insert(name, Column::Value(value.into()));
        self
    }

    /// Builder: set a foreign key column.
    pub fn with_ref(mut self, name: &'static str, id: Option<TaggedId>) -> Self {
        self.columns.insert(name, Column::Ref(id));
        self
    }

    pub fn set(&mut self, name: &'static str, column: Column) {
        self.columns.insert(name, column);
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// A value column, `Null` when absent.
    pub fn get(&self, name: &str) -> Value {
        self.columns
            .get(name)
            .and_then(Column::as_value)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// A foreign key column, `None` when absent or null.
    pub fn reference(&self, name: &str) -> Option<TaggedId> {
        self.columns.get(name).and_then(Column::as_ref_id).flatten()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&'static str, &Column)> {
        self.columns.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
