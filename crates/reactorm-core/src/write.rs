//! Write batches handed to the store driver.
//!
//! Operations are ordered for foreign key safety:
//! - INSERT parent-first
//! - UPDATE after all inserts
//! - link rows after inserts, unlinks before deletes
//! - DELETE child-first

use crate::id::TaggedId;
use crate::metadata::Metadata;
use crate::row::{Column, Row};
use serde::Serialize;
use std::collections::HashMap;

/// A pending row operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        entity_type: &'static str,
        row: Row,
    },
    /// Update changed columns of an existing row.
    Update {
        entity_type: &'static str,
        row: Row,
    },
    /// Delete an existing row.
    Delete {
        entity_type: &'static str,
        id: TaggedId,
    },
}

impl PendingOp {
    pub fn entity_type(&self) -> &'static str {
        match self {
            PendingOp::Insert { entity_type, .. }
            | PendingOp::Update { entity_type, .. }
            | PendingOp::Delete { entity_type, .. } => entity_type,
        }
    }

    pub fn id(&self) -> TaggedId {
        match self {
            PendingOp::Insert { row, .. } | PendingOp::Update { row, .. } => row.id,
            PendingOp::Delete { id, .. } => *id,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }
}

/// A pending join table operation (for many-to-many relationships).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LinkTableOp {
    /// Insert a join row.
    Link(LinkRow),
    /// Delete a join row.
    Unlink(LinkRow),
}

/// One join table row, in canonical column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkRow {
    pub table: &'static str,
    pub columns: [(&'static str, TaggedId); 2],
}

impl LinkRow {
    /// Build a join row; columns are sorted by name so both sides of a
    /// many-to-many produce the same row.
    pub fn new(
        table: &'static str,
        left: (&'static str, TaggedId),
        right: (&'static str, TaggedId),
    ) -> Self {
        let columns = if left.0 <= right.0 {
            [left, right]
        } else {
            [right, left]
        };
        Self { table, columns }
    }

    /// The id stored in `column`.
    pub fn get(&self, column: &str) -> Option<TaggedId> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, id)| *id)
    }
}

impl LinkTableOp {
    pub fn row(&self) -> &LinkRow {
        match self {
            LinkTableOp::Link(row) | LinkTableOp::Unlink(row) => row,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self, LinkTableOp::Link(_))
    }
}

/// Orders row operations by foreign key dependencies between entity types.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Entity type -> entity types it references.
    dependencies: HashMap<&'static str, Vec<&'static str>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every entity type's reference columns.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mut orderer = Self::new();
        for meta in metadata.entities() {
            let deps = meta
                .fields()
                .iter()
                .filter(|f| f.kind.is_reference())
                .flat_map(|f| f.kind.targets())
                .filter(|t| *t != meta.name)
                .collect();
            orderer.register(meta.name, deps);
        }
        orderer
    }

    pub fn register(&mut self, entity_type: &'static str, depends_on: Vec<&'static str>) {
        self.dependencies.insert(entity_type, depends_on);
    }

    /// Depth of an entity type in the dependency graph (parents are shallower).
    fn depth(&self, entity_type: &str) -> usize {
        let mut seen = Vec::new();
        self.depth_inner(entity_type, &mut seen)
    }

    fn depth_inner(&self, entity_type: &str, seen: &mut Vec<String>) -> usize {
        if seen.iter().any(|s| s == entity_type) {
            return 0;
        }
        seen.push(entity_type.to_string());
        let depth = self
            .dependencies
            .get(entity_type)
            .map_or(0, |deps| {
                deps.iter()
                    .map(|d| 1 + self.depth_inner(d, seen))
                    .max()
                    .unwrap_or(0)
            });
        seen.pop();
        depth
    }

    /// Order operations into a write batch.
    pub fn order(&self, ops: Vec<PendingOp>, links: Vec<LinkTableOp>) -> WriteBatch {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                PendingOp::Insert { .. } => batch.inserts.push(op),
                PendingOp::Update { .. } => batch.updates.push(op),
                PendingOp::Delete { .. } => batch.deletes.push(op),
            }
        }
        for link in links {
            match link {
                LinkTableOp::Link(_) => batch.links.push(link),
                LinkTableOp::Unlink(_) => batch.unlinks.push(link),
            }
        }
        // Stable sorts keep creation order within a type.
        batch
            .inserts
            .sort_by_key(|op| self.depth(op.entity_type()));
        batch
            .deletes
            .sort_by_key(|op| std::cmp::Reverse(self.depth(op.entity_type())));
        batch
    }
}

/// A settled set of operations, executed by the driver in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteBatch {
    /// Insert operations (ordered parent-first).
    pub inserts: Vec<PendingOp>,
    /// Update operations.
    pub updates: Vec<PendingOp>,
    /// Join rows to insert.
    pub links: Vec<LinkTableOp>,
    /// Join rows to delete.
    pub unlinks: Vec<LinkTableOp>,
    /// Delete operations (ordered child-first).
    pub deletes: Vec<PendingOp>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.inserts.len()
            + self.updates.len()
            + self.links.len()
            + self.unlinks.len()
            + self.deletes.len()
    }

    /// Row operations in execution order.
    pub fn row_ops(&self) -> impl Iterator<Item = &PendingOp> {
        self.inserts.iter().chain(&self.updates)
    }

    /// Reference columns of inserted rows, for drivers that check foreign keys.
    pub fn inserted_refs(&self) -> impl Iterator<Item = (TaggedId, &'static str, TaggedId)> + '_ {
        self.inserts.iter().flat_map(|op| match op {
            PendingOp::Insert { row, .. } => row
                .columns()
                .filter_map(|(name, col)| match col {
                    Column::Ref(Some(target)) => Some((row.id, name, *target)),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(entity_type: &'static str, tag: &'static str, id: i64) -> PendingOp {
        PendingOp::Insert {
            entity_type,
            row: Row::new(TaggedId::int(tag, id)),
        }
    }

    fn delete(entity_type: &'static str, tag: &'static str, id: i64) -> PendingOp {
        PendingOp::Delete {
            entity_type,
            id: TaggedId::int(tag, id),
        }
    }

    fn orderer() -> FlushOrderer {
        let mut orderer = FlushOrderer::new();
        orderer.register("Author", vec![]);
        orderer.register("Book", vec!["Author"]);
        orderer.register("BookReview", vec!["Book"]);
        orderer
    }

    #[test]
    fn test_inserts_parent_first() {
        let batch = orderer().order(
            vec![
                insert("BookReview", "br", 1),
                insert("Book", "b", 1),
                insert("Author", "a", 1),
            ],
            vec![],
        );
        let order: Vec<_> = batch.inserts.iter().map(PendingOp::entity_type).collect();
        assert_eq!(order, vec!["Author", "Book", "BookReview"]);
    }

    #[test]
    fn test_deletes_child_first() {
        let batch = orderer().order(
            vec![
                delete("Author", "a", 1),
                delete("BookReview", "br", 1),
                delete("Book", "b", 1),
            ],
            vec![],
        );
        let order: Vec<_> = batch.deletes.iter().map(PendingOp::entity_type).collect();
        assert_eq!(order, vec!["BookReview", "Book", "Author"]);
    }

    #[test]
    fn test_self_reference_does_not_loop() {
        let mut orderer = FlushOrderer::new();
        orderer.register("A", vec!["B"]);
        orderer.register("B", vec!["A"]);
        let batch = orderer.order(vec![insert("A", "a", 1), insert("B", "b", 1)], vec![]);
        assert_eq!(batch.inserts.len(), 2);
    }

    #[test]
    fn test_link_row_is_canonical() {
        let a = LinkRow::new(
            "authors_to_tags",
            ("author_id", TaggedId::int("a", 1)),
            ("tag_id", TaggedId::int("t", 2)),
        );
        let b = LinkRow::new(
            "authors_to_tags",
            ("tag_id", TaggedId::int("t", 2)),
            ("author_id", TaggedId::int("a", 1)),
        );
        assert_eq!(a, b);
        assert_eq!(a.get("tag_id"), Some(TaggedId::int("t", 2)));
    }

    #[test]
    fn test_batch_counts() {
        let link = LinkTableOp::Link(LinkRow::new(
            "authors_to_tags",
            ("author_id", TaggedId::int("a", 1)),
            ("tag_id", TaggedId::int("t", 2)),
        ));
        let batch = orderer().order(vec![insert("Author", "a", 1)], vec![link]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.links.len(), 1);
        assert!(!batch.is_empty());
    }
}
