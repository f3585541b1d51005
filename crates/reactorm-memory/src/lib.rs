//! Transactional in-memory store for reactorm.
//!
//! `MemoryDriver` implements [`Driver`] over plain maps. Each write batch is
//! applied to a copy of the store and swapped in only when every operation
//! succeeded, so a failed batch leaves nothing behind. Counters record every
//! call, which tests use to check batching.

use asupersync::{Cx, Outcome};
use reactorm_core::{
    Driver, DriverError, DriverErrorKind, EntityMetadata, Error, Filter, FindOptions, IdKind,
    IdValue, LinkRow, LinkTableOp, PendingOp, Row, TaggedId, WriteBatch,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Calls received by a [`MemoryDriver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub finds: usize,
    pub loads: usize,
    pub link_finds: usize,
    pub assigns: usize,
    pub writes: usize,
}

impl DriverStats {
    /// Every read call.
    pub fn reads(&self) -> usize {
        self.finds + self.loads + self.link_finds
    }
}

#[derive(Debug, Clone, Default)]
struct Store {
    /// Rows by entity tag, then id.
    tables: BTreeMap<&'static str, BTreeMap<TaggedId, Row>>,
    links: BTreeSet<LinkRow>,
    /// Last integer id handed out per tag.
    sequences: HashMap<&'static str, i64>,
}

impl Store {
    fn bump_sequence(&mut self, id: TaggedId) {
        if let IdValue::Int(n) = id.value() {
            let last = self.sequences.entry(id.tag()).or_insert(0);
            *last = (*last).max(n);
        }
    }

    fn apply(&mut self, op: &PendingOp) -> Result<(), DriverError> {
        match op {
            PendingOp::Insert { entity_type, row } => {
                let table = self.tables.entry(row.id.tag()).or_default();
                if table.contains_key(&row.id) {
                    return Err(DriverError::new(
                        DriverErrorKind::Constraint,
                        format!("duplicate {entity_type} row {}", row.id),
                    ));
                }
                table.insert(row.id, row.clone());
                self.bump_sequence(row.id);
            }
            PendingOp::Update { entity_type, row } => {
                let Some(stored) = self.tables.get_mut(row.id.tag()).and_then(|t| t.get_mut(&row.id))
                else {
                    return Err(DriverError::new(
                        DriverErrorKind::Constraint,
                        format!("no {entity_type} row {} to update", row.id),
                    ));
                };
                for (name, column) in row.columns() {
                    stored.set(name, column.clone());
                }
            }
            PendingOp::Delete { entity_type, id } => {
                let removed = self.tables.get_mut(id.tag()).and_then(|t| t.remove(id));
                if removed.is_none() {
                    return Err(DriverError::new(
                        DriverErrorKind::Constraint,
                        format!("no {entity_type} row {id} to delete"),
                    ));
                }
                // Join rows go with the rows they point at.
                self.links.retain(|link| link.columns.iter().all(|(_, other)| other != id));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    store: Store,
    stats: DriverStats,
    fail_next_write: Option<String>,
}

/// An in-memory store.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    inner: Mutex<Inner>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a stored row.
    pub fn insert_row(&self, row: Row) {
        let mut inner = self.lock();
        inner.store.bump_sequence(row.id);
        inner.store.tables.entry(row.id.tag()).or_default().insert(row.id, row);
    }

    /// Seed a join row.
    pub fn link(
        &self,
        table: &'static str,
        left: (&'static str, TaggedId),
        right: (&'static str, TaggedId),
    ) {
        self.lock().store.links.insert(LinkRow::new(table, left, right));
    }

    pub fn row(&self, id: TaggedId) -> Option<Row> {
        self.lock()
            .store
            .tables
            .get(id.tag())
            .and_then(|t| t.get(&id))
            .cloned()
    }

    /// Stored rows of one entity tag, by id.
    pub fn rows(&self, tag: &str) -> Vec<Row> {
        self.lock()
            .store
            .tables
            .get(tag)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn links(&self, table: &str) -> Vec<LinkRow> {
        self.lock()
            .store
            .links
            .iter()
            .filter(|l| l.table == table)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> DriverStats {
        self.lock().stats
    }

    pub fn reset_stats(&self) {
        self.lock().stats = DriverStats::default();
    }

    /// Make the next `execute_write` fail without applying anything.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.lock().fail_next_write = Some(message.into());
    }
}

fn is_soft_deleted(meta: &EntityMetadata, row: &Row) -> bool {
    meta.soft_delete.is_some_and(|column| !row.get(column).is_null())
}

fn uuid_from(n: i64) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[8..].copy_from_slice(&n.to_be_bytes());
    bytes
}

impl Driver for MemoryDriver {
    fn find(
        &self,
        _cx: &Cx,
        meta: &EntityMetadata,
        filter: &Filter,
        options: &FindOptions,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let mut inner = self.lock();
        inner.stats.finds += 1;
        let limit = options.limit.unwrap_or(usize::MAX);
        let rows: Vec<Row> = inner
            .store
            .tables
            .get(meta.tag)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|row| filter.matches(row))
            .filter(|row| options.include_soft_deleted || !is_soft_deleted(meta, row))
            .take(limit)
            .cloned()
            .collect();
        tracing::trace!(entity_type = meta.name, rows = rows.len(), "find");
        async move { Outcome::Ok(rows) }
    }

    fn load_by_ids(
        &self,
        _cx: &Cx,
        meta: &EntityMetadata,
        ids: &[TaggedId],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let mut inner = self.lock();
        inner.stats.loads += 1;
        let rows: Vec<Row> = match inner.store.tables.get(meta.tag) {
            Some(table) => ids.iter().filter_map(|id| table.get(id)).cloned().collect(),
            None => Vec::new(),
        };
        tracing::trace!(entity_type = meta.name, ids = ids.len(), rows = rows.len(), "load_by_ids");
        async move { Outcome::Ok(rows) }
    }

    fn find_links(
        &self,
        _cx: &Cx,
        table: &'static str,
        column: &'static str,
        ids: &[TaggedId],
    ) -> impl Future<Output = Outcome<Vec<LinkRow>, Error>> + Send {
        let mut inner = self.lock();
        inner.stats.link_finds += 1;
        let links: Vec<LinkRow> = inner
            .store
            .links
            .iter()
            .filter(|l| l.table == table && l.get(column).is_some_and(|id| ids.contains(&id)))
            .cloned()
            .collect();
        async move { Outcome::Ok(links) }
    }

    fn assign_ids(
        &self,
        _cx: &Cx,
        meta: &EntityMetadata,
        count: usize,
    ) -> impl Future<Output = Outcome<Vec<TaggedId>, Error>> + Send {
        let mut inner = self.lock();
        inner.stats.assigns += 1;
        let last = inner.store.sequences.entry(meta.tag).or_insert(0);
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            *last += 1;
            ids.push(match meta.id_kind {
                IdKind::Int => meta.id(IdValue::Int(*last)),
                IdKind::Uuid => meta.id(IdValue::Uuid(uuid_from(*last))),
            });
        }
        async move { Outcome::Ok(ids) }
    }

    fn execute_write(
        &self,
        _cx: &Cx,
        batch: &WriteBatch,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = {
            let mut inner = self.lock();
            inner.stats.writes += 1;
            match inner.fail_next_write.take() {
                Some(message) => Outcome::Err(Error::Driver(DriverError::new(
                    DriverErrorKind::Write,
                    message,
                ))),
                None => match apply_batch(&inner.store, batch) {
                    Ok(store) => {
                        inner.store = store;
                        tracing::debug!(operations = batch.len(), "Batch applied");
                        Outcome::Ok(())
                    }
                    Err(err) => {
                        tracing::debug!(error = %err.message, "Batch rolled back");
                        Outcome::Err(Error::Driver(err))
                    }
                },
            }
        };
        async move { outcome }
    }
}

/// Apply `batch` to a copy of `store`.
fn apply_batch(store: &Store, batch: &WriteBatch) -> Result<Store, DriverError> {
    let mut next = store.clone();
    for op in &batch.inserts {
        next.apply(op)?;
    }
    for op in &batch.updates {
        next.apply(op)?;
    }
    for op in batch.links.iter().chain(&batch.unlinks) {
        match op {
            LinkTableOp::Link(row) => {
                next.links.insert(row.clone());
            }
            LinkTableOp::Unlink(row) => {
                next.links.remove(row);
            }
        }
    }
    for op in &batch.deletes {
        next.apply(op)?;
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use reactorm_core::Value;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn book_meta() -> EntityMetadata {
        EntityMetadata::new("Book", "b")
            .required("title")
            .primitive("deletedAt")
            .soft_delete("deletedAt")
    }

    fn seeded() -> MemoryDriver {
        let driver = MemoryDriver::new();
        driver.insert_row(Row::new(TaggedId::int("b", 1)).with("title", "b1"));
        driver.insert_row(
            Row::new(TaggedId::int("b", 2))
                .with("title", "b2")
                .with("deletedAt", Value::Timestamp(1)),
        );
        driver
    }

    #[test]
    fn test_find_skips_soft_deleted_unless_asked() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = seeded();
        let meta = book_meta();

        rt.block_on(async {
            let rows = unwrap_outcome(driver.find(&cx, &meta, &Filter::new(), &FindOptions::new()).await);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].id, TaggedId::int("b", 1));

            let all = FindOptions::new().include_soft_deleted(true);
            let rows = unwrap_outcome(driver.find(&cx, &meta, &Filter::new(), &all).await);
            assert_eq!(rows.len(), 2);

            let filter = Filter::new().eq("title", "b2");
            let rows = unwrap_outcome(driver.find(&cx, &meta, &filter, &all.limit(1)).await);
            assert_eq!(rows.len(), 1);
        });
        assert_eq!(driver.stats().finds, 3);
    }

    #[test]
    fn test_assign_ids_continue_after_seeded_rows() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = seeded();
        let meta = book_meta();

        rt.block_on(async {
            let ids = unwrap_outcome(driver.assign_ids(&cx, &meta, 2).await);
            assert_eq!(ids, vec![TaggedId::int("b", 3), TaggedId::int("b", 4)]);
        });
    }

    #[test]
    fn test_failed_batch_changes_nothing() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = seeded();

        let batch = WriteBatch {
            inserts: vec![PendingOp::Insert {
                entity_type: "Book",
                row: Row::new(TaggedId::int("b", 3)).with("title", "b3"),
            }],
            updates: vec![PendingOp::Update {
                entity_type: "Book",
                row: Row::new(TaggedId::int("b", 9)).with("title", "missing"),
            }],
            ..WriteBatch::default()
        };

        rt.block_on(async {
            let outcome = driver.execute_write(&cx, &batch).await;
            assert!(matches!(outcome, Outcome::Err(Error::Driver(_))));
        });
        assert!(driver.row(TaggedId::int("b", 3)).is_none());

        driver.fail_next_write("connection reset");
        let ok = WriteBatch {
            inserts: batch.inserts.clone(),
            ..WriteBatch::default()
        };
        rt.block_on(async {
            assert!(matches!(driver.execute_write(&cx, &ok).await, Outcome::Err(_)));
            unwrap_outcome(driver.execute_write(&cx, &ok).await);
        });
        assert!(driver.row(TaggedId::int("b", 3)).is_some());
        assert_eq!(driver.stats().writes, 3);
    }

    #[test]
    fn test_delete_removes_join_rows() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = seeded();
        driver.insert_row(Row::new(TaggedId::int("t", 1)).with("name", "t1"));
        driver.link("books_to_tags", ("book_id", TaggedId::int("b", 1)), ("tag_id", TaggedId::int("t", 1)));

        rt.block_on(async {
            let links = unwrap_outcome(
                driver
                    .find_links(&cx, "books_to_tags", "tag_id", &[TaggedId::int("t", 1)])
                    .await,
            );
            assert_eq!(links.len(), 1);

            let batch = WriteBatch {
                deletes: vec![PendingOp::Delete {
                    entity_type: "Book",
                    id: TaggedId::int("b", 1),
                }],
                ..WriteBatch::default()
            };
            unwrap_outcome(driver.execute_write(&cx, &batch).await);
        });
        assert!(driver.links("books_to_tags").is_empty());
    }
}
