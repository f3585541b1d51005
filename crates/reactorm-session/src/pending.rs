//! Pending changes: what the next commit would write.
//!
//! Both functions here are pure projections of the entity graph. A new
//! entity deleted before commit is detached and so never shows up; a join row
//! added then removed (or the reverse) cancelled itself when it was recorded.

use crate::graph::{EntityData, EntityGraph, LinkDelta, ObjectState, Slot};
use reactorm_core::{
    Column, EntityId, EntityRef, Error, FlushOrderer, LinkRow, LinkTableOp, Metadata,
    PendingOp, Result, Row, TaggedId, Value, WriteBatch,
};
use serde::Serialize;

/// One change the next commit would write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PendingChange {
    Create(EntityRef),
    /// Changed columns of a persisted entity.
    Update {
        entity: EntityRef,
        fields: Vec<&'static str>,
    },
    Delete(EntityRef),
    M2mAdd {
        join_table: &'static str,
        left: EntityRef,
        right: EntityRef,
    },
    M2mRemove {
        join_table: &'static str,
        left: EntityRef,
        right: EntityRef,
    },
}

impl PendingChange {
    pub fn is_create(&self) -> bool {
        matches!(self, PendingChange::Create(_))
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingChange::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingChange::Delete(_))
    }
}

fn refs(graph: &EntityGraph) -> impl Iterator<Item = (EntityRef, &EntityData)> {
    graph
        .entities
        .iter()
        .enumerate()
        .map(|(i, data)| (EntityRef::new(i as u32), data))
}

/// Join row changes whose sides can still be written.
fn link_changes(graph: &EntityGraph) -> impl Iterator<Item = (&'static str, [(&'static str, EntityRef); 2], LinkDelta)> + '_ {
    graph.links.iter().filter_map(|(key, delta)| {
        let [(_, left), (_, right)] = key.sides;
        let writable = match delta {
            LinkDelta::Added => graph.is_live(left) && graph.is_live(right),
            LinkDelta::Removed => [left, right].iter().all(|e| {
                graph
                    .entity(*e)
                    .is_ok_and(|d| !matches!(d.state, ObjectState::New | ObjectState::Detached))
            }),
        };
        writable.then_some((key.table, key.sides, delta))
    })
}

/// Pending changes in creation order, then join row changes.
pub(crate) fn pending_changes(graph: &EntityGraph) -> Vec<PendingChange> {
    let mut out = Vec::new();
    for (e, data) in refs(graph) {
        match data.state {
            ObjectState::New => out.push(PendingChange::Create(e)),
            ObjectState::Persistent if data.changes.is_dirty() => out.push(PendingChange::Update {
                entity: e,
                fields: data.changes.changed_fields(),
            }),
            ObjectState::Deleted => out.push(PendingChange::Delete(e)),
            ObjectState::Persistent | ObjectState::Detached => {}
        }
    }
    for (join_table, [(_, left), (_, right)], delta) in link_changes(graph) {
        out.push(match delta {
            LinkDelta::Added => PendingChange::M2mAdd {
                join_table,
                left,
                right,
            },
            LinkDelta::Removed => PendingChange::M2mRemove {
                join_table,
                left,
                right,
            },
        });
    }
    out
}

fn persisted_id(data: &EntityData) -> Result<TaggedId> {
    match data.id {
        EntityId::Persisted(id) => Ok(id),
        EntityId::Placeholder(_) => Err(Error::Custom(format!(
            "{} {} has no permanent id",
            data.entity_type, data.id
        ))),
    }
}

fn column(graph: &EntityGraph, slot: &Slot) -> Column {
    match slot {
        Slot::Value(v) => Column::Value(v.clone()),
        Slot::Reference(value) => Column::Ref(graph.ref_id(value)),
        Slot::Unset | Slot::Collection(_) | Slot::Walk => Column::Value(Value::Null),
    }
}

/// The ordered write batch for the current pending changes. Every new
/// entity must already carry its permanent id.
pub(crate) fn build_batch(graph: &EntityGraph, metadata: &Metadata) -> Result<WriteBatch> {
    let mut ops = Vec::new();
    for (_, data) in refs(graph) {
        let meta = metadata.entity(data.entity_type)?;
        match data.state {
            ObjectState::New => {
                let mut row = Row::new(persisted_id(data)?);
                for (fm, slot) in meta.fields().iter().zip(&data.slots) {
                    if fm.kind.is_column() {
                        row.set(fm.name, column(graph, slot));
                    }
                }
                ops.push(PendingOp::Insert {
                    entity_type: meta.name,
                    row,
                });
            }
            ObjectState::Persistent if data.changes.is_dirty() => {
                let mut row = Row::new(persisted_id(data)?);
                for field in data.changes.changed_fields() {
                    let (index, _) = meta.resolve(field)?;
                    row.set(field, column(graph, &data.slots[index]));
                }
                ops.push(PendingOp::Update {
                    entity_type: meta.name,
                    row,
                });
            }
            ObjectState::Deleted => ops.push(PendingOp::Delete {
                entity_type: meta.name,
                id: persisted_id(data)?,
            }),
            ObjectState::Persistent | ObjectState::Detached => {}
        }
    }

    let mut links = Vec::new();
    for (table, [(left_column, left), (right_column, right)], delta) in link_changes(graph) {
        let left_id = persisted_id(graph.entity(left)?)?;
        let right_id = persisted_id(graph.entity(right)?)?;
        let row = LinkRow::new(table, (left_column, left_id), (right_column, right_id));
        links.push(match delta {
            LinkDelta::Added => LinkTableOp::Link(row),
            LinkDelta::Removed => LinkTableOp::Unlink(row),
        });
    }

    let batch = FlushOrderer::from_metadata(metadata).order(ops, links);
    tracing::debug!(
        inserts = batch.inserts.len(),
        updates = batch.updates.len(),
        deletes = batch.deletes.len(),
        links = batch.links.len(),
        unlinks = batch.unlinks.len(),
        "Write batch built"
    );
    Ok(batch)
}
