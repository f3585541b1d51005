//! Transitive walks over self-referencing relations.
//!
//! A recursive field names a reference (`mentor`) or a collection
//! (`mentees`) of the same type and reads as every entity reachable through
//! it, nearest first. Reaching an entity already on the current path is a
//! cycle and fails with the path that closed it.

use crate::graph::EntityGraph;
use reactorm_core::{CycleError, EntityRef, Error, FieldKind, Metadata, Result};
use std::collections::HashSet;

/// Entities reachable from `e` through the relation behind `field`.
pub(crate) fn walk(
    graph: &EntityGraph,
    metadata: &Metadata,
    e: EntityRef,
    field: &str,
) -> Result<Vec<EntityRef>> {
    let (_, meta, fm, _) = graph.slot(metadata, e, field)?;
    let FieldKind::Recursive { relation } = fm.kind else {
        return Err(crate::graph::mismatch("recursive relation", &fm.kind, meta, fm));
    };
    let relation_meta = meta.field_meta(relation)?;
    if relation_meta.kind.is_reference() {
        walk_chain(graph, metadata, e, relation)
    } else {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut path = vec![e];
        walk_tree(graph, metadata, relation, &mut path, &mut seen, &mut out)?;
        Ok(out)
    }
}

fn walk_chain(
    graph: &EntityGraph,
    metadata: &Metadata,
    start: EntityRef,
    relation: &'static str,
) -> Result<Vec<EntityRef>> {
    let mut path = vec![start];
    let mut current = start;
    while let Some(next) = graph.read_reference(metadata, current, relation)? {
        if !graph.is_live(next) {
            break;
        }
        if path.contains(&next) {
            path.push(next);
            return Err(cycle(graph, relation, &path));
        }
        path.push(next);
        current = next;
    }
    path.remove(0);
    Ok(path)
}

fn walk_tree(
    graph: &EntityGraph,
    metadata: &Metadata,
    relation: &'static str,
    path: &mut Vec<EntityRef>,
    seen: &mut HashSet<EntityRef>,
    out: &mut Vec<EntityRef>,
) -> Result<()> {
    let Some(&current) = path.last() else {
        return Ok(());
    };
    for child in graph.read_collection(metadata, current, relation)? {
        if path.contains(&child) {
            path.push(child);
            return Err(cycle(graph, relation, path));
        }
        if !seen.insert(child) {
            continue;
        }
        out.push(child);
        path.push(child);
        walk_tree(graph, metadata, relation, path, seen, out)?;
        path.pop();
    }
    Ok(())
}

fn cycle(graph: &EntityGraph, relation: &'static str, path: &[EntityRef]) -> Error {
    let path = path
        .iter()
        .filter_map(|e| graph.entity(*e).ok().map(|d| d.id))
        .collect();
    Error::Cycle(CycleError { relation, path })
}

/// Walk every recursive field of every live entity, failing on the first
/// cycle. Relations that are not loaded are skipped.
pub(crate) fn check_cycles(graph: &EntityGraph, metadata: &Metadata) -> Result<()> {
    for meta in metadata.entities() {
        let fields: Vec<&'static str> = meta
            .fields()
            .iter()
            .filter(|f| matches!(f.kind, FieldKind::Recursive { .. }))
            .map(|f| f.name)
            .collect();
        if fields.is_empty() {
            continue;
        }
        for e in graph.of_type(meta.name) {
            if !graph.is_live(e) {
                continue;
            }
            for field in &fields {
                match walk(graph, metadata, e, field) {
                    Ok(_) => {}
                    Err(err) if err.is_not_loaded() => {}
                    Err(err) => return Err(err),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_tracker::{ChangeTracker, RefValue};
    use crate::graph::{CollectionSlot, EntityData, ObjectState, Slot};
    use reactorm_core::{EntityId, EntityMetadata, TaggedId};

    fn metadata() -> Metadata {
        Metadata::builder()
            .entity(
                EntityMetadata::new("Author", "a")
                    .many_to_one("mentor", "Author", Some("mentees"))
                    .one_to_many("mentees", "Author", "mentor")
                    .recursive("mentorsRecursive", "mentor")
                    .recursive("menteesRecursive", "mentees"),
            )
            .build()
            .unwrap()
    }

    fn author(graph: &mut EntityGraph, md: &Metadata, id: i64) -> EntityRef {
        let meta = md.entity("Author").unwrap();
        graph.push(EntityData {
            entity_type: "Author",
            id: EntityId::Persisted(TaggedId::int("a", id)),
            state: ObjectState::Persistent,
            slots: meta.fields().iter().map(|f| Slot::for_new(&f.kind)).collect(),
            changes: ChangeTracker::default(),
        })
    }

    fn set_mentor(graph: &mut EntityGraph, md: &Metadata, e: EntityRef, mentor: EntityRef) {
        let meta = md.entity("Author").unwrap();
        let (m, _) = meta.resolve("mentor").unwrap();
        let (c, _) = meta.resolve("mentees").unwrap();
        graph.entities[e.index()].slots[m] = Slot::Reference(RefValue::Entity(mentor));
        if let Slot::Collection(items) = &mut graph.entities[mentor.index()].slots[c] {
            items.items.push(e);
        } else {
            graph.entities[mentor.index()].slots[c] = Slot::Collection(CollectionSlot::loaded(vec![e]));
        }
    }

    #[test]
    fn test_mentor_chain() {
        let md = metadata();
        let mut graph = EntityGraph::default();
        let a1 = author(&mut graph, &md, 1);
        let a2 = author(&mut graph, &md, 2);
        let a3 = author(&mut graph, &md, 3);
        set_mentor(&mut graph, &md, a3, a2);
        set_mentor(&mut graph, &md, a2, a1);
        assert_eq!(walk(&graph, &md, a3, "mentorsRecursive").unwrap(), vec![a2, a1]);
        assert_eq!(walk(&graph, &md, a1, "menteesRecursive").unwrap(), vec![a2, a3]);
        check_cycles(&graph, &md).unwrap();
    }

    #[test]
    fn test_cycle_reports_path() {
        let md = metadata();
        let mut graph = EntityGraph::default();
        let a1 = author(&mut graph, &md, 1);
        let a2 = author(&mut graph, &md, 2);
        let a3 = author(&mut graph, &md, 3);
        set_mentor(&mut graph, &md, a3, a2);
        set_mentor(&mut graph, &md, a2, a1);
        set_mentor(&mut graph, &md, a1, a3);

        let err = walk(&graph, &md, a3, "mentorsRecursive").unwrap_err();
        let path: Vec<String> = err.cycle_path().unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(path, ["a:3", "a:2", "a:1", "a:3"]);
        assert!(matches!(check_cycles(&graph, &md), Err(Error::Cycle(_))));
    }

    #[test]
    fn test_unloaded_relation_is_skipped_by_check() {
        let md = metadata();
        let mut graph = EntityGraph::default();
        let a1 = author(&mut graph, &md, 1);
        let (c, _) = md.entity("Author").unwrap().resolve("mentees").unwrap();
        graph.entities[a1.index()].slots[c] = Slot::Collection(CollectionSlot::default());
        assert!(walk(&graph, &md, a1, "menteesRecursive").unwrap_err().is_not_loaded());
        check_cycles(&graph, &md).unwrap();
    }
}
