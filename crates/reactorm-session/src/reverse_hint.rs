//! Hint reversal: from "what a reactive value reads" to "who must be
//! recalculated when this changes".
//!
//! A reactive hint on `Author.numberOfBooks` reads forward (`books`). Its
//! reversal says: when `Book.author` changes on a book, walk `author` back to
//! reach the `Author` to recalculate. Every relation step of a hint becomes
//! one backward [`PathStep`], resolved through the relation's inverse.

use reactorm_core::{
    ConfigError, EntityMetadata, Error, FieldKind, Hint, HintTree, Metadata, Result,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One backward hop: follow `relation` and keep entities of type `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathStep {
    pub relation: &'static str,
    pub target: &'static str,
    /// Repeat the hop until it reaches nothing new (a recursive relation).
    pub transitive: bool,
}

impl PathStep {
    pub fn new(relation: &'static str, target: &'static str) -> Self {
        Self {
            relation,
            target,
            transitive: false,
        }
    }
}

/// Where a change on `source_type` must be walked to reach an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversedPath {
    pub owner_type: &'static str,
    pub owner_field: &'static str,
    pub source_type: &'static str,
    /// Fields of `source_type` whose change makes the owner stale.
    pub fields: BTreeSet<&'static str>,
    /// Backward hops from the source to the owner; empty on the owner itself.
    pub path: Vec<PathStep>,
}

type Levels = BTreeMap<(&'static str, Vec<PathStep>), BTreeSet<&'static str>>;

fn config(message: String) -> Error {
    Error::Config(ConfigError::new(message))
}

/// Reverse the hint of reactive field `owner_type.owner_field`.
pub fn reverse_hint(
    metadata: &Metadata,
    owner_type: &str,
    owner_field: &str,
    hint: &Hint,
) -> Result<Vec<ReversedPath>> {
    let owner = metadata.entity(owner_type)?;
    let field = owner.field_meta(owner_field)?.name;
    let mut levels = Levels::new();
    descend(metadata, owner, field, hint, &[], false, &mut levels)?;
    Ok(levels
        .into_iter()
        .map(|((source_type, path), fields)| ReversedPath {
            owner_type: owner.name,
            owner_field: field,
            source_type,
            fields,
            path,
        })
        .collect())
}

/// Record the triggers of `hint` read from entities of `meta`, reached from
/// the owner by walking `back` in reverse.
fn descend(
    metadata: &Metadata,
    meta: &EntityMetadata,
    owner_field: &'static str,
    hint: &Hint,
    back: &[PathStep],
    lenient: bool,
    levels: &mut Levels,
) -> Result<()> {
    let key = (meta.name, back.to_vec());
    levels.entry(key.clone()).or_default();

    for (step, nested) in hint.entries() {
        if step.is_read_only() {
            continue;
        }
        let fm = match meta.field_meta(step.name) {
            Ok(fm) => fm,
            Err(_) if lenient => continue,
            Err(_) => {
                return Err(config(format!(
                    "reactive hint of {owner_field} names unknown field {}.{}",
                    meta.name, step.name
                )));
            }
        };
        let nested = nested.filter(|h| !h.entries().is_empty());
        let leaf_only = |what: &str| -> Result<()> {
            if nested.is_some() {
                Err(config(format!(
                    "reactive hint of {owner_field} descends into {what} {}.{}",
                    meta.name, fm.name
                )))
            } else {
                Ok(())
            }
        };
        let need_inverse = |inverse: Option<&'static str>| -> Result<&'static str> {
            inverse.ok_or_else(|| {
                config(format!(
                    "reactive hint of {owner_field} walks {}.{}, which declares no inverse",
                    meta.name, fm.name
                ))
            })
        };
        let hop = |relation: &'static str| -> Vec<PathStep> {
            let mut path = vec![PathStep::new(relation, meta.name)];
            path.extend_from_slice(back);
            path
        };

        add(levels, &key, fm.name);
        match &fm.kind {
            FieldKind::Primitive { .. } => leaf_only("primitive")?,
            FieldKind::ReactiveField { .. } => leaf_only("reactive field")?,
            FieldKind::ReactiveCollection { .. } => leaf_only("reactive collection")?,
            FieldKind::Recursive { relation } => {
                leaf_only("recursive relation")?;
                add(levels, &key, relation);
                // Deeper in the walk, the relation changes on other entities
                // of this type; their changes reach back through the inverse.
                let walked = meta.field_meta(relation)?;
                let (via, changed) = match &walked.kind {
                    FieldKind::ManyToOne { inverse, .. } => (need_inverse(*inverse)?, walked.name),
                    FieldKind::OneToMany { inverse, .. } | FieldKind::OneToOne { inverse, .. } => {
                        (*inverse, *inverse)
                    }
                    _ => continue,
                };
                let mut path = vec![PathStep {
                    relation: via,
                    target: meta.name,
                    transitive: true,
                }];
                path.extend_from_slice(back);
                add(levels, &(meta.name, path), changed);
            }
            FieldKind::ManyToOne { target, inverse, .. }
            | FieldKind::ReactiveReference { target, inverse, .. } => {
                if let Some(nested) = nested {
                    let inverse = need_inverse(*inverse)?;
                    let target = metadata.entity(target)?;
                    descend(metadata, target, owner_field, nested, &hop(inverse), lenient, levels)?;
                }
            }
            FieldKind::Polymorphic { targets, inverse, .. } => {
                if let Some(nested) = nested {
                    let inverse = need_inverse(*inverse)?;
                    for target in targets {
                        let target = metadata.entity(target)?;
                        descend(metadata, target, owner_field, nested, &hop(inverse), true, levels)?;
                    }
                }
            }
            FieldKind::OneToMany { target, inverse } | FieldKind::OneToOne { target, inverse } => {
                let target = metadata.entity(target)?;
                let path = hop(inverse);
                add(levels, &(target.name, path.clone()), inverse);
                if let Some(nested) = nested {
                    descend(metadata, target, owner_field, nested, &path, lenient, levels)?;
                }
            }
            FieldKind::ManyToMany { target, inverse, .. } => {
                let inverse = need_inverse(*inverse)?;
                let target = metadata.entity(target)?;
                let path = hop(inverse);
                add(levels, &(target.name, path.clone()), inverse);
                if let Some(nested) = nested {
                    descend(metadata, target, owner_field, nested, &path, lenient, levels)?;
                }
            }
        }
    }
    Ok(())
}

fn add(levels: &mut Levels, key: &(&'static str, Vec<PathStep>), field: &'static str) {
    levels.entry(key.clone()).or_default().insert(field);
}

/// Every reversed path of every reactive value, indexed by source type, and
/// the merged load tree of every owner type.
#[derive(Debug, Default)]
pub(crate) struct ReactiveGraph {
    by_source: HashMap<&'static str, Vec<ReversedPath>>,
    load_trees: HashMap<&'static str, HintTree>,
}

impl ReactiveGraph {
    pub fn build(metadata: &Metadata) -> Result<Self> {
        let mut graph = Self::default();
        for meta in metadata.entities() {
            for fm in meta.reactive_fields() {
                let Some(hint) = fm.kind.reactive_hint() else {
                    continue;
                };
                for path in reverse_hint(metadata, meta.name, fm.name, hint)? {
                    graph.by_source.entry(path.source_type).or_default().push(path);
                }
                graph
                    .load_trees
                    .entry(meta.name)
                    .or_default()
                    .merge(&hint.to_tree());
            }
        }
        tracing::debug!(
            sources = graph.by_source.len(),
            owners = graph.load_trees.len(),
            "Reactive graph built"
        );
        Ok(graph)
    }

    pub fn paths_from(&self, entity_type: &str) -> &[ReversedPath] {
        self.by_source.get(entity_type).map_or(&[], Vec::as_slice)
    }

    /// What must be loaded to recalculate every reactive value of `owner_type`.
    pub fn load_tree(&self, owner_type: &str) -> Option<&HintTree> {
        self.load_trees.get(owner_type)
    }
}
