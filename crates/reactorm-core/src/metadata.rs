//! Entity metadata: fields, relations, reactive declarations and rules.
//!
//! Metadata is declared once, checked by [`MetadataBuilder::build`] and then
//! shared read-only by every session. Relation kinds form a closed enum
//! ([`FieldKind`]) matched exhaustively wherever behavior differs per kind.

use crate::error::{ConfigError, Error, Result, TypeError};
use crate::hint::Hint;
use crate::id::{EntityRef, IdValue, TaggedId};
use crate::reader::Compute;
use crate::validate::ValidationRule;
use crate::value::Value;
use std::collections::HashMap;

/// The surrogate key type of an entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdKind {
    #[default]
    Int,
    Uuid,
}

/// Audit timestamp columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub created_at: &'static str,
    pub updated_at: &'static str,
}

/// What a field is and how it relates to other entity types.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// A plain column.
    Primitive { required: bool },
    /// A foreign key to one entity of `target`.
    ManyToOne {
        target: &'static str,
        /// The one-to-many (or one-to-one) on `target` listing entities of this type.
        inverse: Option<&'static str>,
        required: bool,
    },
    /// A foreign key whose target may be any of several entity types.
    Polymorphic {
        targets: Vec<&'static str>,
        /// Name of the one-to-many declared on every component type.
        inverse: Option<&'static str>,
        required: bool,
    },
    /// Entities of `target` whose reference `inverse` points here.
    OneToMany {
        target: &'static str,
        inverse: &'static str,
    },
    /// The single entity of `target` whose reference `inverse` points here.
    OneToOne {
        target: &'static str,
        inverse: &'static str,
    },
    /// Entities linked through a join table.
    ManyToMany {
        target: &'static str,
        inverse: Option<&'static str>,
        join_table: &'static str,
        /// Join table column holding this entity's id.
        column: &'static str,
        /// Join table column holding the target's id.
        other_column: &'static str,
    },
    /// A value derived from the entities its hint reaches.
    ReactiveField {
        hint: Hint,
        compute: Compute<Value>,
        /// Whether the derived value is written as a column.
        persisted: bool,
    },
    /// A derived foreign key, always persisted.
    ReactiveReference {
        target: &'static str,
        hint: Hint,
        compute: Compute<Option<EntityRef>>,
        inverse: Option<&'static str>,
    },
    /// A derived list of entities, never persisted.
    ReactiveCollection {
        target: &'static str,
        hint: Hint,
        compute: Compute<Vec<EntityRef>>,
    },
    /// Transitive walk over a self-referencing relation of the same type.
    Recursive { relation: &'static str },
}

impl FieldKind {
    /// Whether the field is stored in the entity's own row.
    pub fn is_column(&self) -> bool {
        match self {
            FieldKind::Primitive { .. }
            | FieldKind::ManyToOne { .. }
            | FieldKind::Polymorphic { .. }
            | FieldKind::ReactiveReference { .. } => true,
            FieldKind::ReactiveField { persisted, .. } => *persisted,
            FieldKind::OneToMany { .. }
            | FieldKind::OneToOne { .. }
            | FieldKind::ManyToMany { .. }
            | FieldKind::ReactiveCollection { .. }
            | FieldKind::Recursive { .. } => false,
        }
    }

    /// Whether the field holds a single entity reference in its own row.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            FieldKind::ManyToOne { .. }
                | FieldKind::Polymorphic { .. }
                | FieldKind::ReactiveReference { .. }
        )
    }

    /// Whether the field holds a list of entities.
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            FieldKind::OneToMany { .. }
                | FieldKind::OneToOne { .. }
                | FieldKind::ManyToMany { .. }
                | FieldKind::ReactiveCollection { .. }
        )
    }

    pub fn is_reactive(&self) -> bool {
        self.reactive_hint().is_some()
    }

    /// The dependency hint of a reactive field.
    pub fn reactive_hint(&self) -> Option<&Hint> {
        match self {
            FieldKind::ReactiveField { hint, .. }
            | FieldKind::ReactiveReference { hint, .. }
            | FieldKind::ReactiveCollection { hint, .. } => Some(hint),
            _ => None,
        }
    }

    /// Entity types the field can point at.
    pub fn targets(&self) -> Vec<&'static str> {
        match self {
            FieldKind::ManyToOne { target, .. }
            | FieldKind::OneToMany { target, .. }
            | FieldKind::OneToOne { target, .. }
            | FieldKind::ManyToMany { target, .. }
            | FieldKind::ReactiveReference { target, .. }
            | FieldKind::ReactiveCollection { target, .. } => vec![*target],
            FieldKind::Polymorphic { targets, .. } => targets.clone(),
            FieldKind::Primitive { .. }
            | FieldKind::ReactiveField { .. }
            | FieldKind::Recursive { .. } => Vec::new(),
        }
    }

    pub fn is_required(&self) -> bool {
        match self {
            FieldKind::Primitive { required }
            | FieldKind::ManyToOne { required, .. }
            | FieldKind::Polymorphic { required, .. } => *required,
            _ => false,
        }
    }

    /// Short name used in messages.
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Primitive { .. } => "primitive",
            FieldKind::ManyToOne { .. } => "many-to-one",
            FieldKind::Polymorphic { .. } => "polymorphic reference",
            FieldKind::OneToMany { .. } => "one-to-many",
            FieldKind::OneToOne { .. } => "one-to-one",
            FieldKind::ManyToMany { .. } => "many-to-many",
            FieldKind::ReactiveField { .. } => "reactive field",
            FieldKind::ReactiveReference { .. } => "reactive reference",
            FieldKind::ReactiveCollection { .. } => "reactive collection",
            FieldKind::Recursive { .. } => "recursive relation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Static description of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub name: &'static str,
    pub tag: &'static str,
    pub id_kind: IdKind,
    pub timestamps: Option<Timestamps>,
    pub soft_delete: Option<&'static str>,
    pub rules: Vec<ValidationRule>,
    fields: Vec<FieldMeta>,
    field_index: HashMap<&'static str, usize>,
}

impl EntityMetadata {
    pub fn new(name: &'static str, tag: &'static str) -> Self {
        Self {
            name,
            tag,
            id_kind: IdKind::Int,
            timestamps: None,
            soft_delete: None,
            rules: Vec::new(),
            fields: Vec::new(),
            field_index: HashMap::new(),
        }
    }

    /// Use UUID surrogate keys.
    pub fn uuid_ids(mut self) -> Self {
        self.id_kind = IdKind::Uuid;
        self
    }

    /// Add a field. A later declaration with the same name is reported by
    /// [`MetadataBuilder::build`].
    pub fn field(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.field_index.entry(name).or_insert(self.fields.len());
        self.fields.push(FieldMeta { name, kind });
        self
    }

    pub fn primitive(self, name: &'static str) -> Self {
        self.field(name, FieldKind::Primitive { required: false })
    }

    pub fn required(self, name: &'static str) -> Self {
        self.field(name, FieldKind::Primitive { required: true })
    }

    pub fn many_to_one(
        self,
        name: &'static str,
        target: &'static str,
        inverse: Option<&'static str>,
    ) -> Self {
        self.field(
            name,
            FieldKind::ManyToOne {
                target,
                inverse,
                required: false,
            },
        )
    }

    pub fn required_many_to_one(
        self,
        name: &'static str,
        target: &'static str,
        inverse: Option<&'static str>,
    ) -> Self {
        self.field(
            name,
            FieldKind::ManyToOne {
                target,
                inverse,
                required: true,
            },
        )
    }

    pub fn polymorphic(
        self,
        name: &'static str,
        targets: &[&'static str],
        inverse: Option<&'static str>,
    ) -> Self {
        self.field(
            name,
            FieldKind::Polymorphic {
                targets: targets.to_vec(),
                inverse,
                required: false,
            },
        )
    }

    pub fn one_to_many(self, name: &'static str, target: &'static str, inverse: &'static str) -> Self {
        self.field(name, FieldKind::OneToMany { target, inverse })
    }

    pub fn one_to_one(self, name: &'static str, target: &'static str, inverse: &'static str) -> Self {
        self.field(name, FieldKind::OneToOne { target, inverse })
    }

    pub fn many_to_many(
        self,
        name: &'static str,
        target: &'static str,
        join_table: &'static str,
        (column, other_column): (&'static str, &'static str),
        inverse: Option<&'static str>,
    ) -> Self {
        self.field(
            name,
            FieldKind::ManyToMany {
                target,
                inverse,
                join_table,
                column,
                other_column,
            },
        )
    }

    pub fn reactive_field(
        self,
        name: &'static str,
        hint: Hint,
        persisted: bool,
        compute: Compute<Value>,
    ) -> Self {
        self.field(
            name,
            FieldKind::ReactiveField {
                hint,
                compute,
                persisted,
            },
        )
    }

    pub fn reactive_reference(
        self,
        name: &'static str,
        target: &'static str,
        hint: Hint,
        compute: Compute<Option<EntityRef>>,
    ) -> Self {
        self.field(
            name,
            FieldKind::ReactiveReference {
                target,
                hint,
                compute,
                inverse: None,
            },
        )
    }

    pub fn reactive_collection(
        self,
        name: &'static str,
        target: &'static str,
        hint: Hint,
        compute: Compute<Vec<EntityRef>>,
    ) -> Self {
        self.field(
            name,
            FieldKind::ReactiveCollection {
                target,
                hint,
                compute,
            },
        )
    }

    pub fn recursive(self, name: &'static str, relation: &'static str) -> Self {
        self.field(name, FieldKind::Recursive { relation })
    }

    /// Declare audit columns, adding them as primitives if not declared yet.
    pub fn timestamps(mut self, created_at: &'static str, updated_at: &'static str) -> Self {
        for name in [created_at, updated_at] {
            if !self.field_index.contains_key(name) {
                self = self.primitive(name);
            }
        }
        self.timestamps = Some(Timestamps {
            created_at,
            updated_at,
        });
        self
    }

    /// Declare the soft-delete marker column.
    pub fn soft_delete(mut self, column: &'static str) -> Self {
        if !self.field_index.contains_key(column) {
            self = self.primitive(column);
        }
        self.soft_delete = Some(column);
        self
    }

    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_index.get(name).copied()
    }

    /// Look up a field by name.
    pub fn field_meta(&self, name: &str) -> Result<&FieldMeta> {
        self.field_index
            .get(name)
            .map(|i| &self.fields[*i])
            .ok_or_else(|| Error::UnknownField {
                entity_type: self.name.to_string(),
                field: name.to_string(),
            })
    }

    /// Index and metadata of a field.
    pub fn resolve(&self, name: &str) -> Result<(usize, &FieldMeta)> {
        let index = self.field_index(name).ok_or_else(|| Error::UnknownField {
            entity_type: self.name.to_string(),
            field: name.to_string(),
        })?;
        Ok((index, &self.fields[index]))
    }

    pub fn reactive_fields(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields.iter().filter(|f| f.kind.is_reactive())
    }

    /// Make a tagged id of this type.
    pub fn id(&self, value: IdValue) -> TaggedId {
        TaggedId::new(self.tag, value)
    }
}

/// The registry of all entity types.
#[derive(Debug, Clone)]
pub struct Metadata {
    entities: Vec<EntityMetadata>,
    by_name: HashMap<&'static str, usize>,
    by_tag: HashMap<&'static str, usize>,
}

impl Metadata {
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder::default()
    }

    pub fn entity(&self, name: &str) -> Result<&EntityMetadata> {
        self.by_name
            .get(name)
            .map(|i| &self.entities[*i])
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    pub fn by_tag(&self, tag: &str) -> Result<&EntityMetadata> {
        self.by_tag
            .get(tag)
            .map(|i| &self.entities[*i])
            .ok_or_else(|| Error::UnknownEntityType(tag.to_string()))
    }

    pub fn entity_for_id(&self, id: &TaggedId) -> Result<&EntityMetadata> {
        self.by_tag(id.tag())
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.entities.iter()
    }

    pub fn field(&self, entity_type: &str, field: &str) -> Result<&FieldMeta> {
        self.entity(entity_type)?.field_meta(field)
    }

    /// Parse a tagged id such as `a:1`, resolving the tag.
    pub fn parse_id(&self, s: &str) -> Result<TaggedId> {
        let invalid = || {
            Error::Type(TypeError {
                expected: "tagged id",
                actual: s.to_string(),
                field: None,
            })
        };
        let (tag, value) = s.split_once(':').ok_or_else(invalid)?;
        let meta = self.by_tag(tag)?;
        let value = IdValue::parse(value).ok_or_else(invalid)?;
        match (meta.id_kind, value) {
            (IdKind::Int, IdValue::Int(_)) | (IdKind::Uuid, IdValue::Uuid(_)) => {
                Ok(meta.id(value))
            }
            _ => Err(invalid()),
        }
    }
}

/// Collects entity declarations and checks them as a whole.
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    entities: Vec<EntityMetadata>,
}

impl MetadataBuilder {
    pub fn entity(mut self, meta: EntityMetadata) -> Self {
        self.entities.push(meta);
        self
    }

    /// Check every declaration and build the registry.
    ///
    /// Rejects duplicate names, tags and fields, unknown relation targets,
    /// and inverses that do not point back at the declaring field.
    pub fn build(self) -> Result<Metadata> {
        let mut by_name = HashMap::new();
        let mut by_tag = HashMap::new();
        for (i, meta) in self.entities.iter().enumerate() {
            if meta.tag.is_empty() || meta.tag.contains(':') {
                return Err(config(format!("{} has an invalid tag '{}'", meta.name, meta.tag)));
            }
            if by_name.insert(meta.name, i).is_some() {
                return Err(config(format!("entity type {} declared twice", meta.name)));
            }
            if let Some(prev) = by_tag.insert(meta.tag, i) {
                return Err(config(format!(
                    "tag '{}' used by both {} and {}",
                    meta.tag, self.entities[prev].name, meta.name
                )));
            }
        }

        let metadata = Metadata {
            entities: self.entities,
            by_name,
            by_tag,
        };
        for meta in &metadata.entities {
            check_entity(&metadata, meta)?;
        }
        tracing::debug!(entities = metadata.entities.len(), "Metadata built");
        Ok(metadata)
    }
}

fn config(message: String) -> Error {
    Error::Config(ConfigError::new(message))
}

fn check_entity(metadata: &Metadata, meta: &EntityMetadata) -> Result<()> {
    if meta.field_index.len() != meta.fields.len() {
        return Err(config(format!("{} declares a field twice", meta.name)));
    }
    for field in &meta.fields {
        check_field(metadata, meta, field)?;
    }
    let primitive = |name: &str, what: &str| -> Result<()> {
        match meta.field_meta(name).map(|f| &f.kind) {
            Ok(FieldKind::Primitive { .. }) => Ok(()),
            _ => Err(config(format!(
                "{} {} column '{}' must be a primitive field",
                meta.name, what, name
            ))),
        }
    };
    if let Some(ts) = meta.timestamps {
        primitive(ts.created_at, "timestamp")?;
        primitive(ts.updated_at, "timestamp")?;
    }
    if let Some(column) = meta.soft_delete {
        primitive(column, "soft-delete")?;
    }
    for rule in &meta.rules {
        if meta.field_index(rule.field).is_none() {
            return Err(config(format!(
                "{} has a validation rule on unknown field '{}'",
                meta.name, rule.field
            )));
        }
    }
    Ok(())
}

fn check_field(metadata: &Metadata, meta: &EntityMetadata, field: &FieldMeta) -> Result<()> {
    let target_of = |name: &str| {
        metadata.entity(name).map_err(|_| {
            config(format!(
                "{}.{} targets unknown entity type {}",
                meta.name, field.name, name
            ))
        })
    };
    // A one-to-many/one-to-one on `target` named `inverse` must list this type.
    let check_collection_inverse = |target: &EntityMetadata, inverse: &str| -> Result<()> {
        match target.field_meta(inverse).map(|f| &f.kind) {
            Ok(
                FieldKind::OneToMany {
                    target: back,
                    inverse: back_inverse,
                }
                | FieldKind::OneToOne {
                    target: back,
                    inverse: back_inverse,
                },
            ) if *back == meta.name && *back_inverse == field.name => Ok(()),
            _ => Err(config(format!(
                "{}.{} declares inverse {}.{} which does not point back",
                meta.name, field.name, target.name, inverse
            ))),
        }
    };

    match &field.kind {
        FieldKind::Primitive { .. } | FieldKind::ReactiveField { .. } => Ok(()),
        FieldKind::ManyToOne {
            target, inverse, ..
        }
        | FieldKind::ReactiveReference {
            target, inverse, ..
        } => {
            let target = target_of(target)?;
            match inverse {
                Some(inverse) => check_collection_inverse(target, inverse),
                None => Ok(()),
            }
        }
        FieldKind::Polymorphic {
            targets, inverse, ..
        } => {
            if targets.is_empty() {
                return Err(config(format!(
                    "{}.{} has no component types",
                    meta.name, field.name
                )));
            }
            for target in targets {
                let target = target_of(target)?;
                if let Some(inverse) = inverse {
                    check_collection_inverse(target, inverse)?;
                }
            }
            Ok(())
        }
        FieldKind::OneToMany { target, inverse } | FieldKind::OneToOne { target, inverse } => {
            let target = target_of(target)?;
            let points_back = match target.field_meta(inverse).map(|f| &f.kind) {
                Ok(
                    FieldKind::ManyToOne { target: back, .. }
                    | FieldKind::ReactiveReference { target: back, .. },
                ) => *back == meta.name,
                Ok(FieldKind::Polymorphic { targets, .. }) => targets.contains(&meta.name),
                _ => false,
            };
            if points_back {
                Ok(())
            } else {
                Err(config(format!(
                    "{}.{} needs a reference {}.{} pointing back",
                    meta.name, field.name, target.name, inverse
                )))
            }
        }
        FieldKind::ManyToMany {
            target,
            inverse,
            join_table,
            column,
            other_column,
        } => {
            let target = target_of(target)?;
            if column == other_column {
                return Err(config(format!(
                    "{}.{} uses '{}' for both join columns",
                    meta.name, field.name, column
                )));
            }
            let Some(inverse) = inverse else {
                return Ok(());
            };
            match target.field_meta(inverse).map(|f| &f.kind) {
                Ok(FieldKind::ManyToMany {
                    target: back,
                    join_table: back_table,
                    column: back_column,
                    other_column: back_other,
                    ..
                }) if *back == meta.name
                    && back_table == join_table
                    && back_column == other_column
                    && back_other == column =>
                {
                    Ok(())
                }
                _ => Err(config(format!(
                    "{}.{} declares inverse {}.{} which does not mirror its join table",
                    meta.name, field.name, target.name, inverse
                ))),
            }
        }
        FieldKind::ReactiveCollection { target, .. } => target_of(target).map(|_| ()),
        FieldKind::Recursive { relation } => match meta.field_meta(relation).map(|f| &f.kind) {
            Ok(
                FieldKind::ManyToOne { target, .. }
                | FieldKind::OneToMany { target, .. }
                | FieldKind::OneToOne { target, .. },
            ) if *target == meta.name => Ok(()),
            _ => Err(config(format!(
                "{}.{} must walk a relation of {} onto itself, not '{}'",
                meta.name, field.name, meta.name, relation
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> EntityMetadata {
        EntityMetadata::new("Author", "a")
            .required("firstName")
            .many_to_one("mentor", "Author", Some("mentees"))
            .one_to_many("mentees", "Author", "mentor")
            .one_to_many("books", "Book", "author")
            .recursive("mentorsRecursive", "mentor")
            .timestamps("createdAt", "updatedAt")
    }

    fn book() -> EntityMetadata {
        EntityMetadata::new("Book", "b")
            .required("title")
            .required_many_to_one("author", "Author", Some("books"))
    }

    #[test]
    fn test_build_and_lookup() {
        let metadata = Metadata::builder()
            .entity(author())
            .entity(book())
            .build()
            .unwrap();

        let a = metadata.entity("Author").unwrap();
        assert_eq!(a.tag, "a");
        assert!(a.field_meta("createdAt").is_ok());
        assert!(matches!(
            a.field_meta("nope"),
            Err(Error::UnknownField { .. })
        ));
        assert_eq!(metadata.by_tag("b").unwrap().name, "Book");
        assert!(metadata.field("Book", "author").unwrap().kind.is_reference());
    }

    #[test]
    fn test_parse_id() {
        let metadata = Metadata::builder().entity(author()).entity(book()).build().unwrap();
        assert_eq!(metadata.parse_id("a:1").unwrap(), TaggedId::int("a", 1));
        assert!(matches!(
            metadata.parse_id("z:1"),
            Err(Error::UnknownEntityType(_))
        ));
        assert!(matches!(metadata.parse_id("a1"), Err(Error::Type(_))));
        assert!(metadata
            .parse_id("a:550e8400-e29b-41d4-a716-446655440000")
            .is_err());
    }

    #[test]
    fn test_rejects_duplicate_tag() {
        let err = Metadata::builder()
            .entity(author())
            .entity(EntityMetadata::new("Other", "a"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("tag 'a'"));
    }

    #[test]
    fn test_rejects_inverse_that_does_not_point_back() {
        let err = Metadata::builder()
            .entity(author())
            .entity(
                EntityMetadata::new("Book", "b")
                    .required("title")
                    .many_to_one("author", "Author", Some("mentees")),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_missing_back_reference() {
        let err = Metadata::builder()
            .entity(author())
            .entity(EntityMetadata::new("Book", "b").required("title"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Author.books"));
    }

    #[test]
    fn test_rejects_recursive_over_foreign_relation() {
        let err = Metadata::builder()
            .entity(author().recursive("booksRecursive", "books"))
            .entity(book())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("booksRecursive"));
    }

    #[test]
    fn test_many_to_many_inverse_must_mirror() {
        let tag = EntityMetadata::new("Tag", "t").required("name").many_to_many(
            "authors",
            "Author",
            "authors_to_tags",
            ("tag_id", "author_id"),
            Some("tags"),
        );
        let good = author().many_to_many(
            "tags",
            "Tag",
            "authors_to_tags",
            ("author_id", "tag_id"),
            Some("authors"),
        );
        assert!(Metadata::builder()
            .entity(good)
            .entity(book())
            .entity(tag.clone())
            .build()
            .is_ok());

        let bad = author().many_to_many(
            "tags",
            "Tag",
            "authors_to_tags",
            ("tag_id", "author_id"),
            Some("authors"),
        );
        assert!(Metadata::builder()
            .entity(bad)
            .entity(book())
            .entity(tag)
            .build()
            .is_err());
    }

    #[test]
    fn test_timestamps_add_primitive_columns() {
        let meta = author();
        let ts = meta.timestamps.unwrap();
        assert!(matches!(
            meta.field_meta(ts.updated_at).unwrap().kind,
            FieldKind::Primitive { required: false }
        ));
    }
}
