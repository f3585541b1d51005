mod common;

use common::{author_row, book_row, expect_err, run, session, session_with, unwrap_outcome};
use reactorm::prelude::*;
use reactorm::{EntityId, FieldInit, ObjectState, PendingChange, SessionPlugin};

#[test]
fn test_loading_the_same_id_twice_returns_the_same_entity() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    let cx = Cx::for_testing();

    run(async {
        let first = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        let second = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        assert_eq!(first, second);

        let found = unwrap_outcome(
            s.find(&cx, "Author", &Filter::new().eq("firstName", "a1"), &FindOptions::new())
                .await,
        );
        assert_eq!(found, vec![first]);
        assert_eq!(s.driver().stats().loads, 1);

        let missing = unwrap_outcome(s.load(&cx, TaggedId::int("a", 99)).await);
        assert!(missing.is_none());
    });
}

#[test]
fn test_stored_rows_never_overwrite_in_memory_state() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    let cx = Cx::for_testing();

    run(async {
        let a = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        s.set(a, "firstName", "edited").unwrap();
        let found = unwrap_outcome(s.find(&cx, "Author", &Filter::new(), &FindOptions::new()).await);
        assert_eq!(found, vec![a]);
        assert_eq!(s.get(a, "firstName").unwrap(), Value::from("edited"));
    });
}

#[test]
fn test_created_entities_get_distinct_placeholders() {
    let s = session();
    let a = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
    let b = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
    assert_ne!(a, b);
    let (ida, idb) = (s.id(a).unwrap(), s.id(b).unwrap());
    assert!(ida.is_placeholder() && idb.is_placeholder());
    assert_ne!(ida, idb);
    assert!(s.is_new(a).unwrap());
    assert_eq!(s.collection(a, "books").unwrap(), vec![]);
}

#[test]
fn test_setting_the_current_value_is_not_a_change() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    let cx = Cx::for_testing();

    run(async {
        let a = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        s.set(a, "firstName", "a1").unwrap();
        assert!(!s.is_dirty(a).unwrap());
        assert!(s.pending_changes().is_empty());

        s.set(a, "firstName", "a2").unwrap();
        assert_eq!(s.changed_fields(a).unwrap(), vec!["firstName"]);
        assert_eq!(s.original_value(a, "firstName").unwrap(), Some(Value::from("a1")));

        // Back to the original: clean again.
        s.set(a, "firstName", "a1").unwrap();
        assert!(!s.is_dirty(a).unwrap());
        assert!(s.pending_changes().is_empty());
    });
}

#[test]
fn test_many_to_many_add_then_remove_cancels() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    s.driver().insert_row(Row::new(TaggedId::int("t", 1)).with("name", "t1"));
    let cx = Cx::for_testing();

    run(async {
        let a = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        let t = unwrap_outcome(s.load(&cx, TaggedId::int("t", 1)).await).unwrap();
        assert!(unwrap_outcome(s.load_collection(&cx, a, "tags").await).is_empty());

        s.add(a, "tags", t).unwrap();
        assert!(matches!(
            s.pending_changes()[..],
            [PendingChange::M2mAdd { join_table: "authors_to_tags", .. }]
        ));
        s.remove(a, "tags", t).unwrap();
        assert!(s.pending_changes().is_empty());

        s.add(a, "tags", t).unwrap();
        unwrap_outcome(s.commit(&cx).await);
        assert_eq!(s.driver().links("authors_to_tags").len(), 1);
        assert_eq!(unwrap_outcome(s.load_collection(&cx, t, "authors").await), vec![a]);
    });
}

#[test]
fn test_unloaded_relations_fail_synchronously() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    s.driver().insert_row(book_row(1, "b1", 1));
    let cx = Cx::for_testing();

    run(async {
        let b = unwrap_outcome(s.load(&cx, TaggedId::int("b", 1)).await).unwrap();
        assert!(matches!(s.reference(b, "author"), Err(Error::NotLoaded { .. })));
        let a = unwrap_outcome(s.load_reference(&cx, b, "author").await).unwrap();
        assert_eq!(s.reference(b, "author").unwrap(), Some(a));

        assert!(matches!(s.collection(a, "books"), Err(Error::NotLoaded { .. })));
        assert_eq!(unwrap_outcome(s.load_collection(&cx, a, "books").await), vec![b]);
    });
}

#[test]
fn test_unknown_names_are_rejected() {
    let s = session();
    assert!(matches!(
        s.create("Nope", vec![]),
        Err(Error::UnknownEntityType(_))
    ));
    let a = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
    assert!(matches!(s.set(a, "nope", 1), Err(Error::UnknownField { .. })));
    assert!(matches!(
        s.set(a, "books", 1),
        Err(Error::Type(_))
    ));
}

#[test]
fn test_relation_targets_must_have_the_declared_type() {
    let s = session();
    let a = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
    let t = s.create("Tag", vec![("name", "t1".into())]).unwrap();
    assert!(matches!(
        s.create("Book", vec![("title", "b1".into()), ("author", t.into())]),
        Err(Error::Type(_))
    ));
    let b = s
        .create("Book", vec![("title", "b1".into()), ("author", a.into())])
        .unwrap();
    assert_eq!(s.collection(a, "books").unwrap(), vec![b]);
}

#[test]
fn test_deleting_a_new_entity_leaves_nothing_pending() {
    let s = session();
    let a = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
    let b = s
        .create("Book", vec![("title", "b1".into()), ("author", a.into())])
        .unwrap();
    s.delete(b).unwrap();
    assert_eq!(s.pending_changes(), vec![PendingChange::Create(a)]);
    assert_eq!(s.state(b).unwrap(), ObjectState::Detached);
    assert!(s.collection(a, "books").unwrap().is_empty());
    assert!(matches!(
        s.set(b, "title", "b2"),
        Err(Error::EntityDeleted { .. })
    ));
}

#[test]
fn test_soft_deleted_rows_are_filtered() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    s.driver().insert_row(book_row(1, "b1", 1));
    s.driver()
        .insert_row(book_row(2, "b2", 1).with("deletedAt", Value::Timestamp(1)));
    let cx = Cx::for_testing();

    run(async {
        let a = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        let books = unwrap_outcome(s.load_collection(&cx, a, "books").await);
        assert_eq!(books.len(), 1);
        assert_eq!(s.get(books[0], "title").unwrap(), Value::from("b1"));

        let found = unwrap_outcome(s.find(&cx, "Book", &Filter::new(), &FindOptions::new()).await);
        assert_eq!(found, books);
        let all = FindOptions::new().include_soft_deleted(true);
        assert_eq!(unwrap_outcome(s.find(&cx, "Book", &Filter::new(), &all).await).len(), 2);

        assert!(unwrap_outcome(s.load(&cx, TaggedId::int("b", 2)).await).is_none());
    });
}

#[test]
fn test_read_only_session_rejects_mutation() {
    let s = session_with(SessionConfig::new().mode(SessionMode::ReadOnly));
    s.driver().insert_row(author_row(1, "a1"));
    let cx = Cx::for_testing();

    assert!(matches!(
        s.create("Author", vec![("firstName", "a1".into())]),
        Err(Error::ReadOnly { .. })
    ));
    run(async {
        let a = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        assert_eq!(s.get(a, "firstName").unwrap(), Value::from("a1"));
        assert!(matches!(s.set(a, "firstName", "x"), Err(Error::ReadOnly { .. })));
        assert!(matches!(s.delete(a), Err(Error::ReadOnly { .. })));
        assert!(!s.is_dirty(a).unwrap());
    });
}

struct Freeze;

impl SessionPlugin for Freeze {
    fn name(&self) -> &'static str {
        "freeze"
    }

    fn before_set_field(
        &self,
        entity_type: &'static str,
        _entity: EntityRef,
        field: &'static str,
        _value: &FieldInit,
    ) -> Result<()> {
        if entity_type == "Author" && field == "lastName" {
            return Err(Error::Custom("lastName is frozen".to_string()));
        }
        Ok(())
    }

    fn before_find(&self, entity_type: &'static str, _filter: &Filter) -> Result<()> {
        if entity_type == "Tag" {
            return Err(Error::Custom("tags are hidden".to_string()));
        }
        Ok(())
    }
}

#[test]
fn test_plugins_can_abort_operations() {
    let s = session();
    s.add_plugin(Arc::new(Freeze));
    let cx = Cx::for_testing();

    let a = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
    assert!(matches!(s.set(a, "lastName", "x"), Err(Error::Custom(_))));
    assert_eq!(s.get(a, "lastName").unwrap(), Value::Null);
    assert!(s.set(a, "firstName", "a2").is_ok());

    run(async {
        let err = expect_err(s.find(&cx, "Tag", &Filter::new(), &FindOptions::new()).await);
        assert!(matches!(err, Error::Custom(_)));
    });
    assert_eq!(s.driver().stats().finds, 0);
}

#[test]
fn test_debug_info_counts_pending_work() {
    let s = session();
    let a = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
    s.create("Book", vec![("title", "b1".into()), ("author", a.into())])
        .unwrap();
    let info = s.debug_info();
    assert_eq!(info.tracked, 2);
    assert_eq!(info.pending_new, 2);
    assert!(!info.committing);
    assert!(matches!(s.id(a).unwrap(), EntityId::Placeholder(_)));
    assert!(s.metadata().entity("Author").is_ok());

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["pending_new"], 2);
    assert_eq!(json["loader"]["driver_calls"], 0);
}
