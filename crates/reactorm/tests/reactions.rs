mod common;

use common::{author_row, book_row, expect_err, join, run, session, session_with, unwrap_outcome};
use reactorm::prelude::*;
use reactorm::{Column, Compute, ObjectState};
use std::collections::BTreeSet;

fn review_row(id: i64, book: i64, rating: i64) -> Row {
    Row::new(TaggedId::int("br", id))
        .with("rating", rating)
        .with_ref("book", Some(TaggedId::int("b", book)))
}

#[test]
fn test_favorite_book_for_new_entities() {
    let s = session();
    let cx = Cx::for_testing();

    run(async {
        let a = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
        let b1 = s
            .create("Book", vec![("title", "b1".into()), ("author", a.into())])
            .unwrap();
        let b2 = s
            .create("Book", vec![("title", "b2".into()), ("author", a.into())])
            .unwrap();
        s.create("BookReview", vec![("rating", 5.into()), ("book", b1.into())])
            .unwrap();
        s.create("BookReview", vec![("rating", 3.into()), ("book", b2.into())])
            .unwrap();

        let summary = unwrap_outcome(s.commit(&cx).await);
        assert!(summary.recalculated >= 2);
        assert_eq!(s.reference(a, "favoriteBook").unwrap(), Some(b1));
        assert_eq!(s.get(a, "numberOfBooks").unwrap(), Value::from(2i64));
        assert!(s.pending_changes().is_empty());

        let row = s.driver().row(TaggedId::int("a", 1)).unwrap();
        assert_eq!(row.reference("favoriteBook"), Some(TaggedId::int("b", 1)));
        assert_eq!(row.get("numberOfBooks"), Value::from(2i64));
    });
}

#[test]
fn test_favorite_book_reaches_stored_reviews() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    s.driver().insert_row(book_row(1, "b1", 1));
    s.driver().insert_row(book_row(2, "b2", 1));
    s.driver().insert_row(review_row(1, 1, 2));
    s.driver().insert_row(review_row(2, 2, 3));
    let cx = Cx::for_testing();

    run(async {
        // Only the book is loaded; the walk back and the hint load the rest.
        let b1 = unwrap_outcome(s.load(&cx, TaggedId::int("b", 1)).await).unwrap();
        s.create("BookReview", vec![("rating", 5.into()), ("book", b1.into())])
            .unwrap();
        unwrap_outcome(s.commit(&cx).await);

        let a = s.lookup(TaggedId::int("a", 1)).unwrap();
        assert_eq!(s.reference(a, "favoriteBook").unwrap(), Some(b1));
        assert_eq!(s.collection(a, "books").unwrap().len(), 2);
        let row = s.driver().row(TaggedId::int("a", 1)).unwrap();
        assert_eq!(row.reference("favoriteBook"), Some(TaggedId::int("b", 1)));
        assert_eq!(row.get("numberOfBooks"), Value::from(2i64));
    });
}

#[test]
fn test_moving_a_book_recalculates_both_authors() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    s.driver().insert_row(author_row(2, "a2"));
    s.driver().insert_row(book_row(1, "b1", 1));
    s.driver().insert_row(book_row(2, "b2", 1));
    let cx = Cx::for_testing();

    run(async {
        let b1 = unwrap_outcome(s.load(&cx, TaggedId::int("b", 1)).await).unwrap();
        let a2 = unwrap_outcome(s.load(&cx, TaggedId::int("a", 2)).await).unwrap();
        s.set_reference(b1, "author", Some(a2)).unwrap();

        unwrap_outcome(s.commit(&cx).await);
        let count = |id| s.driver().row(TaggedId::int("a", id)).unwrap().get("numberOfBooks");
        assert_eq!(count(1), Value::from(1i64));
        assert_eq!(count(2), Value::from(1i64));

        // Recalculating without changes is a no-op.
        let again = unwrap_outcome(s.commit(&cx).await);
        assert_eq!(again.recalculated, 0);
        assert_eq!(again.updated, 0);
    });
}

#[test]
fn test_polymorphic_parent_label_follows_either_parent() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    s.driver().insert_row(book_row(1, "b1", 1));
    s.driver().insert_row(
        Row::new(TaggedId::int("c", 1))
            .with("text", "nice")
            .with_ref("parent", Some(TaggedId::int("b", 1)))
            .with("parentLabel", "b1"),
    );
    let cx = Cx::for_testing();

    run(async {
        let b1 = unwrap_outcome(s.load(&cx, TaggedId::int("b", 1)).await).unwrap();
        s.set(b1, "title", "b1 revised").unwrap();
        unwrap_outcome(s.commit(&cx).await);
        let row = s.driver().row(TaggedId::int("c", 1)).unwrap();
        assert_eq!(row.get("parentLabel"), Value::from("b1 revised"));

        let a1 = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        let c2 = s
            .create("Comment", vec![("text", "hi".into()), ("parent", a1.into())])
            .unwrap();
        unwrap_outcome(s.commit(&cx).await);
        assert_eq!(s.get(c2, "parentLabel").unwrap(), Value::from("a1"));

        s.set(a1, "firstName", "a1 renamed").unwrap();
        unwrap_outcome(s.commit(&cx).await);
        let c2_id = s.id(c2).unwrap().persisted().unwrap();
        assert_eq!(
            s.driver().row(c2_id).unwrap().get("parentLabel"),
            Value::from("a1 renamed")
        );
        assert_eq!(
            s.driver().row(TaggedId::int("c", 1)).unwrap().get("parentLabel"),
            Value::from("b1 revised")
        );
    });
}

#[test]
fn test_concurrent_loads_share_one_driver_call() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    s.driver().insert_row(author_row(2, "a2"));
    s.driver().insert_row(book_row(1, "b1", 1));
    s.driver().insert_row(book_row(2, "b2", 2));
    let cx = Cx::for_testing();

    run(async {
        let authors =
            unwrap_outcome(s.load_all(&cx, &[TaggedId::int("a", 1), TaggedId::int("a", 2)]).await);
        assert_eq!(authors.len(), 2);
        assert_eq!(s.driver().stats().loads, 1);
        s.driver().reset_stats();

        let (first, second) = join(
            s.load_collection(&cx, authors[0], "books"),
            s.load_collection(&cx, authors[1], "books"),
        )
        .await;
        assert_eq!(unwrap_outcome(first).len(), 1);
        assert_eq!(unwrap_outcome(second).len(), 1);
        assert_eq!(s.driver().stats().finds, 1);

        // Already loaded: no further calls.
        unwrap_outcome(s.load_collection(&cx, authors[0], "books").await);
        assert_eq!(s.driver().stats().reads(), 1);
    });
}

#[test]
fn test_populate_loads_a_whole_hint() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    s.driver().insert_row(book_row(1, "b1", 1));
    s.driver().insert_row(review_row(1, 1, 4));
    let cx = Cx::for_testing();

    run(async {
        let a = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        let hint = Hint::node([("books", Hint::leaf("reviews"))]);
        unwrap_outcome(s.populate(&cx, &[a], &hint).await);
        let books = s.collection(a, "books").unwrap();
        let reviews = s.collection(books[0], "reviews").unwrap();
        assert_eq!(s.get(reviews[0], "rating").unwrap(), Value::from(4i64));

        assert_eq!(
            unwrap_outcome(s.load_value(&cx, a, "numberOfBooks").await),
            Value::from(1i64)
        );
        let err = expect_err(s.populate(&cx, &[a], &Hint::leaf("nope")).await);
        assert!(matches!(err, Error::UnknownField { .. }));
    });
}

fn mentors(s: &Session<MemoryDriver>) {
    s.driver().insert_row(author_row(1, "a1"));
    for (id, mentor) in [(2, 1), (3, 2)] {
        s.driver().insert_row(
            author_row(id, &format!("a{id}")).with_ref("mentor", Some(TaggedId::int("a", mentor))),
        );
    }
}

#[test]
fn test_recursive_relations_load_and_walk() {
    let s = session();
    mentors(&s);
    let cx = Cx::for_testing();

    run(async {
        let a3 = unwrap_outcome(s.load(&cx, TaggedId::int("a", 3)).await).unwrap();
        assert!(matches!(s.recursive(a3, "mentorChain"), Err(Error::NotLoaded { .. })));
        let chain = unwrap_outcome(s.load_recursive(&cx, a3, "mentorChain").await);
        let ids: Vec<String> = chain.iter().map(|e| s.id(*e).unwrap().to_string()).collect();
        assert_eq!(ids, vec!["a:2", "a:1"]);

        let a1 = chain[1];
        let tree = unwrap_outcome(s.load_recursive(&cx, a1, "menteesTree").await);
        assert_eq!(tree, vec![chain[0], a3]);
    });
}

#[test]
fn test_mentor_cycle_is_reported_and_blocks_commit() {
    let s = session();
    mentors(&s);
    let cx = Cx::for_testing();

    run(async {
        let ids = [1, 2, 3].map(|n| TaggedId::int("a", n));
        let authors = unwrap_outcome(s.load_all(&cx, &ids).await);
        let (a1, a3) = (authors[0], authors[2]);
        s.set_reference(a1, "mentor", Some(a3)).unwrap();

        let Err(Error::Cycle(cycle)) = s.recursive(a3, "mentorChain") else {
            panic!("expected a cycle");
        };
        assert_eq!(cycle.relation, "mentor");
        let path: Vec<String> = cycle.path.iter().map(ToString::to_string).collect();
        assert_eq!(path, vec!["a:3", "a:2", "a:1", "a:3"]);

        assert!(matches!(expect_err(s.commit(&cx).await), Error::Cycle(_)));
        assert!(s.is_dirty(a1).unwrap());
        assert_eq!(s.driver().stats().writes, 0);

        s.set_reference(a1, "mentor", None).unwrap();
        unwrap_outcome(s.commit(&cx).await);
        assert_eq!(s.recursive(a3, "mentorChain").unwrap().len(), 2);
    });
}

fn linear(s: &Session<MemoryDriver>, books: &[EntityRef], title: &str) -> Vec<EntityRef> {
    books
        .iter()
        .copied()
        .filter(|b| s.state(*b).unwrap() == ObjectState::New)
        .filter(|b| s.get(*b, "title").unwrap() == Value::from(title))
        .collect()
}

#[test]
fn test_indexed_search_matches_a_linear_scan() {
    let s = session_with(SessionConfig::new().index_threshold(5));
    let cx = Cx::for_testing();

    run(async {
        let a = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
        let mut books: Vec<EntityRef> = (0..8)
            .map(|i| {
                let title = format!("t{}", i % 4);
                s.create("Book", vec![("title", title.into()), ("author", a.into())])
                    .unwrap()
            })
            .collect();

        for title in ["t0", "t1", "t9"] {
            let criteria = Criteria::new().eq("title", title);
            let found = unwrap_outcome(s.find_with_new_or_changed(&cx, "Book", &criteria).await);
            assert_eq!(found, linear(&s, &books, title));
        }
        assert!(s.debug_info().indexed_fields > 0);

        s.set(books[0], "title", "t1").unwrap();
        s.delete(books[1]).unwrap();
        books.push(
            s.create("Book", vec![("title", "t1".into()), ("author", a.into())])
                .unwrap(),
        );
        let criteria = Criteria::new().eq("title", "t1");
        let found = unwrap_outcome(s.find_with_new_or_changed(&cx, "Book", &criteria).await);
        assert_eq!(found, linear(&s, &books, "t1"));
        assert_eq!(found.len(), 3);

        // An unsaved author is matched in memory only.
        let by_author = Criteria::new().entity("author", a);
        let found = unwrap_outcome(s.find_with_new_or_changed(&cx, "Book", &by_author).await);
        assert_eq!(found.len(), 8);
        assert_eq!(s.driver().stats().finds, 4);
    });
}

async fn assert_search_matches_scan(s: &Session<MemoryDriver>, cx: &Cx, books: &[EntityRef]) {
    for title in ["t0", "t1"] {
        let criteria = Criteria::new().eq("title", title);
        let found = unwrap_outcome(s.find_with_new_or_changed(cx, "Book", &criteria).await);
        assert_eq!(found, linear(s, books, title), "title {title}");
    }
}

#[test]
fn test_search_agrees_across_the_index_threshold() {
    let s = session_with(SessionConfig::new().index_threshold(5));
    let cx = Cx::for_testing();

    run(async {
        let a = s.create("Author", vec![("firstName", "a1".into())]).unwrap();
        let create = |title: &str| {
            s.create("Book", vec![("title", title.into()), ("author", a.into())])
                .unwrap()
        };
        let mut books: Vec<EntityRef> = ["t0", "t1", "t0", "t1", "t0"].into_iter().map(create).collect();

        // At the threshold: scanned, nothing indexed.
        assert_search_matches_scan(&s, &cx, &books).await;
        assert_eq!(s.debug_info().indexed_fields, 0);

        // Changes made while scanning are seen once the index is built.
        s.set(books[0], "title", "t1").unwrap();
        s.delete(books[1]).unwrap();
        books.push(create("t0"));
        books.push(create("t1"));
        assert_search_matches_scan(&s, &cx, &books).await;
        assert_eq!(s.debug_info().indexed_fields, 1);

        // Changes after the build are maintained.
        s.set(books[2], "title", "t1").unwrap();
        s.delete(books[3]).unwrap();
        books.push(create("t0"));
        assert_search_matches_scan(&s, &cx, &books).await;
        let t1 = unwrap_outcome(
            s.find_with_new_or_changed(&cx, "Book", &Criteria::new().eq("title", "t1")).await,
        );
        assert!(t1.contains(&books[2]) && !t1.contains(&books[3]));

        // Back at the threshold: scanned again.
        s.delete(books[7]).unwrap();
        assert_search_matches_scan(&s, &cx, &books).await;
    });
}

#[test]
fn test_search_uses_in_memory_values_over_stored_rows() {
    let s = session();
    s.driver().insert_row(author_row(1, "a1"));
    s.driver().insert_row(book_row(1, "t1", 1));
    s.driver().insert_row(book_row(2, "t2", 1));
    let cx = Cx::for_testing();

    run(async {
        let b2 = unwrap_outcome(s.load(&cx, TaggedId::int("b", 2)).await).unwrap();
        s.set(b2, "title", "t1").unwrap();
        let criteria = Criteria::new().eq("title", "t1");
        let found = unwrap_outcome(s.find_with_new_or_changed(&cx, "Book", &criteria).await);
        let b1 = s.lookup(TaggedId::int("b", 1)).unwrap();
        assert_eq!(found.iter().copied().collect::<BTreeSet<_>>(), BTreeSet::from([b1, b2]));

        s.set(b1, "title", "renamed").unwrap();
        let found = unwrap_outcome(s.find_with_new_or_changed(&cx, "Book", &criteria).await);
        assert_eq!(found, vec![b2]);

        let by_id = Criteria::new().id("author", TaggedId::int("a", 1));
        let found = unwrap_outcome(s.find_with_new_or_changed(&cx, "Book", &by_id).await);
        assert_eq!(found.len(), 2);
        assert!(matches!(
            s.driver().row(TaggedId::int("b", 1)).unwrap().column("author"),
            Some(Column::Ref(Some(_)))
        ));
    });
}

/// `reviewCount` declares only `books` but also reads each book's reviews.
fn under_declared_session() -> Session<MemoryDriver> {
    let metadata = Metadata::builder()
        .entity(
            EntityMetadata::new("Author", "a")
                .required("firstName")
                .one_to_many("books", "Book", "author")
                .reactive_field(
                    "reviewCount",
                    Hint::leaf("books"),
                    true,
                    Compute::new(|r, a| {
                        let mut count = 0;
                        for book in r.collection(a, "books")? {
                            count += r.collection(book, "reviews")?.len() as i64;
                        }
                        Ok(Value::from(count))
                    }),
                ),
        )
        .entity(
            EntityMetadata::new("Book", "b")
                .required("title")
                .required_many_to_one("author", "Author", Some("books"))
                .one_to_many("reviews", "BookReview", "book"),
        )
        .entity(
            EntityMetadata::new("BookReview", "br")
                .required("rating")
                .required_many_to_one("book", "Book", Some("reviews")),
        )
        .build()
        .unwrap();
    Session::new(MemoryDriver::new(), Arc::new(metadata)).unwrap()
}

#[test]
fn test_reading_outside_the_hint_fails_the_commit() {
    let s = under_declared_session();
    s.driver().insert_row(author_row(1, "a1").with("reviewCount", 7i64));
    s.driver().insert_row(book_row(1, "b1", 1));
    s.driver().insert_row(review_row(1, 1, 4));
    let cx = Cx::for_testing();

    run(async {
        let a = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        let b2 = s
            .create("Book", vec![("title", "b2".into()), ("author", a.into())])
            .unwrap();

        let err = expect_err(s.commit(&cx).await);
        assert!(matches!(err, Error::NotLoaded { relation: "reviews", .. }));
        assert!(s.is_new(b2).unwrap());
        assert!(s.id(b2).unwrap().is_placeholder());
        assert_eq!(s.driver().stats().writes, 0);
        assert_eq!(
            s.driver().row(TaggedId::int("a", 1)).unwrap().get("reviewCount"),
            Value::from(7i64)
        );
    });
}

fn lineage_session() -> Session<MemoryDriver> {
    let metadata = Metadata::builder()
        .entity(
            EntityMetadata::new("Author", "a")
                .required("firstName")
                .many_to_one("mentor", "Author", Some("mentees"))
                .one_to_many("mentees", "Author", "mentor")
                .recursive("mentorChain", "mentor")
                .recursive("menteesTree", "mentees")
                .reactive_field(
                    "mentorDepth",
                    Hint::leaf("mentorChain"),
                    true,
                    Compute::new(|r, a| Ok(Value::from(r.collection(a, "mentorChain")?.len() as i64))),
                )
                .reactive_field(
                    "teamSize",
                    Hint::leaf("menteesTree"),
                    true,
                    Compute::new(|r, a| Ok(Value::from(r.collection(a, "menteesTree")?.len() as i64))),
                ),
        )
        .build()
        .unwrap();
    Session::new(MemoryDriver::new(), Arc::new(metadata)).unwrap()
}

#[test]
fn test_changes_deep_in_a_recursive_walk_reach_the_owner() {
    let s = lineage_session();
    let stored = [(1, None, 0, 2), (2, Some(1), 1, 1), (3, Some(2), 2, 0)];
    for (id, mentor, depth, team) in stored {
        s.driver().insert_row(
            author_row(id, &format!("a{id}"))
                .with_ref("mentor", mentor.map(|m| TaggedId::int("a", m)))
                .with("mentorDepth", depth as i64)
                .with("teamSize", team as i64),
        );
    }
    let cx = Cx::for_testing();
    let column = |s: &Session<MemoryDriver>, id: TaggedId, field: &str| s.driver().row(id).unwrap().get(field);

    run(async {
        // Only a1 is loaded; a2 and a3 are reached through the walk.
        let a1 = unwrap_outcome(s.load(&cx, TaggedId::int("a", 1)).await).unwrap();
        let a0 = s.create("Author", vec![("firstName", "a0".into())]).unwrap();
        s.set_reference(a1, "mentor", Some(a0)).unwrap();
        unwrap_outcome(s.commit(&cx).await);

        for (id, depth) in [(1, 1), (2, 2), (3, 3)] {
            assert_eq!(column(&s, TaggedId::int("a", id), "mentorDepth"), Value::from(depth as i64));
        }
        let a0_id = s.id(a0).unwrap().persisted().unwrap();
        assert_eq!(column(&s, a0_id, "teamSize"), Value::from(3i64));

        // Moving a3 up changes the tree of its old mentor two levels below a0.
        let a3 = s.lookup(TaggedId::int("a", 3)).unwrap();
        s.set_reference(a3, "mentor", Some(a1)).unwrap();
        unwrap_outcome(s.commit(&cx).await);
        assert_eq!(column(&s, TaggedId::int("a", 2), "teamSize"), Value::from(0i64));
        assert_eq!(column(&s, TaggedId::int("a", 1), "teamSize"), Value::from(2i64));
        assert_eq!(column(&s, TaggedId::int("a", 3), "mentorDepth"), Value::from(2i64));
        assert_eq!(column(&s, a0_id, "teamSize"), Value::from(3i64));
    });
}
