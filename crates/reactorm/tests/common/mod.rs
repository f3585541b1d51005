#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use reactorm::prelude::*;
use reactorm::{Compute, SessionConfig};
use std::future::Future;
use std::pin::pin;
use std::task::Poll;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

/// Run a test body on a fresh current-thread runtime.
pub fn run(body: impl Future<Output = ()>) {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(body);
}

/// Poll two futures on the same task until both finish.
pub async fn join<A: Future, B: Future>(a: A, b: B) -> (A::Output, B::Output) {
    let mut a = pin!(a);
    let mut b = pin!(b);
    let mut ra = None;
    let mut rb = None;
    std::future::poll_fn(|task_cx| {
        if ra.is_none() {
            if let Poll::Ready(v) = a.as_mut().poll(task_cx) {
                ra = Some(v);
            }
        }
        if rb.is_none() {
            if let Poll::Ready(v) = b.as_mut().poll(task_cx) {
                rb = Some(v);
            }
        }
        if ra.is_some() && rb.is_some() {
            Poll::Ready((ra.take().unwrap(), rb.take().unwrap()))
        } else {
            Poll::Pending
        }
    })
    .await
}

fn number_of_books() -> Compute<Value> {
    Compute::new(|r, a| Ok(Value::from(r.collection(a, "books")?.len() as i64)))
}

/// The book with the best-rated review.
fn favorite_book() -> Compute<Option<EntityRef>> {
    Compute::new(|r, a| {
        let mut best: Option<(EntityRef, i64)> = None;
        for book in r.collection(a, "books")? {
            for review in r.collection(book, "reviews")? {
                let rating = r.get(review, "rating")?.as_i64().unwrap_or(0);
                if best.is_none_or(|(_, top)| rating > top) {
                    best = Some((book, rating));
                }
            }
        }
        Ok(best.map(|(book, _)| book))
    })
}

fn parent_label() -> Compute<Value> {
    Compute::new(|r, c| match r.reference(c, "parent")? {
        Some(p) if r.entity_type(p)? == "Book" => r.get(p, "title"),
        Some(p) => r.get(p, "firstName"),
        None => Ok(Value::Null),
    })
}

/// Authors, books, reviews, tags and comments.
pub fn metadata() -> Arc<Metadata> {
    let metadata = Metadata::builder()
        .entity(
            EntityMetadata::new("Author", "a")
                .required("firstName")
                .primitive("lastName")
                .primitive("email")
                .many_to_one("mentor", "Author", Some("mentees"))
                .one_to_many("mentees", "Author", "mentor")
                .recursive("mentorChain", "mentor")
                .recursive("menteesTree", "mentees")
                .one_to_many("books", "Book", "author")
                .one_to_many("comments", "Comment", "parent")
                .many_to_many("tags", "Tag", "authors_to_tags", ("author_id", "tag_id"), Some("authors"))
                .reactive_field("numberOfBooks", Hint::leaf("books"), true, number_of_books())
                .reactive_reference(
                    "favoriteBook",
                    "Book",
                    Hint::node([("books", Hint::leaf("reviews"))]),
                    favorite_book(),
                )
                .timestamps("createdAt", "updatedAt")
                .rule(ValidationRule::pattern("email", r"^[^@\s]+@[^@\s]+$").unwrap()),
        )
        .entity(
            EntityMetadata::new("Book", "b")
                .required("title")
                .required_many_to_one("author", "Author", Some("books"))
                .one_to_many("reviews", "BookReview", "book")
                .one_to_many("comments", "Comment", "parent")
                .soft_delete("deletedAt")
                .rule(ValidationRule::max_length("title", 40)),
        )
        .entity(
            EntityMetadata::new("BookReview", "br")
                .required("rating")
                .required_many_to_one("book", "Book", Some("reviews")),
        )
        .entity(
            EntityMetadata::new("Tag", "t")
                .required("name")
                .many_to_many("authors", "Author", "authors_to_tags", ("tag_id", "author_id"), Some("tags")),
        )
        .entity(
            EntityMetadata::new("Comment", "c")
                .primitive("text")
                .polymorphic("parent", &["Author", "Book"], Some("comments"))
                .reactive_field(
                    "parentLabel",
                    Hint::node([("parent", Hint::list(["title", "firstName"]))]),
                    true,
                    parent_label(),
                ),
        )
        .build()
        .unwrap();
    Arc::new(metadata)
}

pub fn session() -> Session<MemoryDriver> {
    Session::new(MemoryDriver::new(), metadata()).unwrap()
}

pub fn session_with(config: SessionConfig) -> Session<MemoryDriver> {
    Session::with_config(MemoryDriver::new(), metadata(), config).unwrap()
}

pub fn author_row(id: i64, first_name: &str) -> Row {
    Row::new(TaggedId::int("a", id)).with("firstName", first_name)
}

pub fn book_row(id: i64, title: &str, author: i64) -> Row {
    Row::new(TaggedId::int("b", id))
        .with("title", title)
        .with_ref("author", Some(TaggedId::int("a", author)))
}
