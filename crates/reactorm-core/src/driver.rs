//! The store driver contract.
//!
//! Every async operation takes a `Cx` for cancellation and returns an
//! `Outcome`, as in the rest of the crate family. The session never assumes a
//! SQL dialect; drivers translate filters and batches however they like.

use crate::error::Error;
use crate::filter::{Filter, FindOptions};
use crate::id::TaggedId;
use crate::metadata::EntityMetadata;
use crate::row::Row;
use crate::write::{LinkRow, WriteBatch};
use asupersync::{Cx, Outcome};
use std::future::Future;

/// A store the session reads rows from and writes batches to.
pub trait Driver: Send + Sync {
    /// Rows of `meta` matching `filter`.
    fn find(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        filter: &Filter,
        options: &FindOptions,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Rows of `meta` with the given ids. Missing ids are simply absent.
    fn load_by_ids(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        ids: &[TaggedId],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Join rows of `table` whose `column` holds one of `ids`.
    fn find_links(
        &self,
        cx: &Cx,
        table: &'static str,
        column: &'static str,
        ids: &[TaggedId],
    ) -> impl Future<Output = Outcome<Vec<LinkRow>, Error>> + Send;

    /// Reserve `count` permanent ids for new entities of `meta`.
    fn assign_ids(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        count: usize,
    ) -> impl Future<Output = Outcome<Vec<TaggedId>, Error>> + Send;

    /// Apply a batch inside one transaction: all of it or none of it.
    fn execute_write(
        &self,
        cx: &Cx,
        batch: &WriteBatch,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;
}
