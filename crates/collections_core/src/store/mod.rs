//! Storage accessor contract for collections.
//!
//! # Responsibility
//! - Define the row/record shapes exchanged with a storage engine.
//! - Define the async `CollectionStore` operations the repository consumes.
//!
//! # Invariants
//! - Every operation takes the caller's transaction handle and must run inside
//!   it when one is given.
//! - Membership rows are returned in stored order (`sort_order`, then creation).
//! - Stores never validate collections; they only persist and load shapes.

use crate::db::{DbError, DbResult};
use crate::model::collection::{CollectionType, PostId};
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::str::FromStr;
use thiserror::Error;

pub mod sqlite;

/// Raw `collections` row plus its membership rows, as stored.
///
/// Text columns are passed through unparsed; turning them into a valid
/// entity is the mapper's job. A value of the wrong storage class never fails
/// the load, it is flagged in `undecodable_column` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRow {
    pub id: String,
    pub slug: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// `None` when the column is NULL or not text.
    pub filter: Option<String>,
    pub kind: String,
    pub feature_image: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Empty unless loaded with `with_posts`.
    pub collection_posts: Vec<CollectionPostRow>,
    /// First column (of this row or its memberships) whose stored value is
    /// not text. The offending value is rendered into the field as-is.
    pub undecodable_column: Option<&'static str>,
}

/// One `collections_posts` membership row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPostRow {
    pub id: String,
    pub collection_id: String,
    pub post_id: PostId,
    pub sort_order: i64,
}

/// Flattened entity ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRecord {
    pub id: String,
    pub slug: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub filter: Option<String>,
    pub kind: CollectionType,
    pub feature_image: Option<String>,
    /// Desired membership, in display order.
    pub posts: Vec<MembershipDescriptor>,
    pub created_at: String,
    pub updated_at: String,
}

/// Desired membership row; its position in `CollectionRecord::posts` is its
/// ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipDescriptor {
    pub post_id: PostId,
}

/// Single-row lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionCriteria<'a> {
    Id(&'a str),
    Slug(&'a str),
}

impl Display for CollectionCriteria<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id={id}"),
            Self::Slug(slug) => write!(f, "slug={slug}"),
        }
    }
}

/// Options for [`CollectionStore::find_one`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Turn a miss into `DbError::NotFound` instead of `Ok(None)`.
    pub require: bool,
    /// Load membership rows.
    pub with_posts: bool,
}

/// Sortable collection columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOrderField {
    CreatedAt,
    UpdatedAt,
    Title,
    Slug,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Ordering for list queries, parseable from strings like `"created_at desc"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionOrder {
    pub field: CollectionOrderField,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid collection order `{0}`")]
pub struct ParseOrderError(pub String);

impl FromStr for CollectionOrder {
    type Err = ParseOrderError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.split_whitespace();
        let field = match parts.next() {
            Some("created_at") => CollectionOrderField::CreatedAt,
            Some("updated_at") => CollectionOrderField::UpdatedAt,
            Some("title") => CollectionOrderField::Title,
            Some("slug") => CollectionOrderField::Slug,
            _ => return Err(ParseOrderError(raw.to_string())),
        };
        let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("asc") => SortDirection::Asc,
            Some("desc") => SortDirection::Desc,
            Some(_) => return Err(ParseOrderError(raw.to_string())),
        };
        if parts.next().is_some() {
            return Err(ParseOrderError(raw.to_string()));
        }
        Ok(Self { field, direction })
    }
}

/// List criteria passed through the repository to the store untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionListQuery {
    pub kind: Option<CollectionType>,
    /// Insertion order when `None`.
    pub order: Option<CollectionOrder>,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Async storage accessor for collections and their membership rows.
///
/// `Tx` is the engine's transaction handle. It is handed to the unit of work
/// by [`CollectionStore::transaction`] and must be passed back to every call
/// that belongs to that unit of work.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    type Tx: Send + Sync;

    async fn find_one(
        &self,
        criteria: CollectionCriteria<'_>,
        options: FindOptions,
        tx: Option<&Self::Tx>,
    ) -> DbResult<Option<CollectionRow>>;

    async fn find_all(
        &self,
        query: &CollectionListQuery,
        with_posts: bool,
        tx: Option<&Self::Tx>,
    ) -> DbResult<Vec<CollectionRow>>;

    /// Inserts the row and its ordered membership rows.
    async fn add(&self, record: &CollectionRecord, tx: Option<&Self::Tx>)
        -> DbResult<CollectionRow>;

    /// Overwrites scalar columns of row `id` and replaces its membership set.
    ///
    /// Fails with `DbError::NotFound` when no row has that id.
    async fn edit(
        &self,
        record: &CollectionRecord,
        id: &str,
        tx: Option<&Self::Tx>,
    ) -> DbResult<CollectionRow>;

    /// Deletes row `id` and, by cascade, its memberships. Missing ids are fine.
    async fn destroy(&self, id: &str, tx: Option<&Self::Tx>) -> DbResult<()>;

    /// Runs `work` inside a new transaction: commit on `Ok`, rollback on `Err`.
    async fn transaction<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(Self::Tx) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Send;
}
