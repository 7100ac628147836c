//! Collections repository.
//!
//! # Responsibility
//! - Expose lookup, listing, upsert/delete and transaction scoping for
//!   collections on top of any [`CollectionStore`].
//! - Rebuild entities through the domain factory on every read.
//!
//! # Invariants
//! - The caller's transaction handle is forwarded to every store call.
//! - Not-found and unmappable rows both read as absence; storage errors are
//!   returned unchanged.
//! - `save` never re-validates: the entity was validated when it was built.
//! - No optimistic concurrency: the last save wins.

use crate::db::{DbError, DbResult};
use crate::model::collection::Collection;
use crate::repo::mapping::{collapse_mapping_failure, collection_to_record, row_to_collection};
use crate::store::{
    CollectionCriteria, CollectionListQuery, CollectionRow, CollectionStore, FindOptions,
};
use crate::telemetry::{ErrorReporter, NoopErrorReporter};
use log::debug;
use std::future::Future;
use std::sync::Arc;

const WITH_POSTS: FindOptions = FindOptions {
    require: false,
    with_posts: true,
};

const EXISTENCE_ONLY: FindOptions = FindOptions {
    require: false,
    with_posts: false,
};

/// Persistence entry point for collections.
pub struct CollectionsRepository<S: CollectionStore> {
    store: S,
    reporter: Arc<dyn ErrorReporter>,
}

impl<S: CollectionStore> CollectionsRepository<S> {
    /// Creates a repository that discards telemetry reports.
    pub fn new(store: S) -> Self {
        Self::with_reporter(store, Arc::new(NoopErrorReporter))
    }

    /// Creates a repository that reports recovered mapping failures to
    /// `reporter`.
    pub fn with_reporter(store: S, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { store, reporter }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs `work` in a store transaction and returns its result.
    ///
    /// `work` receives the handle and must pass it to every repository call
    /// it makes. An `Err` from `work` rolls the transaction back.
    pub async fn create_transaction<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(S::Tx) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Send,
    {
        self.store.transaction(work).await
    }

    /// Returns the collection with `id`, or `None` when it is missing or
    /// cannot be mapped.
    pub async fn get_by_id(&self, id: &str, tx: Option<&S::Tx>) -> DbResult<Option<Collection>> {
        let row = self
            .store
            .find_one(CollectionCriteria::Id(id), WITH_POSTS, tx)
            .await?;
        Ok(row.and_then(|row| self.map_row(&row)))
    }

    /// Same as [`Self::get_by_id`] keyed by slug; there is no id fallback.
    pub async fn get_by_slug(
        &self,
        slug: &str,
        tx: Option<&S::Tx>,
    ) -> DbResult<Option<Collection>> {
        let row = self
            .store
            .find_one(CollectionCriteria::Slug(slug), WITH_POSTS, tx)
            .await?;
        Ok(row.and_then(|row| self.map_row(&row)))
    }

    /// Lists collections matching `query` in store order, skipping rows that
    /// cannot be mapped.
    pub async fn get_all(
        &self,
        query: &CollectionListQuery,
        tx: Option<&S::Tx>,
    ) -> DbResult<Vec<Collection>> {
        let rows = self.store.find_all(query, true, tx).await?;
        let total = rows.len();
        let collections: Vec<Collection> =
            rows.iter().filter_map(|row| self.map_row(row)).collect();

        debug!(
            "event=collections_list module=repo status=ok rows={total} mapped={}",
            collections.len()
        );
        Ok(collections)
    }

    /// Deletes, inserts or updates the stored collection to match `collection`.
    ///
    /// - `is_deleted()` → delete by id, no existence check.
    /// - no row with the id → insert with ordered memberships.
    /// - existing row → overwrite scalars and replace memberships.
    pub async fn save(&self, collection: &Collection, tx: Option<&S::Tx>) -> DbResult<()> {
        if collection.is_deleted() {
            self.store.destroy(collection.id(), tx).await?;
            debug!(
                "event=collection_save module=repo status=ok action=delete id={}",
                collection.id()
            );
            return Ok(());
        }

        let record = collection_to_record(collection);
        let existing = self
            .store
            .find_one(CollectionCriteria::Id(&record.id), EXISTENCE_ONLY, tx)
            .await?;

        let action = match existing {
            None => {
                self.store.add(&record, tx).await?;
                "insert"
            }
            Some(_) => {
                self.store.edit(&record, &record.id, tx).await?;
                "update"
            }
        };

        debug!(
            "event=collection_save module=repo status=ok action={action} id={} posts={}",
            record.id,
            record.posts.len()
        );
        Ok(())
    }

    fn map_row(&self, row: &CollectionRow) -> Option<Collection> {
        collapse_mapping_failure(row_to_collection(row), self.reporter.as_ref())
    }
}
