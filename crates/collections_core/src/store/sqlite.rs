//! SQLite-backed collection store.
//!
//! # Responsibility
//! - Persist `collections` rows and their ordered `collections_posts` rows.
//! - Provide transaction scopes through [`SqliteTransaction`] handles.
//!
//! # Invariants
//! - A transaction scope owns the shared connection until it commits or rolls
//!   back; calls made during the scope without its handle wait at most
//!   `lock_timeout`, then fail with `DbError::ConnectionBusy`.
//! - A stored value of the wrong storage class flags its row instead of
//!   failing the query.
//! - A handle dropped before its scope finished rolls the transaction back.
//! - `add`/`edit` run inside a savepoint, so a failed membership write never
//!   leaves a half-updated collection behind.
//! - Membership rows are written with `sort_order` = position and read back in
//!   that order.

use super::{
    CollectionCriteria, CollectionListQuery, CollectionOrder, CollectionOrderField,
    CollectionPostRow, CollectionRecord, CollectionRow, CollectionStore, FindOptions,
    MembershipDescriptor, SortDirection,
};
use crate::db::{DbError, DbResult};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use uuid::Uuid;

const COLLECTION_SELECT_SQL: &str = "SELECT
    id,
    slug,
    title,
    description,
    type,
    filter,
    feature_image,
    created_at,
    updated_at
FROM collections";

const MEMBERSHIP_SELECT_SQL: &str = "SELECT
    id,
    collection_id,
    post_id,
    sort_order
FROM collections_posts
WHERE collection_id = ?1
ORDER BY sort_order ASC, rowid ASC";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Collection store over one shared SQLite connection.
///
/// The connection must come from [`crate::db::open_db`] (or the in-memory
/// variant) so that foreign keys and migrations are in place.
#[derive(Debug, Clone)]
pub struct SqliteCollectionStore {
    conn: Arc<Mutex<Connection>>,
    lock_timeout: Duration,
}

impl SqliteCollectionStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Bounds how long a call waits for the shared connection while a
    /// transaction scope holds it.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Runs `op` on the shared connection outside any transaction scope.
    ///
    /// Meant for maintenance and diagnostics; collection writes go through
    /// the [`CollectionStore`] operations.
    pub async fn with_connection<R>(
        &self,
        op: impl FnOnce(&Connection) -> DbResult<R>,
    ) -> DbResult<R> {
        let conn = self.acquire().await?;
        op(&*conn)
    }

    /// Takes the shared connection, waiting at most `lock_timeout`.
    ///
    /// A call made inside a transaction scope without its handle lands here
    /// and fails with `DbError::ConnectionBusy` instead of waiting forever.
    async fn acquire(&self) -> DbResult<OwnedMutexGuard<Connection>> {
        if let Ok(guard) = Arc::clone(&self.conn).try_lock_owned() {
            return Ok(guard);
        }

        warn!(
            "event=conn_wait module=store status=warn timeout_ms={} hint=pass_tx_handle",
            self.lock_timeout.as_millis()
        );
        let waited_ms = u64::try_from(self.lock_timeout.as_millis()).unwrap_or(u64::MAX);
        match timeout(self.lock_timeout, Arc::clone(&self.conn).lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                error!("event=conn_wait module=store status=error waited_ms={waited_ms}");
                Err(DbError::ConnectionBusy { waited_ms })
            }
        }
    }

    async fn with_conn<R, F>(&self, tx: Option<&SqliteTransaction>, op: F) -> DbResult<R>
    where
        F: FnOnce(&mut Connection) -> DbResult<R> + Send,
        R: Send,
    {
        if let Some(tx) = tx {
            return tx.run(op);
        }
        let mut conn = self.acquire().await?;
        op(&mut *conn)
    }
}

/// Handle to one open SQLite transaction.
///
/// Clones share the same transaction. Once the owning scope finishes, every
/// clone fails with [`DbError::TransactionClosed`].
#[derive(Clone)]
pub struct SqliteTransaction {
    state: Arc<TxState>,
}

struct TxState {
    id: Uuid,
    conn: StdMutex<Option<OwnedMutexGuard<Connection>>>,
}

impl SqliteTransaction {
    fn begin(guard: OwnedMutexGuard<Connection>) -> DbResult<Self> {
        guard.execute_batch("BEGIN IMMEDIATE;")?;
        let tx = Self {
            state: Arc::new(TxState {
                id: Uuid::new_v4(),
                conn: StdMutex::new(Some(guard)),
            }),
        };
        debug!("event=tx_begin module=store status=ok tx_id={}", tx.id());
        Ok(tx)
    }

    /// Identifier used in log lines for this transaction.
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    /// `false` once the scope committed or rolled back.
    pub fn is_open(&self) -> bool {
        self.state
            .conn
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    fn run<R>(&self, op: impl FnOnce(&mut Connection) -> DbResult<R>) -> DbResult<R> {
        let mut slot = self.state.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        let conn = slot
            .as_mut()
            .ok_or(DbError::TransactionClosed(self.state.id))?;
        op(&mut **conn)
    }

    fn take(&self) -> DbResult<OwnedMutexGuard<Connection>> {
        let mut slot = self.state.conn.lock().map_err(|_| DbError::LockPoisoned)?;
        slot.take().ok_or(DbError::TransactionClosed(self.state.id))
    }

    fn commit(&self) -> DbResult<()> {
        let guard = self.take()?;
        if let Err(err) = guard.execute_batch("COMMIT;") {
            // The connection outlives this scope; never hand it on mid-transaction.
            let _ = guard.execute_batch("ROLLBACK;");
            error!(
                "event=tx_commit module=store status=error tx_id={} error={err}",
                self.id()
            );
            return Err(err.into());
        }
        debug!("event=tx_commit module=store status=ok tx_id={}", self.id());
        Ok(())
    }

    fn rollback(&self) -> DbResult<()> {
        let guard = self.take()?;
        guard.execute_batch("ROLLBACK;")?;
        info!("event=tx_rollback module=store status=ok tx_id={}", self.id());
        Ok(())
    }
}

impl Debug for SqliteTransaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("id", &self.state.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for TxState {
    fn drop(&mut self) {
        let slot = match self.conn.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(guard) = slot.take() {
            match guard.execute_batch("ROLLBACK;") {
                Ok(()) => warn!(
                    "event=tx_rollback module=store status=ok tx_id={} reason=abandoned",
                    self.id
                ),
                Err(err) => error!(
                    "event=tx_rollback module=store status=error tx_id={} reason=abandoned error={err}",
                    self.id
                ),
            }
        }
    }
}

#[async_trait]
impl CollectionStore for SqliteCollectionStore {
    type Tx = SqliteTransaction;

    async fn find_one(
        &self,
        criteria: CollectionCriteria<'_>,
        options: FindOptions,
        tx: Option<&SqliteTransaction>,
    ) -> DbResult<Option<CollectionRow>> {
        let row = self
            .with_conn(tx, move |conn| load_one(conn, criteria, options.with_posts))
            .await?;

        match row {
            None if options.require => Err(DbError::NotFound(criteria.to_string())),
            row => Ok(row),
        }
    }

    async fn find_all(
        &self,
        query: &CollectionListQuery,
        with_posts: bool,
        tx: Option<&SqliteTransaction>,
    ) -> DbResult<Vec<CollectionRow>> {
        self.with_conn(tx, move |conn| load_all(conn, query, with_posts))
            .await
    }

    async fn add(
        &self,
        record: &CollectionRecord,
        tx: Option<&SqliteTransaction>,
    ) -> DbResult<CollectionRow> {
        let row = self
            .with_conn(tx, move |conn| {
                let sp = conn.savepoint()?;
                insert_collection(&sp, record)?;
                replace_memberships(&sp, &record.id, &record.posts)?;
                sp.commit()?;
                load_one(conn, CollectionCriteria::Id(&record.id), true)?
                    .ok_or_else(|| DbError::NotFound(record.id.clone()))
            })
            .await?;

        debug!(
            "event=collection_add module=store status=ok id={} posts={}",
            row.id,
            row.collection_posts.len()
        );
        Ok(row)
    }

    async fn edit(
        &self,
        record: &CollectionRecord,
        id: &str,
        tx: Option<&SqliteTransaction>,
    ) -> DbResult<CollectionRow> {
        let row = self
            .with_conn(tx, move |conn| {
                let sp = conn.savepoint()?;
                if update_collection(&sp, record, id)? == 0 {
                    return Err(DbError::NotFound(id.to_string()));
                }
                replace_memberships(&sp, id, &record.posts)?;
                sp.commit()?;
                load_one(conn, CollectionCriteria::Id(id), true)?
                    .ok_or_else(|| DbError::NotFound(id.to_string()))
            })
            .await?;

        debug!(
            "event=collection_edit module=store status=ok id={} posts={}",
            row.id,
            row.collection_posts.len()
        );
        Ok(row)
    }

    async fn destroy(&self, id: &str, tx: Option<&SqliteTransaction>) -> DbResult<()> {
        let removed = self
            .with_conn(tx, move |conn| {
                Ok(conn.execute("DELETE FROM collections WHERE id = ?1;", [id])?)
            })
            .await?;

        debug!("event=collection_destroy module=store status=ok id={id} removed={removed}");
        Ok(())
    }

    async fn transaction<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(Self::Tx) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Send,
    {
        let guard = self.acquire().await?;
        let tx = SqliteTransaction::begin(guard)?;

        match work(tx.clone()).await {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    error!(
                        "event=tx_rollback module=store status=error tx_id={} error={rollback_err}",
                        tx.id()
                    );
                }
                Err(err)
            }
        }
    }
}

fn load_one(
    conn: &Connection,
    criteria: CollectionCriteria<'_>,
    with_posts: bool,
) -> DbResult<Option<CollectionRow>> {
    let (sql, key) = match criteria {
        CollectionCriteria::Id(id) => (format!("{COLLECTION_SELECT_SQL} WHERE id = ?1;"), id),
        CollectionCriteria::Slug(slug) => {
            (format!("{COLLECTION_SELECT_SQL} WHERE slug = ?1;"), slug)
        }
    };

    let row = conn
        .query_row(&sql, [key], parse_collection_row)
        .optional()?;

    match row {
        Some(mut row) => {
            if with_posts {
                attach_memberships(conn, &mut row)?;
            }
            Ok(Some(row))
        }
        None => Ok(None),
    }
}

fn load_all(
    conn: &Connection,
    query: &CollectionListQuery,
    with_posts: bool,
) -> DbResult<Vec<CollectionRow>> {
    let mut sql = format!("{COLLECTION_SELECT_SQL} WHERE 1 = 1");
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(kind) = query.kind {
        sql.push_str(" AND type = ?");
        bind_values.push(Value::Text(kind.as_str().to_string()));
    }

    sql.push_str(&order_clause(query.order));

    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        bind_values.push(Value::Integer(i64::from(limit)));
        if query.offset > 0 {
            sql.push_str(" OFFSET ?");
            bind_values.push(Value::Integer(i64::from(query.offset)));
        }
    } else if query.offset > 0 {
        sql.push_str(" LIMIT -1 OFFSET ?");
        bind_values.push(Value::Integer(i64::from(query.offset)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    let mut collections = Vec::new();
    while let Some(row) = rows.next()? {
        collections.push(parse_collection_row(row)?);
    }

    if with_posts {
        for collection in &mut collections {
            attach_memberships(conn, collection)?;
        }
    }

    Ok(collections)
}

fn order_clause(order: Option<CollectionOrder>) -> String {
    let Some(order) = order else {
        return " ORDER BY rowid ASC".to_string();
    };
    let column = match order.field {
        CollectionOrderField::CreatedAt => "created_at",
        CollectionOrderField::UpdatedAt => "updated_at",
        CollectionOrderField::Title => "title",
        CollectionOrderField::Slug => "slug",
    };
    let direction = match order.direction {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
    };
    format!(" ORDER BY {column} {direction}, rowid ASC")
}

/// Loads the ordered membership rows of `row`.
///
/// A membership value of the wrong storage class marks the parent row
/// undecodable rather than failing the load.
fn attach_memberships(conn: &Connection, row: &mut CollectionRow) -> DbResult<()> {
    let mut stmt = conn.prepare_cached(MEMBERSHIP_SELECT_SQL)?;
    let mut rows = stmt.query([row.id.as_str()])?;
    let mut undecodable = None;
    let mut memberships = Vec::new();

    while let Some(member) = rows.next()? {
        let sort_order = match member.get::<_, Value>("sort_order")? {
            Value::Integer(sort_order) => sort_order,
            _ => {
                undecodable = undecodable.or(Some("collections_posts.sort_order"));
                0
            }
        };
        memberships.push(CollectionPostRow {
            id: decode_text(member.get("id")?, "collections_posts.id", &mut undecodable)
                .unwrap_or_default(),
            collection_id: decode_text(
                member.get("collection_id")?,
                "collections_posts.collection_id",
                &mut undecodable,
            )
            .unwrap_or_default(),
            post_id: decode_text(
                member.get("post_id")?,
                "collections_posts.post_id",
                &mut undecodable,
            )
            .unwrap_or_default(),
            sort_order,
        });
    }

    row.collection_posts = memberships;
    row.undecodable_column = row.undecodable_column.or(undecodable);
    Ok(())
}

fn insert_collection(conn: &Connection, record: &CollectionRecord) -> DbResult<()> {
    conn.execute(
        "INSERT INTO collections (
            id,
            slug,
            title,
            description,
            type,
            filter,
            feature_image,
            created_at,
            updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
        params![
            record.id,
            record.slug,
            record.title,
            record.description,
            record.kind.as_str(),
            record.filter,
            record.feature_image,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

/// Returns the number of rows changed (0 when `id` does not exist).
fn update_collection(conn: &Connection, record: &CollectionRecord, id: &str) -> DbResult<usize> {
    let changed = conn.execute(
        "UPDATE collections
         SET
            slug = ?2,
            title = ?3,
            description = ?4,
            type = ?5,
            filter = ?6,
            feature_image = ?7,
            created_at = ?8,
            updated_at = ?9
         WHERE id = ?1;",
        params![
            id,
            record.slug,
            record.title,
            record.description,
            record.kind.as_str(),
            record.filter,
            record.feature_image,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(changed)
}

/// Full replace: old membership rows are removed, new ones written in order.
fn replace_memberships(
    conn: &Connection,
    collection_id: &str,
    posts: &[MembershipDescriptor],
) -> DbResult<()> {
    conn.execute(
        "DELETE FROM collections_posts WHERE collection_id = ?1;",
        [collection_id],
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO collections_posts (id, collection_id, post_id, sort_order)
         VALUES (?1, ?2, ?3, ?4);",
    )?;
    for (position, membership) in posts.iter().enumerate() {
        let sort_order = i64::try_from(position).unwrap_or(i64::MAX);
        stmt.execute(params![
            Uuid::new_v4().simple().to_string(),
            collection_id,
            membership.post_id,
            sort_order,
        ])?;
    }
    Ok(())
}

fn parse_collection_row(row: &Row<'_>) -> rusqlite::Result<CollectionRow> {
    let mut undecodable = None;
    let id = decode_text(row.get("id")?, "id", &mut undecodable).unwrap_or_default();
    let filter = match row.get::<_, Value>("filter")? {
        Value::Text(filter) => Some(filter),
        Value::Null => None,
        other => {
            warn!(
                "event=collection_load module=store status=warn id={id} error_code=non_text_filter type={:?}",
                other.data_type()
            );
            None
        }
    };

    Ok(CollectionRow {
        slug: decode_text(row.get("slug")?, "slug", &mut undecodable).unwrap_or_default(),
        title: decode_text(row.get("title")?, "title", &mut undecodable),
        description: decode_text(row.get("description")?, "description", &mut undecodable),
        filter,
        kind: decode_text(row.get("type")?, "type", &mut undecodable).unwrap_or_default(),
        feature_image: decode_text(row.get("feature_image")?, "feature_image", &mut undecodable),
        created_at: decode_text(row.get("created_at")?, "created_at", &mut undecodable)
            .unwrap_or_default(),
        updated_at: decode_text(row.get("updated_at")?, "updated_at", &mut undecodable)
            .unwrap_or_default(),
        collection_posts: Vec::new(),
        undecodable_column: undecodable,
        id,
    })
}

/// Text stays text; any other storage class is flagged under `column` and
/// rendered so the mapper can reject the row instead of the query failing.
fn decode_text(
    value: Value,
    column: &'static str,
    undecodable: &mut Option<&'static str>,
) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(text) => Some(text),
        other => {
            *undecodable = undecodable.or(Some(column));
            Some(render_value(other))
        }
    }
}

fn render_value(value: Value) -> String {
    match value {
        Value::Text(text) => text,
        Value::Integer(number) => number.to_string(),
        Value::Real(number) => number.to_string(),
        Value::Null => String::new(),
        Value::Blob(bytes) => format!("<blob:{}>", bytes.len()),
    }
}
