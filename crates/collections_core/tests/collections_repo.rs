use chrono::{DateTime, TimeZone, Utc};
use collections_core::db::open_db_in_memory;
use collections_core::{
    open_store, BufferedErrorReporter, Collection, CollectionEdit, CollectionListQuery,
    CollectionProps, CollectionType, CollectionsRepository, DatabaseConfig, DbError,
    SqliteCollectionStore, SqliteTransaction,
};
use std::sync::Arc;
use std::time::Duration;

const INSERT_RAW_SQL: &str = "INSERT INTO collections (
    id, slug, title, description, type, filter, feature_image, created_at, updated_at
) VALUES (?1, ?2, NULL, NULL, ?3, ?4, NULL, ?5, ?5);";

fn store() -> SqliteCollectionStore {
    SqliteCollectionStore::new(open_db_in_memory().unwrap())
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
}

fn manual(id: &str, slug: &str, posts: &[&str]) -> Collection {
    Collection::create(CollectionProps {
        id: Some(id.to_string()),
        slug: slug.to_string(),
        title: Some(format!("{slug} title")),
        kind: Some("manual".to_string()),
        posts: posts.iter().map(|post| post.to_string()).collect(),
        created_at: Some(at(8)),
        updated_at: Some(at(9)),
        ..CollectionProps::default()
    })
    .unwrap()
}

async fn count_rows(store: &SqliteCollectionStore, table: &str) -> i64 {
    store
        .with_connection(|conn| {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
                row.get(0)
            })?)
        })
        .await
        .unwrap()
}

async fn insert_raw(
    store: &SqliteCollectionStore,
    id: &str,
    slug: &str,
    kind: &str,
    filter: Option<&str>,
    timestamp: &str,
) {
    store
        .with_connection(|conn| {
            conn.execute(
                INSERT_RAW_SQL,
                rusqlite::params![id, slug, kind, filter, timestamp],
            )?;
            Ok(())
        })
        .await
        .unwrap();
}

const VALID_TS: &str = "2024-03-01T09:30:00.000000000Z";

#[tokio::test]
async fn save_then_get_by_id_round_trips_every_field() {
    let repo = CollectionsRepository::new(store());
    let collection = Collection::create(CollectionProps {
        id: Some("c1".to_string()),
        slug: "editors-picks".to_string(),
        title: Some("Editor's picks".to_string()),
        description: Some("Hand-picked by the desk".to_string()),
        filter: Some("tag:news+featured:true".to_string()),
        kind: Some("automatic".to_string()),
        feature_image: Some("/content/images/picks.png".to_string()),
        posts: vec!["p3".to_string(), "p1".to_string(), "p2".to_string()],
        created_at: Some(Utc.timestamp_opt(1_714_550_400, 123_456_789).unwrap()),
        updated_at: Some(Utc.timestamp_opt(1_714_554_000, 987_654_321).unwrap()),
        ..CollectionProps::default()
    })
    .unwrap();

    repo.save(&collection, None).await.unwrap();

    let by_id = repo.get_by_id("c1", None).await.unwrap().unwrap();
    assert_eq!(by_id, collection);
    assert_eq!(by_id.posts(), ["p3", "p1", "p2"]);

    let by_slug = repo.get_by_slug("editors-picks", None).await.unwrap().unwrap();
    assert_eq!(by_slug, collection);
}

#[tokio::test]
async fn lookups_miss_without_fallback() {
    let repo = CollectionsRepository::new(store());
    repo.save(&manual("c1", "picks", &[]), None).await.unwrap();

    assert!(repo.get_by_id("missing", None).await.unwrap().is_none());
    assert!(repo.get_by_slug("c1", None).await.unwrap().is_none());
    assert!(repo.get_by_id("picks", None).await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_twice_is_harmless_and_removes_memberships() {
    let repo = CollectionsRepository::new(store());
    let mut collection = manual("c1", "picks", &["p1", "p2"]);
    repo.save(&collection, None).await.unwrap();
    assert_eq!(count_rows(repo.store(), "collections_posts").await, 2);

    collection.mark_deleted().unwrap();
    repo.save(&collection, None).await.unwrap();
    repo.save(&collection, None).await.unwrap();

    assert!(repo.get_by_id("c1", None).await.unwrap().is_none());
    assert_eq!(count_rows(repo.store(), "collections").await, 0);
    assert_eq!(count_rows(repo.store(), "collections_posts").await, 0);
}

#[tokio::test]
async fn deleting_unsaved_collection_is_a_no_op() {
    let repo = CollectionsRepository::new(store());
    let mut collection = manual("never-saved", "ghost", &[]);
    collection.mark_deleted().unwrap();

    repo.save(&collection, None).await.unwrap();
    assert_eq!(count_rows(repo.store(), "collections").await, 0);
}

#[tokio::test]
async fn save_inserts_once_then_updates_in_place() {
    let repo = CollectionsRepository::new(store());
    let mut collection = manual("c1", "picks", &["p1", "p2", "p3"]);

    assert_eq!(count_rows(repo.store(), "collections").await, 0);
    repo.save(&collection, None).await.unwrap();
    assert_eq!(count_rows(repo.store(), "collections").await, 1);

    collection
        .edit(CollectionEdit {
            title: Some(Some("Renamed".to_string())),
            description: Some(Some("Now with a description".to_string())),
            ..CollectionEdit::default()
        })
        .unwrap();
    collection.remove_post("p2");
    collection.add_post("p9", Some(0));
    repo.save(&collection, None).await.unwrap();

    assert_eq!(count_rows(repo.store(), "collections").await, 1);
    assert_eq!(count_rows(repo.store(), "collections_posts").await, 3);

    let loaded = repo.get_by_id("c1", None).await.unwrap().unwrap();
    assert_eq!(loaded.title(), Some("Renamed"));
    assert_eq!(loaded.description(), Some("Now with a description"));
    assert_eq!(loaded.posts(), ["p9", "p1", "p3"]);
    assert_eq!(loaded, collection);
}

#[tokio::test]
async fn clearing_posts_removes_every_membership_row() {
    let repo = CollectionsRepository::new(store());
    let mut collection = manual("c1", "picks", &["p1", "p2"]);
    repo.save(&collection, None).await.unwrap();

    collection.remove_all_posts();
    repo.save(&collection, None).await.unwrap();

    assert_eq!(count_rows(repo.store(), "collections_posts").await, 0);
    let loaded = repo.get_by_id("c1", None).await.unwrap().unwrap();
    assert!(loaded.posts().is_empty());
}

#[tokio::test]
async fn null_filter_is_normalized_only_for_automatic_rows() {
    let repo = CollectionsRepository::new(store());
    insert_raw(repo.store(), "c1", "vip", "automatic", None, VALID_TS).await;
    insert_raw(repo.store(), "c2", "staff", "manual", None, VALID_TS).await;

    let vip = repo.get_by_slug("vip", None).await.unwrap().unwrap();
    assert_eq!(vip.id(), "c1");
    assert_eq!(vip.kind(), CollectionType::Automatic);
    assert_eq!(vip.filter(), Some(""));
    assert_eq!(vip.feature_image(), None);
    assert!(vip.posts().is_empty());

    let staff = repo.get_by_slug("staff", None).await.unwrap().unwrap();
    assert_eq!(staff.kind(), CollectionType::Manual);
    assert_eq!(staff.filter(), None);
}

#[tokio::test]
async fn blob_filter_column_is_treated_as_missing() {
    let repo = CollectionsRepository::new(store());
    insert_raw(repo.store(), "c1", "vip", "automatic", None, VALID_TS).await;
    repo.store()
        .with_connection(|conn| {
            conn.execute("UPDATE collections SET filter = X'2A' WHERE id = 'c1';", [])?;
            Ok(())
        })
        .await
        .unwrap();

    let vip = repo.get_by_id("c1", None).await.unwrap().unwrap();
    assert_eq!(vip.filter(), Some(""));
}

#[tokio::test]
async fn get_all_skips_unmappable_rows_and_reports_them() {
    let reporter = Arc::new(BufferedErrorReporter::new());
    let repo = CollectionsRepository::with_reporter(store(), reporter.clone());

    repo.save(&manual("c1", "first", &["p1"]), None).await.unwrap();
    insert_raw(repo.store(), "bad", "broken", "smart", None, VALID_TS).await;
    repo.save(&manual("c3", "third", &[]), None).await.unwrap();

    let all = repo
        .get_all(&CollectionListQuery::default(), None)
        .await
        .unwrap();

    let ids: Vec<&str> = all.iter().map(Collection::id).collect();
    assert_eq!(ids, ["c1", "c3"]);
    assert_eq!(all[0].posts(), ["p1"]);
    assert_eq!(reporter.len(), 1);
}

#[tokio::test]
async fn blob_in_text_column_is_skipped_not_fatal() {
    let reporter = Arc::new(BufferedErrorReporter::new());
    let repo = CollectionsRepository::with_reporter(store(), reporter.clone());

    repo.save(&manual("a", "first", &[]), None).await.unwrap();
    repo.save(&manual("b", "second", &["p1"]), None).await.unwrap();
    repo.save(&manual("c", "third", &[]), None).await.unwrap();
    repo.store()
        .with_connection(|conn| {
            conn.execute("UPDATE collections SET title = X'00FF' WHERE id = 'b';", [])?;
            Ok(())
        })
        .await
        .unwrap();

    let all = repo
        .get_all(&CollectionListQuery::default(), None)
        .await
        .unwrap();
    let ids: Vec<&str> = all.iter().map(Collection::id).collect();
    assert_eq!(ids, ["a", "c"]);

    assert!(repo.get_by_id("b", None).await.unwrap().is_none());
    assert_eq!(reporter.len(), 2);
    assert!(reporter.drain()[0].contains("`title`"));
}

#[tokio::test]
async fn blob_in_membership_row_is_skipped_not_fatal() {
    let reporter = Arc::new(BufferedErrorReporter::new());
    let repo = CollectionsRepository::with_reporter(store(), reporter.clone());

    repo.save(&manual("a", "first", &["p1", "p2"]), None).await.unwrap();
    repo.store()
        .with_connection(|conn| {
            conn.execute(
                "UPDATE collections_posts SET post_id = X'01' WHERE post_id = 'p2';",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

    assert!(repo.get_by_slug("first", None).await.unwrap().is_none());
    assert_eq!(reporter.len(), 1);
}

#[tokio::test]
async fn unmappable_row_reads_as_absent() {
    let reporter = Arc::new(BufferedErrorReporter::new());
    let repo = CollectionsRepository::with_reporter(store(), reporter.clone());
    insert_raw(repo.store(), "c1", "broken", "manual", None, "not-a-timestamp").await;

    assert!(repo.get_by_id("c1", None).await.unwrap().is_none());
    assert!(repo.get_by_slug("broken", None).await.unwrap().is_none());
    assert_eq!(reporter.len(), 2);
    assert!(reporter.drain()[0].contains("not-a-timestamp"));
}

#[tokio::test]
async fn get_all_passes_query_to_store() {
    let repo = CollectionsRepository::new(store());
    repo.save(&manual("c1", "older", &[]), None).await.unwrap();
    repo.save(
        &Collection::create(CollectionProps {
            id: Some("c2".to_string()),
            slug: "newer".to_string(),
            kind: Some("automatic".to_string()),
            filter: Some("featured:true".to_string()),
            created_at: Some(at(12)),
            updated_at: Some(at(12)),
            ..CollectionProps::default()
        })
        .unwrap(),
        None,
    )
    .await
    .unwrap();
    repo.save(&manual("c3", "middle", &[]), None).await.unwrap();

    let newest_first = repo
        .get_all(
            &CollectionListQuery {
                order: Some("created_at desc".parse().unwrap()),
                ..CollectionListQuery::default()
            },
            None,
        )
        .await
        .unwrap();
    let ids: Vec<&str> = newest_first.iter().map(Collection::id).collect();
    assert_eq!(ids, ["c2", "c1", "c3"]);

    let manual_only = repo
        .get_all(
            &CollectionListQuery {
                kind: Some(CollectionType::Manual),
                limit: Some(1),
                offset: 1,
                ..CollectionListQuery::default()
            },
            None,
        )
        .await
        .unwrap();
    let ids: Vec<&str> = manual_only.iter().map(Collection::id).collect();
    assert_eq!(ids, ["c3"]);
}

#[tokio::test]
async fn transaction_commits_all_saves_on_success() {
    let repo = CollectionsRepository::new(store());
    let first = manual("c1", "first", &["p1"]);
    let second = manual("c2", "second", &["p2"]);

    let repo_ref = &repo;
    let (first_ref, second_ref) = (&first, &second);
    let seen = repo
        .create_transaction(move |tx: SqliteTransaction| async move {
            repo_ref.save(first_ref, Some(&tx)).await?;
            repo_ref.save(second_ref, Some(&tx)).await?;
            let inside = repo_ref
                .get_all(&CollectionListQuery::default(), Some(&tx))
                .await?;
            Ok::<_, DbError>(inside.len())
        })
        .await
        .unwrap();

    assert_eq!(seen, 2);
    assert_eq!(repo.get_by_id("c1", None).await.unwrap(), Some(first));
    assert_eq!(repo.get_by_id("c2", None).await.unwrap(), Some(second));
}

#[derive(Debug)]
enum PublishError {
    Db(DbError),
    Rejected,
}

impl From<DbError> for PublishError {
    fn from(err: DbError) -> Self {
        Self::Db(err)
    }
}

#[tokio::test]
async fn transaction_rolls_back_when_work_fails() {
    let repo = CollectionsRepository::new(store());
    repo.save(&manual("c0", "existing", &["p1"]), None).await.unwrap();

    let repo_ref = &repo;
    let outcome: Result<(), PublishError> = repo
        .create_transaction(move |tx| async move {
            repo_ref.save(&manual("c1", "first", &[]), Some(&tx)).await?;
            let mut existing = manual("c0", "existing", &["p1"]);
            existing.mark_deleted().map_err(|_| PublishError::Rejected)?;
            repo_ref.save(&existing, Some(&tx)).await?;
            assert!(repo_ref.get_by_id("c1", Some(&tx)).await?.is_some());
            Err(PublishError::Rejected)
        })
        .await;

    assert!(matches!(outcome, Err(PublishError::Rejected)));
    assert!(repo.get_by_id("c1", None).await.unwrap().is_none());
    let restored = repo.get_by_id("c0", None).await.unwrap().unwrap();
    assert_eq!(restored.posts(), ["p1"]);
}

#[tokio::test]
async fn storage_error_inside_transaction_rolls_back_and_propagates() {
    let repo = CollectionsRepository::new(store());

    let repo_ref = &repo;
    let outcome = repo
        .create_transaction(move |tx| async move {
            repo_ref.save(&manual("c1", "picks", &[]), Some(&tx)).await?;
            // Same slug, different id: violates the unique slug column.
            repo_ref.save(&manual("c2", "picks", &[]), Some(&tx)).await?;
            Ok::<_, DbError>(())
        })
        .await;

    assert!(matches!(outcome, Err(DbError::Sqlite(_))));
    assert_eq!(count_rows(repo.store(), "collections").await, 0);
}

#[tokio::test]
async fn handle_is_unusable_after_its_scope_ends() {
    let repo = CollectionsRepository::new(store());

    let leaked = repo
        .create_transaction(|tx| async move { Ok::<_, DbError>(tx) })
        .await
        .unwrap();

    assert!(!leaked.is_open());
    let err = repo.get_by_id("c1", Some(&leaked)).await.unwrap_err();
    assert!(matches!(err, DbError::TransactionClosed(id) if id == leaked.id()));

    // The shared connection was released when the scope ended.
    repo.save(&manual("c1", "picks", &[]), None).await.unwrap();
}

#[tokio::test]
async fn call_without_handle_inside_scope_fails_instead_of_hanging() {
    let store = store().with_lock_timeout(Duration::from_millis(50));
    let repo = CollectionsRepository::new(store);

    let repo_ref = &repo;
    let stray = repo
        .create_transaction(move |tx| async move {
            repo_ref.save(&manual("c1", "picks", &[]), Some(&tx)).await?;
            let stray = repo_ref.get_by_id("c1", None).await;
            Ok::<_, DbError>(stray)
        })
        .await
        .unwrap();

    assert!(matches!(stray, Err(DbError::ConnectionBusy { waited_ms: 50 })));
    // The scope itself still committed.
    assert!(repo.get_by_id("c1", None).await.unwrap().is_some());
}

#[tokio::test]
async fn file_backed_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        path: Some(dir.path().join("collections.db")),
        ..DatabaseConfig::default()
    };
    let collection = manual("c1", "picks", &["p2", "p1"]);

    {
        let repo = CollectionsRepository::new(open_store(&config).unwrap());
        repo.save(&collection, None).await.unwrap();
    }

    let reopened = CollectionsRepository::new(open_store(&config).unwrap());
    let loaded = reopened.get_by_slug("picks", None).await.unwrap().unwrap();
    assert_eq!(loaded, collection);
    assert_eq!(loaded.posts(), ["p2", "p1"]);
}
