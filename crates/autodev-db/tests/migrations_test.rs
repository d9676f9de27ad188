//! Migration smoke tests: the schema applies cleanly and produces the
//! expected tables.

use sqlx::Row;

use autodev_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, db_name) = create_test_db().await;

    let rows = sqlx::query(
        "SELECT tablename::text FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .expect("should list tables");

    let tables: Vec<String> = rows
        .iter()
        .map(|r| r.get::<String, _>("tablename"))
        .collect();

    for expected in ["batches", "jobs", "model_configs", "task_events", "tasks"] {
        assert!(
            tables.iter().any(|t| t == expected),
            "missing table {expected}, got {tables:?}"
        );
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, db_name) = create_test_db().await;

    // Re-running the migrator against an up-to-date database is a no-op.
    autodev_db::pool::run_migrations(&pool)
        .await
        .expect("re-running migrations should succeed");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_status_check_constraint_rejects_unknown() {
    let (pool, db_name) = create_test_db().await;

    let result = sqlx::query(
        "INSERT INTO tasks (repo, issue_number, title, status) \
         VALUES ('acme/widgets', 1, 't', 'bogus')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "check constraint should reject bogus status");

    pool.close().await;
    drop_test_db(&db_name).await;
}
