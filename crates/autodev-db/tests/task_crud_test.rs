//! CRUD and optimistic-locking tests for the tasks table.

use autodev_db::models::{Complexity, Effort, TaskStatus};
use autodev_db::queries::tasks::{self as db, NewTask};
use autodev_test_utils::{create_test_db, drop_test_db};

fn new_task<'a>(repo: &'a str, issue: i32, title: &'a str) -> NewTask<'a> {
    NewTask {
        repo,
        issue_number: issue,
        title,
        body: "a body",
        max_attempts: 3,
        job_id: None,
    }
}

#[tokio::test]
async fn insert_and_get_roundtrip() {
    let (pool, db_name) = create_test_db().await;

    let task = db::insert_task(&pool, &new_task("acme/widgets", 7, "fix the widget"))
        .await
        .expect("insert should succeed");
    assert_eq!(task.status, TaskStatus::New);
    assert_eq!(task.attempt_count, 0);
    assert_eq!(task.max_attempts, 3);
    assert!(task.plan.is_none());

    let fetched = db::get_task(&pool, task.id)
        .await
        .expect("get should succeed")
        .expect("task should exist");
    assert_eq!(fetched.id, task.id);
    assert_eq!(fetched.title, "fix the widget");

    let by_issue = db::get_task_by_issue(&pool, "acme/widgets", 7)
        .await
        .unwrap()
        .expect("should find by issue");
    assert_eq!(by_issue.id, task.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_issue_is_rejected() {
    let (pool, db_name) = create_test_db().await;

    db::insert_task(&pool, &new_task("acme/widgets", 7, "first"))
        .await
        .expect("first insert should succeed");
    let dup = db::insert_task(&pool, &new_task("acme/widgets", 7, "second")).await;
    assert!(dup.is_err(), "unique (repo, issue_number) should reject");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn optimistic_transition_only_fires_from_expected_status() {
    let (pool, db_name) = create_test_db().await;

    let task = db::insert_task(&pool, &new_task("acme/widgets", 1, "t"))
        .await
        .unwrap();

    let rows = db::transition_task_status(&pool, task.id, TaskStatus::New, TaskStatus::Planning)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Stale writer: expects `new` but the row is `planning`.
    let rows = db::transition_task_status(&pool, task.id, TaskStatus::New, TaskStatus::Planning)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let current = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Planning);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_transition_increments_attempt_once() {
    let (pool, db_name) = create_test_db().await;

    let task = db::insert_task(&pool, &new_task("acme/widgets", 2, "t"))
        .await
        .unwrap();
    sqlx::query("UPDATE tasks SET status = 'tests_failed' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    let rows = db::transition_task_retry(&pool, task.id, TaskStatus::TestsFailed, 0)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let current = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Fixing);
    assert_eq!(current.attempt_count, 1);

    // A second writer with the stale attempt counter loses.
    sqlx::query("UPDATE tasks SET status = 'tests_failed' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();
    let rows = db::transition_task_retry(&pool, task.id, TaskStatus::TestsFailed, 0)
        .await
        .unwrap();
    assert_eq!(rows, 0, "stale attempt counter should not double-count");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn planning_and_coding_outputs_persist() {
    let (pool, db_name) = create_test_db().await;

    let task = db::insert_task(&pool, &new_task("acme/widgets", 3, "t"))
        .await
        .unwrap();

    db::set_planning_outputs(
        &pool,
        task.id,
        &["done".to_string()],
        &["step 1".to_string(), "step 2".to_string()],
        &["src/lib.rs".to_string()],
        Complexity::S,
        Effort::Medium,
    )
    .await
    .unwrap();

    db::set_coding_outputs(&pool, task.id, "autodev/issue-3", "--- a/x\n+++ b/x\n", "msg")
        .await
        .unwrap();

    let current = db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.plan.as_deref().unwrap().len(), 2);
    assert_eq!(current.estimated_complexity, Some(Complexity::S));
    assert_eq!(current.estimated_effort, Some(Effort::Medium));
    assert_eq!(current.branch_name.as_deref(), Some("autodev/issue-3"));
    assert!(current.current_diff.is_some());

    let by_branch = db::find_task_by_branch(&pool, "acme/widgets", "autodev/issue-3")
        .await
        .unwrap()
        .expect("should find by branch");
    assert_eq!(by_branch.id, task.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn overlap_query_matches_array_intersection() {
    let (pool, db_name) = create_test_db().await;

    let a = db::insert_task(&pool, &new_task("acme/widgets", 10, "a"))
        .await
        .unwrap();
    let b = db::insert_task(&pool, &new_task("acme/widgets", 11, "b"))
        .await
        .unwrap();
    let c = db::insert_task(&pool, &new_task("acme/widgets", 12, "c"))
        .await
        .unwrap();

    for (id, files) in [
        (a.id, vec!["x.ts".to_string(), "y.ts".to_string()]),
        (b.id, vec!["x.ts".to_string()]),
        (c.id, vec!["z.ts".to_string()]),
    ] {
        sqlx::query("UPDATE tasks SET status = 'review_approved', target_files = $1 WHERE id = $2")
            .bind(&files)
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
    }

    let overlapping =
        db::list_unbatched_overlapping(&pool, "acme/widgets", &["x.ts".to_string()], a.id)
            .await
            .unwrap();
    assert_eq!(overlapping.len(), 1);
    assert_eq!(overlapping[0].id, b.id);

    let none =
        db::list_unbatched_overlapping(&pool, "acme/widgets", &["other.ts".to_string()], a.id)
            .await
            .unwrap();
    assert!(none.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn job_progress_buckets_statuses() {
    let (pool, db_name) = create_test_db().await;

    let job = autodev_db::queries::jobs::insert_job(&pool, "acme/widgets", &[])
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..4 {
        let task = db::insert_task(
            &pool,
            &NewTask {
                repo: "acme/widgets",
                issue_number: 20 + i,
                title: "t",
                body: "b",
                max_attempts: 3,
                job_id: Some(job.id),
            },
        )
        .await
        .unwrap();
        ids.push(task.id);
    }

    for (id, status) in ids.iter().zip(["new", "coding", "completed", "failed"]) {
        sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
    }

    let progress = db::get_job_progress(&pool, job.id).await.unwrap();
    assert_eq!(progress.total, 4);
    assert_eq!(progress.pending, 1);
    assert_eq!(progress.in_progress, 1);
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.failed, 1);
    assert_eq!(
        progress.total,
        progress.pending + progress.in_progress + progress.completed + progress.failed
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}
