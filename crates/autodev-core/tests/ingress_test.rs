//! Ingress normalization tests: label triggers, allowlist enforcement,
//! and reawakening suspended tasks.

use std::sync::Arc;

use sqlx::PgPool;

use autodev_db::models::{EventType, TaskStatus};
use autodev_db::queries::jobs as job_db;
use autodev_db::queries::task_events;
use autodev_db::queries::tasks as task_db;
use autodev_test_utils::{create_test_db, drop_test_db};

use autodev_core::ingress::{Ingress, IngressOutcome, SourceEvent};
use autodev_core::settings::OrchestratorSettings;

fn ingress(pool: &PgPool) -> Ingress {
    let settings = OrchestratorSettings {
        allowed_repos: vec!["acme/widgets".to_string()],
        ..Default::default()
    };
    Ingress::new(pool.clone(), Arc::new(settings))
}

fn labeled(repo: &str, issue: i32, label: &str) -> SourceEvent {
    SourceEvent::IssueLabeled {
        repo: repo.to_string(),
        issue_number: issue,
        label: label.to_string(),
        title: format!("issue {issue}"),
        body: "a body".to_string(),
    }
}

#[tokio::test]
async fn auto_dev_label_creates_a_task_with_created_event() {
    let (pool, db_name) = create_test_db().await;
    let ingress = ingress(&pool);

    let outcome = ingress
        .handle(labeled("acme/widgets", 7, "auto-dev"))
        .await
        .unwrap();
    let IngressOutcome::TaskCreated(task) = outcome else {
        panic!("expected a created task, got {outcome:?}");
    };
    assert_eq!(task.status, TaskStatus::New);
    assert_eq!(task.issue_number, 7);

    let events = task_events::list_events_for_task(&pool, task.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Created);

    // Re-delivering the same label event is idempotent.
    let outcome = ingress
        .handle(labeled("acme/widgets", 7, "auto-dev"))
        .await
        .unwrap();
    let IngressOutcome::TaskCreated(again) = outcome else {
        panic!("expected the existing task");
    };
    assert_eq!(again.id, task.id);
    let events = task_events::list_events_for_task(&pool, task.id).await.unwrap();
    assert_eq!(events.len(), 1, "no duplicate created event");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn batch_label_groups_siblings_into_one_job() {
    let (pool, db_name) = create_test_db().await;
    let ingress = ingress(&pool);

    let IngressOutcome::TaskAttachedToJob { task: first, job } = ingress
        .handle(labeled("acme/widgets", 1, "auto-dev-batch"))
        .await
        .unwrap()
    else {
        panic!("expected a job attachment");
    };

    let IngressOutcome::TaskAttachedToJob { task: second, job: same_job } = ingress
        .handle(labeled("acme/widgets", 2, "auto-dev-batch"))
        .await
        .unwrap()
    else {
        panic!("expected a job attachment");
    };

    assert_eq!(job.id, same_job.id, "siblings share one job");
    assert_eq!(same_job.task_ids, vec![first.id, second.id]);
    assert_eq!(same_job.summary.0.total, 2);
    assert_eq!(same_job.summary.0.pending, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unknown_label_is_ignored() {
    let (pool, db_name) = create_test_db().await;
    let ingress = ingress(&pool);

    let outcome = ingress
        .handle(labeled("acme/widgets", 3, "bug"))
        .await
        .unwrap();
    assert!(matches!(outcome, IngressOutcome::Ignored));
    assert!(task_db::list_tasks(&pool).await.unwrap().is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unlisted_repo_is_dropped_with_a_counter() {
    let (pool, db_name) = create_test_db().await;
    let ingress = ingress(&pool);
    assert_eq!(ingress.dropped_count(), 0);

    let outcome = ingress
        .handle(labeled("evil/repo", 1, "auto-dev"))
        .await
        .unwrap();
    assert!(matches!(outcome, IngressOutcome::Dropped));
    assert_eq!(ingress.dropped_count(), 1);
    assert!(task_db::list_tasks(&pool).await.unwrap().is_empty());

    let outcome = ingress
        .handle(SourceEvent::PullRequestMerged {
            repo: "evil/repo".to_string(),
            pr_number: 1,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, IngressOutcome::Dropped));
    assert_eq!(ingress.dropped_count(), 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn check_conclusion_moves_a_testing_task() {
    let (pool, db_name) = create_test_db().await;
    let ingress = ingress(&pool);

    let IngressOutcome::TaskCreated(task) = ingress
        .handle(labeled("acme/widgets", 4, "auto-dev"))
        .await
        .unwrap()
    else {
        panic!("expected a task");
    };
    sqlx::query(
        "UPDATE tasks SET status = 'testing', branch_name = 'autodev/issue-4', \
         current_diff = 'x' WHERE id = $1",
    )
    .bind(task.id)
    .execute(&pool)
    .await
    .unwrap();

    let outcome = ingress
        .handle(SourceEvent::CheckRunCompleted {
            repo: "acme/widgets".to_string(),
            branch: "autodev/issue-4".to_string(),
            passed: true,
        })
        .await
        .unwrap();
    let IngressOutcome::TaskResumed { status, .. } = outcome else {
        panic!("expected a resumed task");
    };
    assert_eq!(status, TaskStatus::TestsPassed);

    // A conclusion for a branch nobody owns is ignored.
    let outcome = ingress
        .handle(SourceEvent::CheckRunCompleted {
            repo: "acme/widgets".to_string(),
            branch: "unknown-branch".to_string(),
            passed: false,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, IngressOutcome::Ignored));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failed_checks_record_the_error() {
    let (pool, db_name) = create_test_db().await;
    let ingress = ingress(&pool);

    let IngressOutcome::TaskCreated(task) = ingress
        .handle(labeled("acme/widgets", 5, "auto-dev"))
        .await
        .unwrap()
    else {
        panic!("expected a task");
    };
    sqlx::query(
        "UPDATE tasks SET status = 'testing', branch_name = 'autodev/issue-5', \
         current_diff = 'x' WHERE id = $1",
    )
    .bind(task.id)
    .execute(&pool)
    .await
    .unwrap();

    ingress
        .handle(SourceEvent::CheckRunCompleted {
            repo: "acme/widgets".to_string(),
            branch: "autodev/issue-5".to_string(),
            passed: false,
        })
        .await
        .unwrap();

    let task = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::TestsFailed);
    assert!(task.last_error.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn merge_completes_the_task_and_updates_the_job() {
    let (pool, db_name) = create_test_db().await;
    let ingress = ingress(&pool);

    let IngressOutcome::TaskAttachedToJob { task, job } = ingress
        .handle(labeled("acme/widgets", 6, "auto-dev-batch"))
        .await
        .unwrap()
    else {
        panic!("expected a job attachment");
    };

    sqlx::query("UPDATE tasks SET status = 'pr_created', pr_number = 42, pr_url = 'u' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    let outcome = ingress
        .handle(SourceEvent::PullRequestMerged {
            repo: "acme/widgets".to_string(),
            pr_number: 42,
        })
        .await
        .unwrap();
    let IngressOutcome::TaskResumed { status, .. } = outcome else {
        panic!("expected a resumed task");
    };
    assert_eq!(status, TaskStatus::Completed);

    let events = task_events::list_events_for_task(&pool, task.id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::Completed));

    let job = job_db::get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(job.summary.0.completed, 1);
    assert_eq!(job.summary.0.total, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}
