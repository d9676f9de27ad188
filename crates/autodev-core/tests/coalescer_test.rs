//! Batch-coalescer integration tests: membership decisions, diff merging,
//! the conflict fallback, and the single combined pull request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use autodev_db::models::{BatchStatus, TaskStatus};
use autodev_db::queries::batches as batch_db;
use autodev_db::queries::tasks::{self as task_db, NewTask};
use autodev_test_utils::{create_test_db, drop_test_db};

use autodev_core::coalesce::{BatchCoalescer, BatchOutcome, CoalesceOutcome, CoalescerConfig};
use autodev_core::host::{CheckConclusion, Issue, OpenedPr, SourceHost};

// ===========================================================================
// Mock host
// ===========================================================================

struct MockHost {
    check_results: Mutex<VecDeque<CheckConclusion>>,
    pr_counter: AtomicI32,
    opened_prs: Mutex<Vec<(String, String)>>,
    applied_diffs: Mutex<Vec<String>>,
}

impl MockHost {
    fn passing() -> Arc<Self> {
        Arc::new(Self {
            check_results: Mutex::new(VecDeque::new()),
            pr_counter: AtomicI32::new(500),
            opened_prs: Mutex::new(Vec::new()),
            applied_diffs: Mutex::new(Vec::new()),
        })
    }

    fn failing_checks() -> Arc<Self> {
        let host = Self::passing();
        host.check_results
            .lock()
            .unwrap()
            .push_back(CheckConclusion::Failed);
        host
    }
}

#[async_trait]
impl SourceHost for MockHost {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_issue(&self, repo: &str, number: i32) -> Result<Issue> {
        Ok(Issue {
            repo: repo.to_string(),
            number,
            title: String::new(),
            body: String::new(),
            labels: vec![],
        })
    }

    async fn create_branch(&self, _repo: &str, _base: &str, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn apply_diff(
        &self,
        _repo: &str,
        _branch: &str,
        diff: &str,
        _commit_message: &str,
    ) -> Result<()> {
        self.applied_diffs.lock().unwrap().push(diff.to_string());
        Ok(())
    }

    async fn open_pull_request(
        &self,
        repo: &str,
        branch: &str,
        _base: &str,
        _title: &str,
        body: &str,
    ) -> Result<OpenedPr> {
        let number = self.pr_counter.fetch_add(1, Ordering::SeqCst);
        self.opened_prs
            .lock()
            .unwrap()
            .push((branch.to_string(), body.to_string()));
        Ok(OpenedPr {
            number,
            url: format!("https://example.com/{repo}/pull/{number}"),
        })
    }

    async fn run_checks(&self, _repo: &str, _branch: &str) -> Result<CheckConclusion> {
        Ok(self
            .check_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CheckConclusion::Passed))
    }

    async fn post_comment(&self, _repo: &str, _issue_number: i32, _body: &str) -> Result<()> {
        Ok(())
    }
}

// ===========================================================================
// Fixtures
// ===========================================================================

fn diff_at_line(line: u64) -> String {
    format!("--- a/x.ts\n+++ b/x.ts\n@@ -{line},1 +{line},1 @@\n-old{line}\n+new{line}\n")
}

fn coalescer(pool: &PgPool) -> BatchCoalescer {
    BatchCoalescer::new(
        pool.clone(),
        CoalescerConfig {
            base_branch: "main".to_string(),
            min_batch_size: 2,
            max_batch_size: 10,
            batch_timeout: Duration::from_secs(30 * 60),
        },
    )
}

/// A review-approved task with a diff and target files, ready to coalesce.
async fn approved_task(pool: &PgPool, issue: i32, files: &[&str], diff: &str) -> Uuid {
    let task = task_db::insert_task(
        pool,
        &NewTask {
            repo: "acme/widgets",
            issue_number: issue,
            title: &format!("task {issue}"),
            body: "b",
            max_attempts: 3,
            job_id: None,
        },
    )
    .await
    .unwrap();

    let files: Vec<String> = files.iter().map(|f| f.to_string()).collect();
    sqlx::query(
        "UPDATE tasks SET status = 'review_approved', plan = ARRAY['p'], \
         target_files = $1, current_diff = $2, \
         commit_message = $3, branch_name = $4 \
         WHERE id = $5",
    )
    .bind(&files)
    .bind(diff)
    .bind(format!("commit for {issue}"))
    .bind(format!("autodev/issue-{issue}"))
    .bind(task.id)
    .execute(pool)
    .await
    .unwrap();

    task.id
}

async fn get(pool: &PgPool, id: Uuid) -> autodev_db::models::Task {
    task_db::get_task(pool, id).await.unwrap().unwrap()
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn overlapping_tasks_form_a_batch_and_share_one_pr() {
    let (pool, db_name) = create_test_db().await;
    let c = coalescer(&pool);
    let host = MockHost::passing();

    let a = approved_task(&pool, 1, &["x.ts"], &diff_at_line(1)).await;
    let b = approved_task(&pool, 2, &["x.ts", "y.ts"], &diff_at_line(10)).await;

    let outcome = c.on_review_approved(&get(&pool, a).await).await.unwrap();
    let CoalesceOutcome::Claimed(batch_id) = outcome else {
        panic!("expected a batch, got {outcome:?}");
    };

    // Both members wait; the batch fingerprint is the union.
    assert_eq!(get(&pool, a).await.status, TaskStatus::WaitingBatch);
    assert_eq!(get(&pool, b).await.status, TaskStatus::WaitingBatch);
    let batch = batch_db::get_batch(&pool, batch_id).await.unwrap().unwrap();
    let mut files = batch.target_files.clone();
    files.sort();
    assert_eq!(files, vec!["x.ts", "y.ts"]);
    assert_eq!(batch.task_ids.len(), 2);

    // All members waiting -> the batch is due.
    let processed = c.process_due(host.as_ref()).await.unwrap();
    assert_eq!(processed.len(), 1);
    assert!(matches!(processed[0].outcome, BatchOutcome::PrOpened { .. }));

    // One PR, one applied combined diff, both tasks carry the same PR.
    assert_eq!(host.opened_prs.lock().unwrap().len(), 1);
    let applied = host.applied_diffs.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].contains("-old1") && applied[0].contains("-old10"));

    let task_a = get(&pool, a).await;
    let task_b = get(&pool, b).await;
    assert_eq!(task_a.status, TaskStatus::PrCreated);
    assert_eq!(task_b.status, TaskStatus::PrCreated);
    assert_eq!(task_a.pr_number, task_b.pr_number);
    assert!(task_a.commit_message.as_deref().unwrap().contains("commit for 1"));
    assert!(task_a.commit_message.as_deref().unwrap().contains("commit for 2"));

    let batch = batch_db::get_batch(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert!(batch.pr_url.is_some());

    // The PR body names both constituent issues.
    let prs = host.opened_prs.lock().unwrap();
    assert!(prs[0].1.contains("#1") && prs[0].1.contains("#2"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn third_task_joins_an_existing_pending_batch() {
    let (pool, db_name) = create_test_db().await;
    let c = coalescer(&pool);

    let a = approved_task(&pool, 1, &["x.ts"], &diff_at_line(1)).await;
    let _b = approved_task(&pool, 2, &["x.ts"], &diff_at_line(10)).await;

    let CoalesceOutcome::Claimed(batch_id) =
        c.on_review_approved(&get(&pool, a).await).await.unwrap()
    else {
        panic!("expected a batch");
    };

    let late = approved_task(&pool, 3, &["x.ts", "z.ts"], &diff_at_line(20)).await;
    let outcome = c.on_review_approved(&get(&pool, late).await).await.unwrap();
    assert_eq!(outcome, CoalesceOutcome::Claimed(batch_id));

    let batch = batch_db::get_batch(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.task_ids.len(), 3);
    assert!(batch.target_files.contains(&"z.ts".to_string()));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn disjoint_target_files_stay_solo() {
    let (pool, db_name) = create_test_db().await;
    let c = coalescer(&pool);

    let a = approved_task(&pool, 1, &["x.ts"], &diff_at_line(1)).await;
    let _b = approved_task(&pool, 2, &["z.ts"], &diff_at_line(1)).await;

    let outcome = c.on_review_approved(&get(&pool, a).await).await.unwrap();
    assert_eq!(outcome, CoalesceOutcome::Solo);
    assert_eq!(get(&pool, a).await.status, TaskStatus::ReviewApproved);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn conflicting_hunks_fail_the_batch_and_revert_members() {
    let (pool, db_name) = create_test_db().await;
    let c = coalescer(&pool);
    let host = MockHost::passing();

    // Both diffs rewrite line 1 of x.ts.
    let a = approved_task(&pool, 1, &["x.ts"], &diff_at_line(1)).await;
    let b = approved_task(&pool, 2, &["x.ts"], &diff_at_line(1)).await;

    let CoalesceOutcome::Claimed(batch_id) =
        c.on_review_approved(&get(&pool, a).await).await.unwrap()
    else {
        panic!("expected a batch");
    };

    let processed = c.process_due(host.as_ref()).await.unwrap();
    assert_eq!(processed.len(), 1);
    assert!(matches!(
        processed[0].outcome,
        BatchOutcome::Conflict { ref path } if path == "x.ts"
    ));

    // Members revert to review_approved, batch marked failed, no PR.
    let task_a = get(&pool, a).await;
    let task_b = get(&pool, b).await;
    assert_eq!(task_a.status, TaskStatus::ReviewApproved);
    assert_eq!(task_b.status, TaskStatus::ReviewApproved);
    assert!(host.opened_prs.lock().unwrap().is_empty());

    let batch = batch_db::get_batch(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);

    // A failed batch is not rejoined: the members proceed solo.
    let outcome = c.on_review_approved(&task_a).await.unwrap();
    assert_eq!(outcome, CoalesceOutcome::Solo);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failed_batch_checks_send_members_to_tests_failed() {
    let (pool, db_name) = create_test_db().await;
    let c = coalescer(&pool);
    let host = MockHost::failing_checks();

    let a = approved_task(&pool, 1, &["x.ts"], &diff_at_line(1)).await;
    let b = approved_task(&pool, 2, &["x.ts"], &diff_at_line(10)).await;

    c.on_review_approved(&get(&pool, a).await).await.unwrap();
    let processed = c.process_due(host.as_ref()).await.unwrap();
    assert!(matches!(processed[0].outcome, BatchOutcome::ChecksFailed));

    assert_eq!(get(&pool, a).await.status, TaskStatus::TestsFailed);
    assert_eq!(get(&pool, b).await.status, TaskStatus::TestsFailed);
    assert!(host.opened_prs.lock().unwrap().is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn undersized_batch_is_disbanded() {
    let (pool, db_name) = create_test_db().await;
    let c = coalescer(&pool);
    let host = MockHost::passing();

    // Hand-build a single-member batch (a straggler never arrived).
    let a = approved_task(&pool, 1, &["x.ts"], &diff_at_line(1)).await;
    let batch = batch_db::insert_batch(
        &pool,
        "acme/widgets",
        "main",
        &["x.ts".to_string()],
        &[a],
    )
    .await
    .unwrap();
    task_db::set_batch_membership(&pool, a, Some(batch.id)).await.unwrap();
    autodev_core::state::dispatch::enter_batch(&pool, a).await.unwrap();

    let processed = c.process_due(host.as_ref()).await.unwrap();
    assert!(matches!(processed[0].outcome, BatchOutcome::Disbanded));
    assert_eq!(get(&pool, a).await.status, TaskStatus::ReviewApproved);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn batch_not_due_until_members_wait_or_timeout() {
    let (pool, db_name) = create_test_db().await;
    let c = coalescer(&pool);
    let host = MockHost::passing();

    let a = approved_task(&pool, 1, &["x.ts"], &diff_at_line(1)).await;
    let b = approved_task(&pool, 2, &["x.ts"], &diff_at_line(10)).await;

    c.on_review_approved(&get(&pool, a).await).await.unwrap();

    // Pull one member back out of waiting; the batch is no longer due.
    autodev_core::state::dispatch::batch_to_solo(&pool, b).await.unwrap();
    let processed = c.process_due(host.as_ref()).await.unwrap();
    assert!(processed.is_empty(), "batch with a non-waiting member is not due");

    pool.close().await;
    drop_test_db(&db_name).await;
}
