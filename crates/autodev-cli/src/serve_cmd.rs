use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use autodev_core::coalesce::BatchCoalescer;
use autodev_core::driver::TaskDriver;
use autodev_core::error::{FailureCode, TaskFailure};
use autodev_core::host::SourceHost;
use autodev_core::ingress::{Ingress, IngressOutcome, SourceEvent};
use autodev_core::runner::{self, JobRunnerConfig};
use autodev_core::selector::{self, ModelSelector};
use autodev_core::settings::OrchestratorSettings;
use autodev_core::state::dispatch;
use autodev_db::models::{Complexity, Effort, Task, TaskStatus};
use autodev_db::queries::{
    jobs as job_db, model_configs as model_db, task_events as event_db, tasks as task_db,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub pool: PgPool,
    pub settings: Arc<OrchestratorSettings>,
    pub selector: Arc<ModelSelector>,
    pub ingress: Arc<Ingress>,
    pub driver: Arc<TaskDriver>,
    pub coalescer: Arc<BatchCoalescer>,
    pub host: Arc<dyn SourceHost>,
    pub runner_config: JobRunnerConfig,
    /// Cancellation tokens for jobs this process is currently running.
    pub job_cancels: Mutex<HashMap<Uuid, CancellationToken>>,
}

type SharedState = Arc<AppState>;

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

/// Task list entry: the full row minus the large text fields.
#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub repo: String,
    pub issue_number: i32,
    pub title: String,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub estimated_complexity: Option<Complexity>,
    pub estimated_effort: Option<Effort>,
    pub branch_name: Option<String>,
    pub pr_number: Option<i32>,
    pub pr_url: Option<String>,
    pub last_error: Option<String>,
    pub job_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskSummary {
    fn from(t: Task) -> Self {
        Self {
            id: t.id,
            repo: t.repo,
            issue_number: t.issue_number,
            title: t.title,
            status: t.status,
            attempt_count: t.attempt_count,
            max_attempts: t.max_attempts,
            estimated_complexity: t.estimated_complexity,
            estimated_effort: t.estimated_effort,
            branch_name: t.branch_name,
            pr_number: t.pr_number,
            pr_url: t.pr_url,
            last_error: t.last_error,
            job_id: t.job_id,
            batch_id: t.batch_id,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub repo: String,
    pub issue_number: i32,
    /// Optional when the source host can be queried for the issue.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub repo: String,
    pub issue_numbers: Vec<i32>,
}

#[derive(Debug, Deserialize)]
pub struct SetModelRequest {
    pub model_id: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/start", post(start_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/refresh", post(refresh_task))
        .route("/api/tasks/{id}/events", get(list_task_events))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/events", get(list_job_events))
        .route("/api/jobs/{id}/run", post(run_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/config/models", get(list_models))
        .route("/api/config/models/{position}", put(set_model))
        .route("/webhooks/source", post(webhook_source))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: SharedState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("autodev serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("autodev serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

async fn list_tasks(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    let tasks = task_db::list_tasks(&state.pool)
        .await
        .map_err(AppError::internal)?;
    let summaries: Vec<TaskSummary> = tasks.into_iter().map(TaskSummary::from).collect();
    Ok(Json(summaries))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    Ok(Json(task))
}

async fn create_task(
    State(state): State<SharedState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !state.settings.repo_allowed(&req.repo) {
        return Err(AppError::forbidden(format!(
            "repo {} is not on the allowlist",
            req.repo
        )));
    }

    let (title, body) = match (req.title, req.body) {
        (Some(title), body) => (title, body.unwrap_or_default()),
        (None, _) => {
            let issue = state
                .host
                .fetch_issue(&req.repo, req.issue_number)
                .await
                .map_err(AppError::internal)?;
            (issue.title, issue.body)
        }
    };

    let task = state
        .ingress
        .create_task(&req.repo, req.issue_number, &title, &body, None)
        .await
        .map_err(AppError::internal)?;

    Ok((StatusCode::CREATED, Json(task)))
}

async fn start_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    if task.status.is_terminal() {
        return Err(AppError::conflict(format!(
            "task {id} is already {}",
            task.status
        )));
    }

    let driver = Arc::clone(&state.driver);
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        if let Err(e) = driver.run_task(id, &cancel).await {
            tracing::error!(task_id = %id, error = %e, "task driver failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({"started": id}))))
}

async fn cancel_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    if task.status.is_terminal() {
        return Err(AppError::conflict(format!(
            "task {id} is already {}",
            task.status
        )));
    }

    let failure =
        TaskFailure::new(FailureCode::Cancelled, "cancelled via API").recoverable();
    dispatch::fail_task(&state.pool, id, &failure)
        .await
        .map_err(AppError::internal)?;

    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    Ok(Json(task))
}

/// Re-evaluate a suspended task: nudge `pr_created` into the merge queue
/// and give due batches a chance to process.
async fn refresh_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    if task.status == TaskStatus::PrCreated {
        dispatch::await_human(&state.pool, id)
            .await
            .map_err(AppError::internal)?;
    }

    state
        .coalescer
        .process_due(state.host.as_ref())
        .await
        .map_err(AppError::internal)?;

    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    Ok(Json(task))
}

async fn list_task_events(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .is_none()
    {
        return Err(AppError::not_found(format!("task {id} not found")));
    }
    let events = event_db::list_events_for_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(events))
}

// ---------------------------------------------------------------------------
// Job handlers
// ---------------------------------------------------------------------------

async fn list_jobs(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    let jobs = job_db::list_jobs(&state.pool)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let job = job_db::get_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;
    Ok(Json(job))
}

async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !state.settings.repo_allowed(&req.repo) {
        return Err(AppError::forbidden(format!(
            "repo {} is not on the allowlist",
            req.repo
        )));
    }
    if req.issue_numbers.is_empty() {
        return Err(AppError::bad_request("issue_numbers must be non-empty"));
    }

    let job = job_db::insert_job(&state.pool, &req.repo, &[])
        .await
        .map_err(AppError::internal)?;

    for issue_number in &req.issue_numbers {
        let (title, body) = match state.host.fetch_issue(&req.repo, *issue_number).await {
            Ok(issue) => (issue.title, issue.body),
            Err(_) => (format!("issue #{issue_number}"), String::new()),
        };
        let task = state
            .ingress
            .create_task(&req.repo, *issue_number, &title, &body, Some(job.id))
            .await
            .map_err(AppError::internal)?;
        job_db::append_task_to_job(&state.pool, job.id, task.id)
            .await
            .map_err(AppError::internal)?;
    }

    autodev_core::store::refresh_job_summary(&state.pool, job.id)
        .await
        .map_err(AppError::internal)?;
    let job = job_db::get_job(&state.pool, job.id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found("job vanished during creation"))?;

    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_job_events(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if job_db::get_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .is_none()
    {
        return Err(AppError::not_found(format!("job {id} not found")));
    }
    let events = event_db::list_events_for_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(events))
}

async fn run_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if job_db::get_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .is_none()
    {
        return Err(AppError::not_found(format!("job {id} not found")));
    }

    let cancel = CancellationToken::new();
    {
        let mut cancels = state.job_cancels.lock().await;
        if cancels.contains_key(&id) {
            return Err(AppError::conflict(format!("job {id} is already running")));
        }
        cancels.insert(id, cancel.clone());
    }

    let pool = state.pool.clone();
    let driver = Arc::clone(&state.driver);
    let coalescer = Arc::clone(&state.coalescer);
    let host = Arc::clone(&state.host);
    let runner_config = state.runner_config.clone();
    let state_for_cleanup = Arc::clone(&state);

    tokio::spawn(async move {
        let result = runner::run_job(
            &pool,
            id,
            driver,
            coalescer,
            host,
            &runner_config,
            cancel,
        )
        .await;
        match result {
            Ok(outcome) => tracing::info!(job_id = %id, outcome = ?outcome, "job finished"),
            Err(e) => tracing::error!(job_id = %id, error = %e, "job runner failed"),
        }
        state_for_cleanup.job_cancels.lock().await.remove(&id);
    });

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({"running": id}))))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let job = job_db::get_job(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    // A job running in this process gets a cooperative signal; a job that
    // never started is cancelled directly.
    let cancels = state.job_cancels.lock().await;
    if let Some(token) = cancels.get(&id) {
        token.cancel();
        return Ok(Json(serde_json::json!({"cancelling": id})));
    }
    drop(cancels);

    use autodev_db::models::JobStatus;
    let rows = job_db::transition_job_status(&state.pool, id, JobStatus::Pending, JobStatus::Cancelled)
        .await
        .map_err(AppError::internal)?;
    if rows == 0 {
        return Err(AppError::conflict(format!(
            "job {id} has status {} and is not running here",
            job.status
        )));
    }
    Ok(Json(serde_json::json!({"cancelled": id})))
}

// ---------------------------------------------------------------------------
// Model config handlers
// ---------------------------------------------------------------------------

async fn list_models(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    let configs = model_db::list_model_configs(&state.pool)
        .await
        .map_err(AppError::internal)?;

    let mut available: Vec<&str> = selector::DEFAULT_MODELS.iter().map(|(_, m)| *m).collect();
    available.push(selector::FALLBACK_MODEL);
    available.sort();
    available.dedup();

    Ok(Json(serde_json::json!({
        "configs": configs,
        "positions": selector::all_positions(),
        "available_models": available,
    })))
}

async fn set_model(
    State(state): State<SharedState>,
    Path(position): Path<String>,
    Json(req): Json<SetModelRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !selector::all_positions().contains(&position.as_str()) {
        return Err(AppError::bad_request(format!(
            "unknown model position {position}"
        )));
    }

    let config = model_db::set_model_config(&state.pool, &position, &req.model_id)
        .await
        .map_err(AppError::internal)?;
    state.selector.invalidate().await;
    Ok(Json(config))
}

// ---------------------------------------------------------------------------
// Webhook ingress
// ---------------------------------------------------------------------------

async fn webhook_source(
    State(state): State<SharedState>,
    Json(event): Json<SourceEvent>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .ingress
        .handle(event)
        .await
        .map_err(AppError::internal)?;

    // A check conclusion or a merge may unblock a task; give the driver a
    // nudge so suspended pipelines move without waiting for a job runner.
    if let IngressOutcome::TaskResumed { task_id, status } = &outcome {
        if !status.is_terminal() {
            let driver = Arc::clone(&state.driver);
            let task_id = *task_id;
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                if let Err(e) = driver.run_task(task_id, &cancel).await {
                    tracing::error!(task_id = %task_id, error = %e, "resume driver failed");
                }
            });
        }
    }

    let label = match &outcome {
        IngressOutcome::TaskCreated(task) => serde_json::json!({"task_created": task.id}),
        IngressOutcome::TaskAttachedToJob { task, job } => {
            serde_json::json!({"task_created": task.id, "job_id": job.id})
        }
        IngressOutcome::TaskResumed { task_id, status } => {
            serde_json::json!({"task_resumed": task_id, "status": status})
        }
        IngressOutcome::Dropped => serde_json::json!({"dropped": true}),
        IngressOutcome::Ignored => serde_json::json!({"ignored": true}),
    };
    Ok((StatusCode::ACCEPTED, Json(label)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::PgPool;
    use tower::ServiceExt;

    use autodev_core::host::UnconfiguredSourceHost;
    use autodev_core::model::UnconfiguredModelClient;
    use autodev_core::settings::OrchestratorSettings;
    use autodev_test_utils::{create_test_db, drop_test_db};

    use crate::runtime::build_state_with;

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn test_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            allowed_repos: vec!["acme/widgets".to_string()],
            ..Default::default()
        }
    }

    fn router(pool: PgPool) -> axum::Router {
        let state = build_state_with(
            pool,
            test_settings(),
            Arc::new(UnconfiguredModelClient),
            Arc::new(UnconfiguredSourceHost),
        );
        super::build_router(state)
    }

    async fn send_get(app: &axum::Router, uri: &str) -> axum::response::Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn send_json(
        app: &axum::Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> axum::response::Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_task_body(issue: i32) -> serde_json::Value {
        serde_json::json!({
            "repo": "acme/widgets",
            "issue_number": issue,
            "title": "a task",
            "body": "a body",
        })
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_list_tasks_empty() {
        let (pool, db_name) = create_test_db().await;
        let app = router(pool.clone());

        let resp = send_get(&app, "/api/tasks").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_task_and_read_back() {
        let (pool, db_name) = create_test_db().await;
        let app = router(pool.clone());

        let resp = send_json(&app, "POST", "/api/tasks", create_task_body(7)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["status"], "new");

        // Full detail keeps the body; the list view drops it.
        let resp = send_get(&app, &format!("/api/tasks/{id}")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let detail = body_json(resp).await;
        assert_eq!(detail["body"], "a body");

        let resp = send_get(&app, "/api/tasks").await;
        let list = body_json(resp).await;
        let entry = &list.as_array().unwrap()[0];
        assert_eq!(entry["id"].as_str().unwrap(), id);
        assert!(entry.get("body").is_none(), "list entries omit large fields");
        assert!(entry.get("current_diff").is_none());

        // Creation also appended the audit event.
        let resp = send_get(&app, &format!("/api/tasks/{id}/events")).await;
        let events = body_json(resp).await;
        assert_eq!(events.as_array().unwrap().len(), 1);
        assert_eq!(events[0]["event_type"], "created");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_task_rejects_unlisted_repo() {
        let (pool, db_name) = create_test_db().await;
        let app = router(pool.clone());

        let resp = send_json(
            &app,
            "POST",
            "/api/tasks",
            serde_json::json!({"repo": "evil/repo", "issue_number": 1, "title": "t"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_task_not_found() {
        let (pool, db_name) = create_test_db().await;
        let app = router(pool.clone());

        let random = uuid::Uuid::new_v4();
        let resp = send_get(&app, &format!("/api/tasks/{random}")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_cancel_task() {
        let (pool, db_name) = create_test_db().await;
        let app = router(pool.clone());

        let resp = send_json(&app, "POST", "/api/tasks", create_task_body(9)).await;
        let id = body_json(resp).await["id"].as_str().unwrap().to_string();

        let resp = send_json(
            &app,
            "POST",
            &format!("/api/tasks/{id}/cancel"),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let task = body_json(resp).await;
        assert_eq!(task["status"], "failed");
        assert!(task["last_error"].as_str().unwrap().contains("CANCELLED"));

        // Cancelling a terminal task conflicts.
        let resp = send_json(
            &app,
            "POST",
            &format!("/api/tasks/{id}/cancel"),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_job_with_summary() {
        let (pool, db_name) = create_test_db().await;
        let app = router(pool.clone());

        let resp = send_json(
            &app,
            "POST",
            "/api/jobs",
            serde_json::json!({"repo": "acme/widgets", "issue_numbers": [1, 2, 3]}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let job = body_json(resp).await;
        assert_eq!(job["status"], "pending");
        assert_eq!(job["summary"]["total"], 3);
        assert_eq!(job["summary"]["pending"], 3);

        let job_id = job["id"].as_str().unwrap();
        let resp = send_get(&app, &format!("/api/jobs/{job_id}/events")).await;
        let events = body_json(resp).await;
        assert_eq!(events.as_array().unwrap().len(), 3, "one created event per task");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_job_requires_issue_numbers() {
        let (pool, db_name) = create_test_db().await;
        let app = router(pool.clone());

        let resp = send_json(
            &app,
            "POST",
            "/api/jobs",
            serde_json::json!({"repo": "acme/widgets", "issue_numbers": []}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_model_config_surface() {
        let (pool, db_name) = create_test_db().await;
        let app = router(pool.clone());

        let resp = send_get(&app, "/api/config/models").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let listing = body_json(resp).await;
        assert_eq!(listing["configs"], serde_json::json!([]));
        assert!(
            listing["positions"]
                .as_array()
                .unwrap()
                .iter()
                .any(|p| p == "coder_xs_low"),
            "positions should enumerate the coder grid"
        );

        let resp = send_json(
            &app,
            "PUT",
            "/api/config/models/planner",
            serde_json::json!({"model_id": "orion-max"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let config = body_json(resp).await;
        assert_eq!(config["position"], "planner");
        assert_eq!(config["model_id"], "orion-max");

        let resp = send_json(
            &app,
            "PUT",
            "/api/config/models/not_a_position",
            serde_json::json!({"model_id": "x"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_webhook_creates_and_drops() {
        let (pool, db_name) = create_test_db().await;
        let app = router(pool.clone());

        let resp = send_json(
            &app,
            "POST",
            "/webhooks/source",
            serde_json::json!({
                "type": "issue_labeled",
                "repo": "acme/widgets",
                "issue_number": 12,
                "label": "auto-dev",
                "title": "from webhook",
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let outcome = body_json(resp).await;
        assert!(outcome.get("task_created").is_some());

        let resp = send_json(
            &app,
            "POST",
            "/webhooks/source",
            serde_json::json!({
                "type": "issue_labeled",
                "repo": "evil/repo",
                "issue_number": 1,
                "label": "auto-dev",
                "title": "nope",
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["dropped"], true);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
