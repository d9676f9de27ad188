//! The `SourceHost` trait -- the adapter interface for the source-hosting
//! service (repositories, branches, pull requests, checks).
//!
//! The orchestrator consumes a small, explicit set of operations from the
//! host and nothing else. Like [`crate::model::ModelClient`], the trait is
//! object-safe and shared as `Arc<dyn SourceHost>`.

use anyhow::Result;
use async_trait::async_trait;

/// An issue fetched from the host.
#[derive(Debug, Clone)]
pub struct Issue {
    pub repo: String,
    pub number: i32,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// A pull request opened by the orchestrator.
#[derive(Debug, Clone)]
pub struct OpenedPr {
    pub number: i32,
    pub url: String,
}

/// Outcome of the host-side check suite for a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckConclusion {
    Passed,
    Failed,
}

/// Adapter interface for the source-hosting service.
///
/// Implementations hold no cross-task state; failures are plain errors
/// and the driver decides what they mean for the task.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Human-readable name for this host (e.g. "github", "mock").
    fn name(&self) -> &str;

    /// Fetch an issue by repo and number.
    async fn fetch_issue(&self, repo: &str, number: i32) -> Result<Issue>;

    /// Create a branch off the base branch. Creating a branch that
    /// already exists at the same base is not an error.
    async fn create_branch(&self, repo: &str, base: &str, branch: &str) -> Result<()>;

    /// Apply a unified diff to a branch as a single commit.
    async fn apply_diff(
        &self,
        repo: &str,
        branch: &str,
        diff: &str,
        commit_message: &str,
    ) -> Result<()>;

    /// Open a pull request from `branch` into `base`.
    async fn open_pull_request(
        &self,
        repo: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<OpenedPr>;

    /// Run the check suite for a branch and wait for its conclusion.
    async fn run_checks(&self, repo: &str, branch: &str) -> Result<CheckConclusion>;

    /// Post a comment on an issue.
    async fn post_comment(&self, repo: &str, issue_number: i32, body: &str) -> Result<()>;
}

// Compile-time assertion: SourceHost must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn SourceHost) {}
};

/// A host for deployments with no source-hosting adapter wired in. Every
/// call errors so tasks fail cleanly instead of hanging.
pub struct UnconfiguredSourceHost;

#[async_trait]
impl SourceHost for UnconfiguredSourceHost {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn fetch_issue(&self, _repo: &str, _number: i32) -> Result<Issue> {
        anyhow::bail!("no source host configured")
    }

    async fn create_branch(&self, _repo: &str, _base: &str, _branch: &str) -> Result<()> {
        anyhow::bail!("no source host configured")
    }

    async fn apply_diff(
        &self,
        _repo: &str,
        _branch: &str,
        _diff: &str,
        _commit_message: &str,
    ) -> Result<()> {
        anyhow::bail!("no source host configured")
    }

    async fn open_pull_request(
        &self,
        _repo: &str,
        _branch: &str,
        _base: &str,
        _title: &str,
        _body: &str,
    ) -> Result<OpenedPr> {
        anyhow::bail!("no source host configured")
    }

    async fn run_checks(&self, _repo: &str, _branch: &str) -> Result<CheckConclusion> {
        anyhow::bail!("no source host configured")
    }

    async fn post_comment(&self, _repo: &str, _issue_number: i32, _body: &str) -> Result<()> {
        anyhow::bail!("no source host configured")
    }
}
