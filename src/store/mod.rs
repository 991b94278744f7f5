//! Seams to the collaborators the scheduler does not own.
//!
//! The durable job table, the credit ledger, the portal credential vault, the
//! user notification feed and the work history all live outside this process
//! in production.
//! The scheduler only talks to them through these traits; [`memory`] holds
//! in-process implementations used for standalone runs and tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::{Job, JobStatus, JobUpdate};

pub use memory::{
    MemoryCredentialStore, MemoryJobStore, MemoryLedger, MemoryNotifier, MemoryWorkHistory,
};

/// Durable record of every job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job record.
    async fn create_job(&self, job: Job) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Move a job to `status` and write the partial fields with it.
    ///
    /// Fails with `InvalidTransition` when the job state machine does not
    /// allow the move, which is what makes terminal states final.
    async fn update_job_status(&self, job_id: Uuid, status: JobStatus, update: JobUpdate)
        -> Result<Job>;

    /// Oldest highest-priority queued job of `category`.
    async fn next_queued_job(&self, category: &str) -> Result<Option<Job>>;

    /// 1-based queue rank, or 0 when the job is unknown or not queued.
    async fn queue_position(&self, job_id: Uuid) -> Result<usize>;

    /// Processing jobs that started before `started_before`.
    async fn stale_processing_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Delete completed jobs that finished before `completed_before`.
    async fn purge_completed(&self, completed_before: DateTime<Utc>) -> Result<usize>;

    /// Delete failed jobs that finished before `failed_before`.
    async fn purge_failed(&self, failed_before: DateTime<Utc>) -> Result<usize>;

    /// Most recent jobs of a user, newest first.
    async fn user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<Job>>;
}

/// Per-user credit balances. Each call is atomic on its own.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Take `amount` from the user's balance, returning the new balance.
    async fn debit(&self, user_id: &str, amount: f64) -> Result<f64>;

    /// Give `amount` back, returning the new balance.
    async fn credit(&self, user_id: &str, amount: f64) -> Result<f64>;
}

#[derive(Clone)]
pub struct PortalCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Logins users keep on file for credential-gated portals.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn portal_credentials(&self, user_id: &str, portal: &str)
        -> Result<Option<PortalCredentials>>;

    /// Track whether the stored login last worked.
    async fn record_test_result(&self, user_id: &str, portal: &str, success: bool) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub portal: Option<String>,
    pub job_id: Option<Uuid>,
    pub action_url: Option<String>,
    pub action_label: Option<String>,
}

/// User-facing notification feed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// One successful job as it appears in the user's work history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkHistoryEntry {
    pub user_id: String,
    pub job_id: Uuid,
    pub category: String,
    pub category_name: String,
    pub file_name: String,
    pub credits_used: f64,
    pub result_files: Vec<String>,
    pub download_ref: Option<String>,
    /// Per-document PDFs the worker produced
    pub files_generated_count: usize,
    pub completed_at: DateTime<Utc>,
}

/// Record of finished work shown back to users.
#[async_trait]
pub trait WorkHistory: Send + Sync {
    async fn record(&self, entry: WorkHistoryEntry) -> Result<()>;
}
