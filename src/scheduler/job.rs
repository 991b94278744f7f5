use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed edges of the job state machine. `Queued -> Failed` only
    /// happens when a queued job is cancelled before dispatch.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CredentialsMissing,
    CredentialsInvalid,
    Infrastructure,
    Timeout,
    Cancelled,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::CredentialsMissing => "credentials_missing",
            FailureKind::CredentialsInvalid => "credentials_invalid",
            FailureKind::Infrastructure => "infrastructure",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub category: String,
    pub priority: i32,
    pub input_path: PathBuf,
    pub input_file_name: String,
    /// Private to this job; never shared with another job.
    pub output_dir: PathBuf,
    /// Extra worker arguments appended after the job id
    pub extra_args: Vec<String>,
    pub credits_reserved: f64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_files: Vec<String>,
    pub download_ref: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

impl Job {
    pub fn new(
        id: Uuid,
        user_id: String,
        category: String,
        input_path: PathBuf,
        output_dir: PathBuf,
        credits_reserved: f64,
    ) -> Self {
        let input_file_name = input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id,
            user_id,
            category,
            priority: 1,
            input_path,
            input_file_name,
            output_dir,
            extra_args: Vec::new(),
            credits_reserved,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result_files: Vec::new(),
            download_ref: None,
            error: None,
            failure_kind: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Apply a partial update. Fields left `None` are untouched.
    pub fn apply(&mut self, status: JobStatus, update: JobUpdate) {
        self.status = status;
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        if let Some(files) = update.result_files {
            self.result_files = files;
        }
        if update.download_ref.is_some() {
            self.download_ref = update.download_ref;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if update.failure_kind.is_some() {
            self.failure_kind = update.failure_kind;
        }
    }
}

/// Partial field set written alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_files: Option<Vec<String>>,
    pub download_ref: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

impl JobUpdate {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn completed(at: DateTime<Utc>, result_files: Vec<String>, download_ref: Option<String>) -> Self {
        Self {
            completed_at: Some(at),
            result_files: Some(result_files),
            download_ref,
            ..Default::default()
        }
    }

    pub fn failed(at: DateTime<Utc>, kind: FailureKind, message: String) -> Self {
        Self {
            completed_at: Some(at),
            error: Some(message),
            failure_kind: Some(kind),
            ..Default::default()
        }
    }
}
