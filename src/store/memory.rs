use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{JobgateError, Result};
use crate::scheduler::job::{Job, JobStatus, JobUpdate};
use crate::scheduler::queue;
use crate::store::{
    CredentialStore, JobStore, Ledger, Notification, Notifier, PortalCredentials, WorkHistory,
    WorkHistoryEntry,
};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Job table kept in process memory.
#[derive(Debug)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    max_jobs: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs,
        }
    }

    /// All jobs sorted chronologically by creation time
    pub async fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    async fn purge(&self, status: JobStatus, finished_before: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status == status && job.completed_at.is_some_and(|done| done < finished_before))
        });
        before - jobs.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.len() >= self.max_jobs {
            return Err(JobgateError::StoreFull);
        }
        if jobs.contains_key(&job.id) {
            return Err(JobgateError::Store(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        update: JobUpdate,
    ) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(JobgateError::JobNotFound(job_id))?;
        if !job.status.can_transition_to(status) {
            return Err(JobgateError::InvalidTransition {
                job_id,
                from: job.status,
                to: status,
            });
        }
        job.apply(status, update);
        Ok(job.clone())
    }

    async fn next_queued_job(&self, category: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.read().await;
        Ok(queue::next_in_line(jobs.values(), category).cloned())
    }

    async fn queue_position(&self, job_id: Uuid) -> Result<usize> {
        let jobs = self.jobs.read().await;
        match jobs.get(&job_id) {
            Some(job) if job.status == JobStatus::Queued => {
                Ok(queue::queue_position(jobs.values(), job))
            }
            _ => Ok(0),
        }
    }

    async fn stale_processing_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut stale: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.is_some_and(|started| started < started_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.started_at);
        Ok(stale)
    }

    async fn purge_completed(&self, completed_before: DateTime<Utc>) -> Result<usize> {
        Ok(self.purge(JobStatus::Completed, completed_before).await)
    }

    async fn purge_failed(&self, failed_before: DateTime<Utc>) -> Result<usize> {
        Ok(self.purge(JobStatus::Failed, failed_before).await)
    }

    async fn user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut mine: Vec<Job> = jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        mine.truncate(limit);
        Ok(mine)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Debit,
    Credit,
}

/// One ledger movement, kept so balances can be audited.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub user_id: String,
    pub kind: EntryKind,
    pub amount: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, f64>,
    entries: Vec<LedgerEntry>,
}

/// Credit balances kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_account(&self, user_id: &str, balance: f64) {
        self.state
            .lock()
            .await
            .balances
            .insert(user_id.to_string(), balance);
    }

    pub async fn balance(&self, user_id: &str) -> Option<f64> {
        self.state.lock().await.balances.get(user_id).copied()
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.entries.clone()
    }

    /// Number of credit (refund) movements recorded for a user.
    pub async fn credit_count(&self, user_id: &str) -> usize {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::Credit && e.user_id == user_id)
            .count()
    }
}

fn check_amount(amount: f64) -> Result<()> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(JobgateError::InvalidAmount(amount))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn debit(&self, user_id: &str, amount: f64) -> Result<f64> {
        check_amount(amount)?;
        let mut state = self.state.lock().await;
        let balance = state
            .balances
            .get_mut(user_id)
            .ok_or_else(|| JobgateError::UserNotFound(user_id.to_string()))?;
        if *balance < amount {
            return Err(JobgateError::InsufficientCredits {
                user_id: user_id.to_string(),
                available: *balance,
                required: amount,
            });
        }
        *balance -= amount;
        let new_balance = *balance;
        state.entries.push(LedgerEntry {
            user_id: user_id.to_string(),
            kind: EntryKind::Debit,
            amount,
            at: Utc::now(),
        });
        Ok(new_balance)
    }

    async fn credit(&self, user_id: &str, amount: f64) -> Result<f64> {
        check_amount(amount)?;
        let mut state = self.state.lock().await;
        let balance = state
            .balances
            .get_mut(user_id)
            .ok_or_else(|| JobgateError::UserNotFound(user_id.to_string()))?;
        *balance += amount;
        let new_balance = *balance;
        state.entries.push(LedgerEntry {
            user_id: user_id.to_string(),
            kind: EntryKind::Credit,
            amount,
            at: Utc::now(),
        });
        tracing::info!(user_id, amount, balance = new_balance, "Credits refunded");
        Ok(new_balance)
    }
}

#[derive(Debug, Clone)]
struct StoredCredentials {
    credentials: PortalCredentials,
    last_test_success: Option<bool>,
    failure_count: u32,
}

/// Portal logins kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<(String, String), StoredCredentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save(&self, user_id: &str, portal: &str, username: &str, password: &str) {
        self.entries.write().await.insert(
            (user_id.to_string(), portal.to_string()),
            StoredCredentials {
                credentials: PortalCredentials {
                    username: username.to_string(),
                    password: password.to_string(),
                },
                last_test_success: None,
                failure_count: 0,
            },
        );
    }

    pub async fn failure_count(&self, user_id: &str, portal: &str) -> u32 {
        self.entries
            .read()
            .await
            .get(&(user_id.to_string(), portal.to_string()))
            .map(|e| e.failure_count)
            .unwrap_or(0)
    }

    pub async fn last_test_success(&self, user_id: &str, portal: &str) -> Option<bool> {
        self.entries
            .read()
            .await
            .get(&(user_id.to_string(), portal.to_string()))
            .and_then(|e| e.last_test_success)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn portal_credentials(
        &self,
        user_id: &str,
        portal: &str,
    ) -> Result<Option<PortalCredentials>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(user_id.to_string(), portal.to_string()))
            .map(|e| e.credentials.clone()))
    }

    async fn record_test_result(&self, user_id: &str, portal: &str, success: bool) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&(user_id.to_string(), portal.to_string())) {
            entry.last_test_success = Some(success);
            entry.failure_count = if success { 0 } else { entry.failure_count + 1 };
        }
        Ok(())
    }
}

/// Notification feed kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        tracing::info!(
            user_id = %notification.user_id,
            kind = %notification.kind,
            "Notification created"
        );
        self.sent.lock().await.push(notification);
        Ok(())
    }
}

/// Work history kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryWorkHistory {
    entries: Mutex<Vec<WorkHistoryEntry>>,
}

impl MemoryWorkHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<WorkHistoryEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn for_user(&self, user_id: &str) -> Vec<WorkHistoryEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WorkHistory for MemoryWorkHistory {
    async fn record(&self, entry: WorkHistoryEntry) -> Result<()> {
        tracing::info!(
            user_id = %entry.user_id,
            job_id = %entry.job_id,
            files_generated = entry.files_generated_count,
            "Work history entry created"
        );
        self.entries.lock().await.push(entry);
        Ok(())
    }
}
