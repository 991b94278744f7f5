//! Admission control and dispatch of billable automation jobs.
//!
//! A submitted job is persisted as `queued` and, when an admission slot is
//! free, dispatched at once. Otherwise it waits in the job store until a
//! running job finishes: every slot release is followed by
//! [`Scheduler::advance_queue`] for the finished job's category, which is
//! the only thing that moves queued work forward.
//!
//! # Credits
//!
//! The caller debits the job's credits before [`Scheduler::submit`]. The
//! scheduler gives them back exactly when it wins the `-> failed`
//! transition in the store; a job that completes, or that some other actor
//! already failed, is never refunded here.
//!
//! # Constraints
//!
//! Admission slots live in this process only. Running two schedulers
//! against one store would let each admit `max_concurrent` jobs.

pub mod job;
pub mod queue;
pub mod slots;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{JobgateError, Result};
use crate::store::{JobStore, Ledger, WorkHistory, WorkHistoryEntry};
use crate::worker::results::{supplementary_pdf_count, ResultLocator, SUPPLEMENTARY_DIR};
use crate::worker::{WorkerInvoker, WorkerOutcome};

pub use job::{FailureKind, Job, JobStatus, JobUpdate};
pub use slots::{AdmissionSlots, SlotGuard};

// Bounded so a job whose claim keeps failing cannot spin a release forever.
const MAX_CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub user_id: String,
    pub category: String,
    pub input_path: PathBuf,
    /// Display name of the upload; defaults to the input path's file name
    pub input_file_name: Option<String>,
    pub priority: Option<i32>,
    /// Credits already debited for this job
    pub credits: f64,
    pub extra_args: Vec<String>,
}

impl SubmitRequest {
    pub fn new(user_id: &str, category: &str, input_path: impl Into<PathBuf>, credits: f64) -> Self {
        Self {
            user_id: user_id.to_string(),
            category: category.to_string(),
            input_path: input_path.into(),
            input_file_name: None,
            priority: None,
            credits,
            extra_args: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// What the submitter learns about a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub job_id: Uuid,
    pub admitted: bool,
    /// 0 when admitted, otherwise the 1-based rank in the category queue
    pub queue_position: usize,
}

impl Submission {
    pub fn status(&self) -> JobStatus {
        if self.admitted {
            JobStatus::Processing
        } else {
            JobStatus::Queued
        }
    }
}

/// Read-side projection of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub category: String,
    pub input_file_name: String,
    pub queue_position: Option<usize>,
    pub progress_percent: Option<u8>,
    pub result_files: Vec<String>,
    pub download_ref: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub processing_count: usize,
    pub ceiling: usize,
    pub active_job_ids: Vec<Uuid>,
}

/// Elapsed-time progress heuristic, held below 100 until completion.
pub fn estimate_progress(elapsed: Duration, estimated: Duration, cap: u8) -> u8 {
    if estimated.is_zero() {
        return cap;
    }
    let percent = elapsed.as_secs_f64() / estimated.as_secs_f64() * 100.0;
    percent.floor().min(f64::from(cap)) as u8
}

pub fn download_ref(job_id: Uuid, file: &str) -> String {
    format!("/api/download/job/{}/{}", job_id, file)
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    history: Arc<dyn WorkHistory>,
    invoker: WorkerInvoker,
    locator: ResultLocator,
    slots: AdmissionSlots,
}

/// Cheap to clone; all clones share one slot set.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn Ledger>,
        history: Arc<dyn WorkHistory>,
        invoker: WorkerInvoker,
    ) -> Self {
        let slots = AdmissionSlots::new(config.max_concurrent);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                ledger,
                history,
                invoker,
                locator: ResultLocator::new(),
                slots,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn slots(&self) -> &AdmissionSlots {
        &self.inner.slots
    }

    /// Persist a queued job and start it right away if a slot is free.
    /// Never waits for the worker.
    ///
    /// On `Err` the caller's charge has not been touched and the job, if it
    /// was persisted at all, has been withdrawn.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission> {
        if self.inner.config.category(&request.category).is_none() {
            return Err(JobgateError::UnknownCategory(request.category));
        }

        let job_id = Uuid::new_v4();
        let output_dir = self
            .inner
            .config
            .results_root
            .join(format!("job_{}", job_id));
        tokio::fs::create_dir_all(output_dir.join(SUPPLEMENTARY_DIR)).await?;

        let mut job = Job::new(
            job_id,
            request.user_id,
            request.category,
            request.input_path,
            output_dir,
            request.credits,
        )
        .with_priority(request.priority.unwrap_or(self.inner.config.default_priority));
        if let Some(name) = request.input_file_name {
            job.input_file_name = name;
        }
        job.extra_args = request.extra_args;

        if let Err(e) = self.inner.store.create_job(job.clone()).await {
            if let Err(rm) = tokio::fs::remove_dir_all(&job.output_dir).await {
                tracing::warn!(job_id = %job_id, error = %rm, "Failed to remove output directory");
            }
            return Err(e);
        }
        tracing::info!(
            job_id = %job_id,
            user_id = %job.user_id,
            category = %job.category,
            priority = job.priority,
            credits = job.credits_reserved,
            "Job submitted"
        );

        if self.try_dispatch(job).await {
            return Ok(Submission {
                job_id,
                admitted: true,
                queue_position: 0,
            });
        }

        let queue_position = match self.inner.store.queue_position(job_id).await {
            Ok(position) => position,
            Err(e) => return self.withdraw_unranked(job_id, e).await,
        };
        // Position 0 here means a release dispatched the job in between.
        let admitted = queue_position == 0
            && matches!(
                self.inner.store.get_job(job_id).await,
                Ok(Some(ref j)) if j.status != JobStatus::Queued
            );
        tracing::info!(job_id = %job_id, queue_position, admitted, "Job queued");
        Ok(Submission {
            job_id,
            admitted,
            queue_position,
        })
    }

    /// Take back a queued job whose rank could not be read, so no caller is
    /// told a position that was never computed. The error goes back to the
    /// submitter, who still holds the charge; nothing is refunded here.
    async fn withdraw_unranked(&self, job_id: Uuid, cause: JobgateError) -> Result<Submission> {
        tracing::warn!(job_id = %job_id, error = %cause, "Failed to compute queue position, withdrawing job");
        let update = JobUpdate::failed(
            Utc::now(),
            FailureKind::Cancelled,
            "Job withdrawn at submission".to_string(),
        );
        match self
            .inner
            .store
            .update_job_status(job_id, JobStatus::Failed, update)
            .await
        {
            Ok(_) => Err(cause),
            // A release dispatched it in between.
            Err(JobgateError::InvalidTransition { .. }) => Ok(Submission {
                job_id,
                admitted: true,
                queue_position: 0,
            }),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to withdraw unranked job");
                Err(cause)
            }
        }
    }

    /// Claim a slot and the `queued -> processing` transition for `job`,
    /// then run its worker in the background. Returns false when either
    /// claim fails.
    async fn try_dispatch(&self, job: Job) -> bool {
        let Some(slot) = self.inner.slots.try_acquire(job.id) else {
            return false;
        };

        let job = match self
            .inner
            .store
            .update_job_status(job.id, JobStatus::Processing, JobUpdate::started(Utc::now()))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Could not claim job for dispatch");
                return false;
            }
        };

        tracing::info!(
            job_id = %job.id,
            category = %job.category,
            active = self.inner.slots.len(),
            ceiling = self.inner.slots.ceiling(),
            "Job dispatched"
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_job(job, slot).await;
        });
        true
    }

    /// Owns the slot for the whole run. The worker executes in its own task
    /// so that a panic there still reaches the release and advance below.
    ///
    /// Boxed because dispatch and queue advancement call each other.
    fn run_job(self, job: Job, slot: SlotGuard) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.run_job_inner(job, slot).await })
    }

    async fn run_job_inner(self, job: Job, slot: SlotGuard) {
        let category = job.category.clone();

        let worker = {
            let scheduler = self.clone();
            let job = job.clone();
            tokio::spawn(async move { scheduler.execute(&job).await })
        };
        if let Err(e) = worker.await {
            tracing::error!(job_id = %job.id, error = %e, "Worker task aborted");
            self.fail_and_refund(
                &job,
                FailureKind::Unknown,
                "Internal error while running the job".to_string(),
            )
            .await;
        }

        drop(slot);
        if self.advance_queue(&category).await.is_none() {
            self.advance_all().await;
        }
    }

    async fn execute(&self, job: &Job) {
        let outcome = match self.inner.config.category(&job.category) {
            Some(category) => self.inner.invoker.invoke(job, category).await,
            None => WorkerOutcome::Failure {
                kind: FailureKind::Unknown,
                message: format!("No worker configured for category {}", job.category),
            },
        };

        match outcome {
            WorkerOutcome::Success { .. } => self.complete(job).await,
            WorkerOutcome::InvalidCredentials { message } => {
                self.fail_and_refund(job, FailureKind::CredentialsInvalid, message)
                    .await;
            }
            WorkerOutcome::Failure { kind, message } => {
                self.fail_and_refund(job, kind, message).await;
            }
        }
    }

    async fn complete(&self, job: &Job) {
        let files = self.inner.locator.locate(&job.output_dir).await;
        let download = files.first().map(|f| download_ref(job.id, f));
        let update = JobUpdate::completed(Utc::now(), files.clone(), download.clone());

        let completed = match self
            .inner
            .store
            .update_job_status(job.id, JobStatus::Completed, update)
            .await
        {
            Ok(completed) => completed,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record job completion");
                return;
            }
        };
        tracing::info!(
            job_id = %job.id,
            result_files = ?files,
            download = ?download,
            "Job completed"
        );
        self.record_history(completed).await;
    }

    /// History is informational: a failure here never touches the job.
    async fn record_history(&self, job: Job) {
        let category_name = self
            .inner
            .config
            .category(&job.category)
            .map_or_else(|| job.category.clone(), |c| c.name.clone());
        let entry = WorkHistoryEntry {
            user_id: job.user_id,
            job_id: job.id,
            category: job.category,
            category_name,
            file_name: job.input_file_name,
            credits_used: job.credits_reserved,
            files_generated_count: supplementary_pdf_count(&job.result_files),
            result_files: job.result_files,
            download_ref: job.download_ref,
            completed_at: job.completed_at.unwrap_or_else(Utc::now),
        };
        if let Err(e) = self.inner.history.record(entry).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to create work history entry");
        }
    }

    /// Move `job` to failed and refund its credits. Returns whether a
    /// refund was attempted.
    ///
    /// The refund is skipped only when the store says the job is already
    /// terminal; whoever made that transition owns the refund. If the store
    /// cannot be reached the refund still goes out, so an outage can at
    /// worst duplicate a refund, never drop one silently.
    pub async fn fail_and_refund(&self, job: &Job, kind: FailureKind, message: String) -> bool {
        let update = JobUpdate::failed(Utc::now(), kind, message.clone());
        let refund = match self
            .inner
            .store
            .update_job_status(job.id, JobStatus::Failed, update)
            .await
        {
            Ok(_) => {
                tracing::warn!(job_id = %job.id, kind = %kind, error = %message, "Job failed");
                true
            }
            Err(JobgateError::InvalidTransition { from, .. }) => {
                tracing::warn!(job_id = %job.id, status = %from, kind = %kind, "Job already finished, failure ignored");
                false
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record job failure, refunding anyway");
                true
            }
        };

        if refund {
            if let Err(e) = self
                .inner
                .ledger
                .credit(&job.user_id, job.credits_reserved)
                .await
            {
                tracing::error!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    credits = job.credits_reserved,
                    error = %e,
                    "Credit refund failed"
                );
            }
        }
        refund
    }

    /// Dispatch the next queued job of `category` if a slot is free.
    pub async fn advance_queue(&self, category: &str) -> Option<Uuid> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            if !self.inner.slots.has_capacity() {
                return None;
            }
            let next = match self.inner.store.next_queued_job(category).await {
                Ok(Some(job)) => job,
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!(category, error = %e, "Failed to fetch next queued job");
                    return None;
                }
            };
            let job_id = next.id;
            if self.try_dispatch(next).await {
                return Some(job_id);
            }
            tokio::task::yield_now().await;
        }
        None
    }

    /// Fill free slots from every configured category, oldest queue head
    /// first. Keeps a category with nothing running from waiting forever
    /// behind slots released by other categories.
    pub async fn advance_all(&self) -> usize {
        let mut dispatched = 0;
        while self.inner.slots.has_capacity() {
            let mut heads = Vec::new();
            for category in &self.inner.config.categories {
                match self.inner.store.next_queued_job(&category.id).await {
                    Ok(Some(job)) => heads.push(job),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(category = %category.id, error = %e, "Failed to fetch next queued job");
                    }
                }
            }
            let Some(oldest) = heads.into_iter().min_by_key(|j| (j.created_at, j.id)) else {
                break;
            };
            if self.advance_queue(&oldest.category).await.is_none() {
                break;
            }
            dispatched += 1;
        }
        dispatched
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobView> {
        let job = self
            .inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobgateError::JobNotFound(job_id))?;
        self.view(job).await
    }

    async fn view(&self, job: Job) -> Result<JobView> {
        let queue_position = match job.status {
            JobStatus::Queued => Some(self.inner.store.queue_position(job.id).await?),
            _ => None,
        };
        let progress_percent = match job.status {
            JobStatus::Processing => Some(job.started_at.map_or(0, |started| {
                let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
                estimate_progress(
                    elapsed,
                    self.inner.config.estimated_duration,
                    self.inner.config.progress_cap,
                )
            })),
            JobStatus::Completed => Some(100),
            JobStatus::Queued | JobStatus::Failed => None,
        };

        Ok(JobView {
            job_id: job.id,
            status: job.status,
            category: job.category,
            input_file_name: job.input_file_name,
            queue_position,
            progress_percent,
            result_files: job.result_files,
            download_ref: job.download_ref,
            error: job.error,
            failure_kind: job.failure_kind,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        })
    }

    /// Most recent jobs of a user, newest first.
    pub async fn user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<JobView>> {
        let jobs = self.inner.store.user_jobs(user_id, limit).await?;
        let mut views = Vec::with_capacity(jobs.len());
        for job in jobs {
            views.push(self.view(job).await?);
        }
        Ok(views)
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            processing_count: self.inner.slots.len(),
            ceiling: self.inner.slots.ceiling(),
            active_job_ids: self.inner.slots.active(),
        }
    }

    /// Withdraw a job that has not been dispatched yet and refund it.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let job = self
            .inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobgateError::JobNotFound(job_id))?;
        if job.status != JobStatus::Queued {
            return Err(JobgateError::NotCancellable(job_id));
        }

        let update = JobUpdate::failed(
            Utc::now(),
            FailureKind::Cancelled,
            "Job cancelled before it started".to_string(),
        );
        match self
            .inner
            .store
            .update_job_status(job_id, JobStatus::Failed, update)
            .await
        {
            Ok(_) => {}
            // Lost the race against dispatch.
            Err(JobgateError::InvalidTransition { .. }) => {
                return Err(JobgateError::NotCancellable(job_id))
            }
            Err(e) => return Err(e),
        }

        tracing::info!(job_id = %job_id, user_id = %job.user_id, "Queued job cancelled");
        if let Err(e) = self
            .inner
            .ledger
            .credit(&job.user_id, job.credits_reserved)
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Credit refund failed");
        }
        Ok(())
    }

    /// Path of one result file of a job.
    pub async fn result_file(&self, job_id: Uuid, reference: &str) -> Result<PathBuf> {
        let job = self
            .inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobgateError::JobNotFound(job_id))?;
        self.inner
            .locator
            .resolve(&job.output_dir, reference)
            .ok_or_else(|| JobgateError::InvalidResultRef(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_capped_below_completion() {
        let est = Duration::from_secs(30);
        assert_eq!(estimate_progress(Duration::ZERO, est, 95), 0);
        assert_eq!(estimate_progress(Duration::from_secs(15), est, 95), 50);
        assert_eq!(estimate_progress(Duration::from_secs(28), est, 95), 93);
        assert_eq!(estimate_progress(Duration::from_secs(29), est, 95), 95);
        assert_eq!(estimate_progress(Duration::from_secs(600), est, 95), 95);
        assert_eq!(estimate_progress(Duration::from_secs(1), Duration::ZERO, 95), 95);
    }

    #[test]
    fn submission_status_follows_admission() {
        let admitted = Submission {
            job_id: Uuid::new_v4(),
            admitted: true,
            queue_position: 0,
        };
        assert_eq!(admitted.status(), JobStatus::Processing);

        let queued = Submission {
            admitted: false,
            queue_position: 2,
            ..admitted
        };
        assert_eq!(queued.status(), JobStatus::Queued);
    }

    #[test]
    fn download_ref_format() {
        let id = Uuid::nil();
        assert_eq!(
            download_ref(id, "pdfs/a.pdf"),
            "/api/download/job/00000000-0000-0000-0000-000000000000/pdfs/a.pdf"
        );
    }
}
