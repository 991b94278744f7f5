//! End-to-end admission, dispatch and refund behaviour of the scheduler,
//! driven through real worker processes.


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobgate::error::{JobgateError, Result};
use jobgate::scheduler::{FailureKind, Job, JobStatus, JobUpdate, SubmitRequest};
use jobgate::store::{JobStore, Ledger, MemoryJobStore};
use uuid::Uuid;
use test_harness::{assert_close, wait_for, TestEnv, PORTAL, STARTING_BALANCE, USER};

#[tokio::test]
async fn test_jobs_beyond_ceiling_are_queued() {
    let env = TestEnv::new(2).await;

    let a = env.submit("alpha").await;
    let b = env.submit("alpha").await;
    let c = env.submit("alpha").await;

    assert!(a.admitted);
    assert_eq!(a.queue_position, 0);
    assert!(b.admitted);
    assert!(!c.admitted);
    assert_eq!(c.queue_position, 1);
    assert_eq!(c.status(), JobStatus::Queued);

    let queue = env.scheduler.queue_status();
    assert_eq!(queue.processing_count, 2);
    assert_eq!(queue.ceiling, 2);
    assert!(queue.active_job_ids.contains(&a.job_id));
    assert!(queue.active_job_ids.contains(&b.job_id));

    assert_eq!(env.status_of(a.job_id).await, JobStatus::Processing);
    assert_eq!(env.status_of(c.job_id).await, JobStatus::Queued);

    env.release(a.job_id, 0);
    env.release(b.job_id, 0);
    assert!(env.wait_for_status(c.job_id, JobStatus::Processing).await);
    env.release(c.job_id, 0);
    assert!(env.wait_for_status(c.job_id, JobStatus::Completed).await);
    assert!(env.wait_for_idle().await);
}

#[tokio::test]
async fn test_exit_two_fails_only_that_job() {
    let env = TestEnv::new(2).await;

    let j1 = env.submit("alpha").await;
    let j2 = env.submit("alpha").await;
    let j3 = env.submit("alpha").await;
    assert!(j1.admitted && j2.admitted);
    assert_eq!(j3.queue_position, 1);

    env.release(j1.job_id, 0);
    assert!(env.wait_for_status(j3.job_id, JobStatus::Processing).await);
    let view = env.scheduler.status(j3.job_id).await.unwrap();
    assert_eq!(view.queue_position, None);
    assert!(env.scheduler.queue_status().active_job_ids.contains(&j3.job_id));

    env.release(j2.job_id, 2);
    assert!(env.wait_for_status(j2.job_id, JobStatus::Failed).await);
    let failed = env.job(j2.job_id).await;
    assert_eq!(failed.failure_kind, Some(FailureKind::CredentialsInvalid));
    assert!(failed.error.as_deref().unwrap().contains("Invalid portal credentials"));

    env.release(j3.job_id, 0);
    assert!(env.wait_for_status(j3.job_id, JobStatus::Completed).await);
    assert!(env.wait_for_idle().await);

    // One refund, for J2 only.
    assert_eq!(env.ledger.credit_count(USER).await, 1);
    assert_close(env.balance().await, STARTING_BALANCE - 2.0);
}

#[tokio::test]
async fn test_completion_dispatches_next_queued_job() {
    let env = TestEnv::new(2).await;

    let a = env.submit("alpha").await;
    let _b = env.submit("alpha").await;
    let c = env.submit("alpha").await;
    assert!(!c.admitted);

    env.release(a.job_id, 0);
    assert!(env.wait_for_status(a.job_id, JobStatus::Completed).await);
    assert!(env.wait_for_status(c.job_id, JobStatus::Processing).await);

    let done = env.job(a.job_id).await;
    assert_eq!(
        done.result_files,
        vec![
            "summary_report_1.pdf".to_string(),
            "pdfs/doc_1.pdf".to_string()
        ]
    );
    assert_eq!(
        done.download_ref.as_deref(),
        Some(format!("/api/download/job/{}/summary_report_1.pdf", a.job_id).as_str())
    );
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert!(done.error.is_none());

    let view = env.scheduler.status(a.job_id).await.unwrap();
    assert_eq!(view.progress_percent, Some(100));
    assert_eq!(view.queue_position, None);

    // Completed work is paid for: only the debits remain.
    assert_eq!(env.ledger.credit_count(USER).await, 0);
}

#[tokio::test]
async fn test_failed_job_refunds_exactly_once() {
    let env = TestEnv::new(2).await;

    let job = env.submit("beta").await;
    assert_close(env.balance().await, STARTING_BALANCE - 2.0);

    env.release(job.job_id, 1);
    assert!(env.wait_for_status(job.job_id, JobStatus::Failed).await);
    assert!(env.wait_for_idle().await);

    let failed = env.job(job.job_id).await;
    assert_eq!(failed.error.as_deref(), Some("worker failed with 1"));
    assert_eq!(failed.failure_kind, Some(FailureKind::Unknown));
    assert!(failed.completed_at.is_some());

    assert_close(env.balance().await, STARTING_BALANCE);
    assert_eq!(env.ledger.credit_count(USER).await, 1);

    // A late second failure report must not pay out again.
    let refunded = env
        .scheduler
        .fail_and_refund(&failed, FailureKind::Timeout, "late".to_string())
        .await;
    assert!(!refunded);
    assert_eq!(env.ledger.credit_count(USER).await, 1);
    assert_eq!(env.status_of(job.job_id).await, JobStatus::Failed);
}

#[tokio::test]
async fn test_completed_job_is_never_failed_or_refunded() {
    let env = TestEnv::new(1).await;

    let job = env.submit("alpha").await;
    env.release(job.job_id, 0);
    assert!(env.wait_for_status(job.job_id, JobStatus::Completed).await);

    let done = env.job(job.job_id).await;
    let refunded = env
        .scheduler
        .fail_and_refund(&done, FailureKind::Timeout, "stuck".to_string())
        .await;

    assert!(!refunded);
    assert_eq!(env.status_of(job.job_id).await, JobStatus::Completed);
    assert_eq!(env.ledger.credit_count(USER).await, 0);
    assert_close(env.balance().await, STARTING_BALANCE - 1.0);
}

#[tokio::test]
async fn test_higher_priority_dispatched_first() {
    let env = TestEnv::new(1).await;

    let running = env.submit("alpha").await;
    let low = env.submit_with("alpha", Some(1), Vec::new()).await;
    let high = env.submit_with("alpha", Some(5), Vec::new()).await;

    assert_eq!(low.queue_position, 1);
    assert_eq!(high.queue_position, 1);
    // The later, more urgent job overtook the earlier one.
    assert_eq!(
        env.scheduler.status(low.job_id).await.unwrap().queue_position,
        Some(2)
    );

    env.release(running.job_id, 0);
    assert!(env.wait_for_status(high.job_id, JobStatus::Processing).await);
    assert_eq!(env.status_of(low.job_id).await, JobStatus::Queued);
    assert_eq!(
        env.scheduler.status(low.job_id).await.unwrap().queue_position,
        Some(1)
    );

    env.release(high.job_id, 0);
    assert!(env.wait_for_status(low.job_id, JobStatus::Processing).await);
    env.release(low.job_id, 0);
    assert!(env.wait_for_status(low.job_id, JobStatus::Completed).await);
}

#[tokio::test]
async fn test_equal_priority_runs_in_submission_order() {
    let env = TestEnv::new(1).await;

    let running = env.submit("alpha").await;
    let first = env.submit("alpha").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = env.submit("alpha").await;
    assert_eq!(first.queue_position, 1);
    assert_eq!(second.queue_position, 2);

    env.release(running.job_id, 0);
    assert!(env.wait_for_status(first.job_id, JobStatus::Processing).await);
    assert_eq!(env.status_of(second.job_id).await, JobStatus::Queued);

    env.release(first.job_id, 0);
    env.release(second.job_id, 0);
    assert!(env.wait_for_status(second.job_id, JobStatus::Completed).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_ceiling() {
    let env = TestEnv::new(2).await;

    for _ in 0..6 {
        env.submit("alpha").await;
    }
    assert_eq!(env.store.count_with_status(JobStatus::Processing).await, 2);
    assert_eq!(env.store.count_with_status(JobStatus::Queued).await, 4);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while env.store.count_with_status(JobStatus::Completed).await < 6 {
        assert!(tokio::time::Instant::now() < deadline, "jobs did not drain");
        assert!(env.scheduler.slots().len() <= 2);
        assert!(env.store.count_with_status(JobStatus::Processing).await <= 2);

        for id in env.scheduler.queue_status().active_job_ids {
            if env.status_of(id).await == JobStatus::Processing {
                env.release(id, 0);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(env.wait_for_idle().await);
    assert_eq!(env.store.count_with_status(JobStatus::Queued).await, 0);
}

#[tokio::test]
async fn test_idle_category_is_not_starved_by_other_releases() {
    let env = TestEnv::new(2).await;

    let a1 = env.submit("alpha").await;
    let a2 = env.submit("alpha").await;
    let b = env.submit("beta").await;
    assert!(!b.admitted);

    // Alpha has nothing queued, so its release must pick up beta work.
    env.release(a1.job_id, 0);
    assert!(env.wait_for_status(b.job_id, JobStatus::Processing).await);

    env.release(a2.job_id, 0);
    env.release(b.job_id, 0);
    assert!(env.wait_for_status(b.job_id, JobStatus::Completed).await);
}

#[tokio::test]
async fn test_unknown_category_is_rejected_without_a_record() {
    let env = TestEnv::new(2).await;

    let err = env
        .scheduler
        .submit(SubmitRequest::new(USER, "nope", "/tmp/in.xlsx", 1.0))
        .await
        .unwrap_err();

    assert!(matches!(err, JobgateError::UnknownCategory(ref c) if c == "nope"));
    assert!(env.store.is_empty().await);
}

#[tokio::test]
async fn test_cancel_queued_job_refunds() {
    let env = TestEnv::new(1).await;

    let running = env.submit("alpha").await;
    let queued = env.submit("beta").await;
    assert_close(env.balance().await, STARTING_BALANCE - 3.0);

    env.scheduler.cancel(queued.job_id).await.unwrap();

    let cancelled = env.job(queued.job_id).await;
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.failure_kind, Some(FailureKind::Cancelled));
    assert_close(env.balance().await, STARTING_BALANCE - 1.0);

    // Running and finished jobs cannot be withdrawn.
    let err = env.scheduler.cancel(running.job_id).await.unwrap_err();
    assert!(matches!(err, JobgateError::NotCancellable(_)));
    let err = env.scheduler.cancel(queued.job_id).await.unwrap_err();
    assert!(matches!(err, JobgateError::NotCancellable(_)));
    assert_eq!(env.ledger.credit_count(USER).await, 1);

    // The cancelled job must not be dispatched when the slot frees up.
    env.release(running.job_id, 0);
    assert!(env.wait_for_idle().await);
    assert_eq!(env.status_of(queued.job_id).await, JobStatus::Failed);
}

#[tokio::test]
async fn test_missing_credentials_fail_without_running_worker() {
    let env = TestEnv::new(2).await;

    let job = env.submit("portal").await;
    assert!(env.wait_for_status(job.job_id, JobStatus::Failed).await);

    let failed = env.job(job.job_id).await;
    assert_eq!(failed.failure_kind, Some(FailureKind::CredentialsMissing));
    assert!(failed
        .error
        .as_deref()
        .unwrap()
        .contains("Portal credentials not configured"));
    assert!(!failed.output_dir.join("args.txt").exists());
    assert!(env.wait_for_idle().await);
    assert_close(env.balance().await, STARTING_BALANCE);
}

#[tokio::test]
async fn test_rejected_credentials_notify_and_refund() {
    let env = TestEnv::new(2).await;
    env.credentials.save(USER, PORTAL, "exporter", "bad").await;

    let job = env.submit("portal").await;
    assert!(env.wait_for_status(job.job_id, JobStatus::Failed).await);

    let failed = env.job(job.job_id).await;
    assert_eq!(failed.failure_kind, Some(FailureKind::CredentialsInvalid));
    assert!(env.wait_for_idle().await);
    assert_close(env.balance().await, STARTING_BALANCE);

    let notified = wait_for(
        || async { !env.notifier.sent().await.is_empty() },
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await;
    assert!(notified);
    let sent = env.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, "credential_failure");
    assert_eq!(sent[0].portal.as_deref(), Some(PORTAL));
    assert_eq!(sent[0].job_id, Some(job.job_id));

    let recorded = wait_for(
        || async { env.credentials.failure_count(USER, PORTAL).await == 1 },
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await;
    assert!(recorded);
    assert_eq!(env.credentials.last_test_success(USER, PORTAL).await, Some(false));
}

#[tokio::test]
async fn test_valid_credentials_reach_the_worker() {
    let env = TestEnv::new(2).await;
    env.credentials.save(USER, PORTAL, "exporter", "s3cret").await;

    let job = env.submit("portal").await;
    assert!(env.wait_for_status(job.job_id, JobStatus::Completed).await);

    let done = env.job(job.job_id).await;
    let args = std::fs::read_to_string(done.output_dir.join("args.txt")).unwrap();
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(args[0], "/tmp/input.xlsx");
    assert_eq!(args[2], job.job_id.to_string());
    assert_eq!(&args[3..], &["exporter", "s3cret"]);
    assert_eq!(done.result_files, vec!["result.json".to_string()]);
    assert!(env.notifier.sent().await.is_empty());
}

#[tokio::test]
async fn test_worker_timeout_fails_job_and_frees_slot() {
    let env = TestEnv::with_timeout(1, Duration::from_secs(1)).await;

    let slow = env.submit("slow").await;
    let next = env.submit("alpha").await;
    assert!(!next.admitted);

    assert!(env.wait_for_status(slow.job_id, JobStatus::Failed).await);
    let failed = env.job(slow.job_id).await;
    assert_eq!(failed.failure_kind, Some(FailureKind::Timeout));

    assert!(env.wait_for_status(next.job_id, JobStatus::Processing).await);
    env.release(next.job_id, 0);
    assert!(env.wait_for_status(next.job_id, JobStatus::Completed).await);
    assert_eq!(env.ledger.credit_count(USER).await, 1);
}

#[tokio::test]
async fn test_user_jobs_newest_first() {
    let env = TestEnv::new(1).await;

    let first = env.submit("alpha").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = env.submit("alpha").await;

    let jobs = env.scheduler.user_jobs(USER, 20).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].job_id, second.job_id);
    assert_eq!(jobs[0].queue_position, Some(1));
    assert_eq!(jobs[1].job_id, first.job_id);
    assert!(jobs[1].progress_percent.is_some());

    assert!(env.scheduler.user_jobs("someone-else", 20).await.unwrap().is_empty());
    env.release(first.job_id, 0);
    assert!(env.wait_for_status(second.job_id, JobStatus::Processing).await);
    env.release(second.job_id, 0);
    assert!(env.wait_for_status(second.job_id, JobStatus::Completed).await);
}

#[tokio::test]
async fn test_status_of_unknown_job() {
    let env = TestEnv::new(1).await;
    let err = env.scheduler.status(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, JobgateError::JobNotFound(_)));
}

#[tokio::test]
async fn test_fractional_credits_are_refunded_exactly() {
    let env = TestEnv::new(2).await;

    let ok = env
        .submit_with("exit", None, vec!["0".to_string()])
        .await;
    let failed = env
        .submit_with("exit", None, vec!["3".to_string(), "boom".to_string()])
        .await;

    assert!(env.wait_for_status(ok.job_id, JobStatus::Completed).await);
    assert!(env.wait_for_status(failed.job_id, JobStatus::Failed).await);
    assert!(env.wait_for_idle().await);

    let done = env.job(ok.job_id).await;
    assert!(done.result_files.is_empty());
    assert!(done.download_ref.is_none());

    let failed = env.job(failed.job_id).await;
    assert_eq!(failed.error.as_deref(), Some("boom"));
    assert_close(env.balance().await, STARTING_BALANCE - 0.5);
}

#[tokio::test]
async fn test_completed_job_is_recorded_in_work_history() {
    let env = TestEnv::new(2).await;

    let ok = env.submit("alpha").await;
    let bad = env.submit("beta").await;
    env.release(ok.job_id, 0);
    env.release(bad.job_id, 4);
    assert!(env.wait_for_status(ok.job_id, JobStatus::Completed).await);
    assert!(env.wait_for_status(bad.job_id, JobStatus::Failed).await);
    assert!(env.wait_for_idle().await);

    let entries = env.history.entries().await;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.job_id, ok.job_id);
    assert_eq!(entry.user_id, USER);
    assert_eq!(entry.category, "alpha");
    assert_eq!(entry.category_name, "Alpha Tracking");
    assert_eq!(entry.file_name, "input.xlsx");
    assert_close(entry.credits_used, 1.0);
    assert_eq!(entry.result_files, vec!["summary_report_1.pdf", "pdfs/doc_1.pdf"]);
    assert_eq!(entry.files_generated_count, 1);
    assert_eq!(entry.download_ref, env.job(ok.job_id).await.download_ref);
}

/// Memory store whose queue ranking is unavailable.
struct UnrankedStore(Arc<MemoryJobStore>);

#[async_trait]
impl JobStore for UnrankedStore {
    async fn create_job(&self, job: Job) -> Result<()> {
        self.0.create_job(job).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.0.get_job(job_id).await
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        update: JobUpdate,
    ) -> Result<Job> {
        self.0.update_job_status(job_id, status, update).await
    }

    async fn next_queued_job(&self, category: &str) -> Result<Option<Job>> {
        self.0.next_queued_job(category).await
    }

    async fn queue_position(&self, _job_id: Uuid) -> Result<usize> {
        Err(JobgateError::Store("ranking unavailable".to_string()))
    }

    async fn stale_processing_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>> {
        self.0.stale_processing_jobs(started_before).await
    }

    async fn purge_completed(&self, completed_before: DateTime<Utc>) -> Result<usize> {
        self.0.purge_completed(completed_before).await
    }

    async fn purge_failed(&self, failed_before: DateTime<Utc>) -> Result<usize> {
        self.0.purge_failed(failed_before).await
    }

    async fn user_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<Job>> {
        self.0.user_jobs(user_id, limit).await
    }
}

#[tokio::test]
async fn test_unranked_queued_job_is_withdrawn() {
    let env = TestEnv::with_store(1, |store| {
        Arc::new(UnrankedStore(store)) as Arc<dyn JobStore>
    })
    .await;

    let running = env.submit("alpha").await;
    assert!(running.admitted);

    env.ledger.debit(USER, 1.0).await.unwrap();
    let err = env
        .scheduler
        .submit(SubmitRequest::new(USER, "alpha", "/tmp/input.xlsx", 1.0))
        .await
        .unwrap_err();
    assert!(matches!(err, JobgateError::Store(_)));

    let withdrawn = env
        .store
        .all_jobs()
        .await
        .into_iter()
        .find(|j| j.id != running.job_id)
        .expect("withdrawn job should be kept");
    assert_eq!(withdrawn.status, JobStatus::Failed);
    assert_eq!(withdrawn.failure_kind, Some(FailureKind::Cancelled));
    // The charge is the submitter's to undo.
    assert_eq!(env.ledger.credit_count(USER).await, 0);

    env.release(running.job_id, 0);
    assert!(env.wait_for_status(running.job_id, JobStatus::Completed).await);
    assert!(env.wait_for_idle().await);
    assert_eq!(env.store.count_with_status(JobStatus::Processing).await, 0);
}
