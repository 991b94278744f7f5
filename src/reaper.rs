use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ReaperConfig;
use crate::error::Result;
use crate::scheduler::{FailureKind, JobStatus, Scheduler};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReapReport {
    pub timed_out: Vec<Uuid>,
    pub refunded: usize,
    pub purged_jobs: usize,
    pub pruned_dirs: usize,
}

/// Periodic safety net for jobs that never reported back, plus
/// housekeeping of old rows and result directories.
pub struct StuckJobReaper {
    scheduler: Scheduler,
    config: ReaperConfig,
}

impl StuckJobReaper {
    pub fn new(scheduler: Scheduler, config: ReaperConfig) -> Self {
        Self { scheduler, config }
    }

    /// Sweep every `interval` until `shutdown` fires. The first sweep runs
    /// one full interval after start.
    pub async fn run(&self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reaper stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(report) => tracing::info!(
                            timed_out = report.timed_out.len(),
                            purged_jobs = report.purged_jobs,
                            pruned_dirs = report.pruned_dirs,
                            "Job cleanup completed"
                        ),
                        Err(e) => tracing::error!(error = %e, "Job cleanup failed"),
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        let store = self.scheduler.store();

        let stale_before = cutoff(self.config.stale_after);
        let stale = store.stale_processing_jobs(stale_before).await?;
        let minutes = self.config.stale_after.as_secs() / 60;
        for job in stale {
            tracing::warn!(job_id = %job.id, started_at = ?job.started_at, "Marking stuck job as failed");
            let refunded = self
                .scheduler
                .fail_and_refund(
                    &job,
                    FailureKind::Timeout,
                    format!("Job timeout - exceeded {} minutes", minutes),
                )
                .await;
            if refunded {
                report.refunded += 1;
            }
            report.timed_out.push(job.id);
            self.scheduler.advance_queue(&job.category).await;
        }

        report.purged_jobs = store
            .purge_completed(cutoff(self.config.completed_retention))
            .await?;
        report.purged_jobs += store
            .purge_failed(cutoff(self.config.failed_retention))
            .await?;

        report.pruned_dirs = self
            .prune_result_dirs(&self.scheduler.config().results_root)
            .await;
        Ok(report)
    }

    /// Remove result directories older than the retention window, except
    /// those of jobs that are still queued or processing.
    async fn prune_result_dirs(&self, root: &Path) -> usize {
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(root = %root.display(), error = %e, "Failed to list results directory");
                }
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut pruned = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            if age <= self.config.result_dir_retention {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if self.belongs_to_live_job(&name).await {
                continue;
            }

            tracing::info!(dir = %name, "Removing old results directory");
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => pruned += 1,
                Err(e) => tracing::warn!(dir = %name, error = %e, "Failed to remove results directory"),
            }
        }
        pruned
    }

    async fn belongs_to_live_job(&self, dir_name: &str) -> bool {
        let Some(job_id) = dir_name
            .strip_prefix("job_")
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            return false;
        };
        match self.scheduler.store().get_job(job_id).await {
            Ok(Some(job)) => matches!(job.status, JobStatus::Queued | JobStatus::Processing),
            Ok(None) => false,
            // Unknown state: keep it.
            Err(_) => true,
        }
    }
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
