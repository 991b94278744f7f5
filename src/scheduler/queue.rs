//! Ordering of queued jobs within a work category.
//!
//! The queue is never materialised: positions are recomputed from the
//! current set of queued jobs every time they are read.

use std::cmp::Ordering;

use crate::scheduler::job::{Job, JobStatus};

/// Total dispatch order: higher priority first, then earlier submission.
/// The job id breaks exact timestamp ties so no two jobs share a rank.
pub fn dispatch_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// The queued job of `category` that should dispatch next.
pub fn next_in_line<'a, I>(jobs: I, category: &str) -> Option<&'a Job>
where
    I: IntoIterator<Item = &'a Job>,
{
    jobs.into_iter()
        .filter(|j| j.status == JobStatus::Queued && j.category == category)
        .min_by(|a, b| dispatch_order(a, b))
}

/// 1-based rank of `job` among the queued jobs of its category.
pub fn queue_position<'a, I>(jobs: I, job: &Job) -> usize
where
    I: IntoIterator<Item = &'a Job>,
{
    let ahead = jobs
        .into_iter()
        .filter(|other| {
            other.id != job.id
                && other.status == JobStatus::Queued
                && other.category == job.category
                && dispatch_order(other, job) == Ordering::Less
        })
        .count();
    ahead + 1
}

/// Queued jobs of `category` in dispatch order.
pub fn queued_in_order<'a, I>(jobs: I, category: &str) -> Vec<&'a Job>
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut queued: Vec<&Job> = jobs
        .into_iter()
        .filter(|j| j.status == JobStatus::Queued && j.category == category)
        .collect();
    queued.sort_by(|a, b| dispatch_order(a, b));
    queued
}
