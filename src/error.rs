use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum JobgateError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Unknown work category: {0}")]
    UnknownCategory(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Insufficient credits for user {user_id}: available {available}, required {required}")]
    InsufficientCredits {
        user_id: String,
        available: f64,
        required: f64,
    },

    #[error("Invalid credit amount: {0}")]
    InvalidAmount(f64),

    #[error("Offered {offered} credits for {category}, which costs {price}")]
    CreditsBelowPrice {
        category: String,
        offered: f64,
        price: f64,
    },

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0} is no longer queued and cannot be cancelled")]
    NotCancellable(Uuid),

    #[error("Invalid result file reference: {0}")]
    InvalidResultRef(String),

    #[error("Job store is at capacity")]
    StoreFull,

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid category file: {0}")]
    CategoryFile(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JobgateError>;
