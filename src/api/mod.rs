use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::JobgateError;
use crate::scheduler::{JobStatus, JobView, QueueStatus, Scheduler, SubmitRequest};
use crate::store::Ledger;

const USER_JOBS_LIMIT: usize = 20;

/// Caller-facing layer: charges credits, then hands work to the scheduler.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
    pub ledger: Arc<dyn Ledger>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub user_id: String,
    pub category: String,
    pub input_path: PathBuf,
    #[serde(default)]
    pub input_file_name: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    /// Charge for the job; may raise the category price, never lower it
    #[serde(default)]
    pub credits: Option<f64>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub queue_position: usize,
    pub new_balance: f64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Wraps scheduler errors so handlers can use `?`.
pub struct ApiError(JobgateError);

impl From<JobgateError> for ApiError {
    fn from(e: JobgateError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            JobgateError::JobNotFound(_) | JobgateError::UserNotFound(_) => StatusCode::NOT_FOUND,
            JobgateError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                StatusCode::NOT_FOUND
            }
            JobgateError::UnknownCategory(_)
            | JobgateError::InvalidAmount(_)
            | JobgateError::CreditsBelowPrice { .. }
            | JobgateError::InvalidResultRef(_) => StatusCode::BAD_REQUEST,
            JobgateError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            JobgateError::NotCancellable(_) | JobgateError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            JobgateError::StoreFull => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                success: false,
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/jobs/{job_id}/status", get(job_status_handler))
        .route("/api/jobs/{job_id}/cancel", post(cancel_job_handler))
        .route("/api/jobs/user/{user_id}", get(user_jobs_handler))
        .route("/api/queue/status", get(queue_status_handler))
        .route("/api/download/job/{job_id}/{*file}", get(download_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let category = state
        .scheduler
        .config()
        .category(&payload.category)
        .ok_or_else(|| JobgateError::UnknownCategory(payload.category.clone()))?;
    let credits = payload.credits.unwrap_or(category.credits);
    if credits < category.credits {
        return Err(JobgateError::CreditsBelowPrice {
            category: category.id.clone(),
            offered: credits,
            price: category.credits,
        }
        .into());
    }

    let new_balance = state.ledger.debit(&payload.user_id, credits).await?;
    tracing::info!(user_id = %payload.user_id, credits, new_balance, "Credits deducted");

    let user_id = payload.user_id.clone();
    let request = SubmitRequest {
        user_id: payload.user_id,
        category: payload.category,
        input_path: payload.input_path,
        input_file_name: payload.input_file_name,
        priority: payload.priority,
        credits,
        extra_args: payload.extra_args,
    };

    let submission = match state.scheduler.submit(request).await {
        Ok(submission) => submission,
        Err(e) => {
            // Nothing was persisted, so the charge is ours to undo.
            if let Err(refund) = state.ledger.credit(&user_id, credits).await {
                tracing::error!(user_id = %user_id, error = %refund, "Failed to undo debit");
            }
            return Err(e.into());
        }
    };

    let message = if submission.admitted {
        "Job started immediately".to_string()
    } else {
        format!("Job queued at position {}", submission.queue_position)
    };
    Ok(Json(SubmitJobResponse {
        job_id: submission.job_id,
        status: submission.status(),
        queue_position: submission.queue_position,
        new_balance,
        message,
    }))
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(state.scheduler.status(job_id).await?))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    state.scheduler.cancel(job_id).await?;
    Ok(Json(state.scheduler.status(job_id).await?))
}

async fn user_jobs_handler(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    Ok(Json(
        state.scheduler.user_jobs(&user_id, USER_JOBS_LIMIT).await?,
    ))
}

async fn queue_status_handler(State(state): State<ApiState>) -> Json<QueueStatus> {
    Json(state.scheduler.queue_status())
}

async fn download_handler(
    State(state): State<ApiState>,
    Path((job_id, file)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let path = state.scheduler.result_file(job_id, &file).await?;
    let bytes = tokio::fs::read(&path).await.map_err(JobgateError::from)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    Ok((
        [(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        )],
        bytes,
    )
        .into_response())
}
