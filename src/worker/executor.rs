use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use uuid::Uuid;

use crate::config::{CategoryConfig, WorkerConfig};
use crate::scheduler::job::{FailureKind, Job};
use crate::store::{CredentialStore, Notification, Notifier};

/// Exit status a worker uses to say the portal rejected the stored login.
pub const EXIT_INVALID_CREDENTIALS: i32 = 2;

const INVALID_CREDENTIALS_MESSAGE: &str =
    "Invalid portal credentials. Please update your portal login credentials and try again.";

/// Normalised result of one worker run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Success { output: String },
    InvalidCredentials { message: String },
    Failure { kind: FailureKind, message: String },
}

impl WorkerOutcome {
    fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        WorkerOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Success { .. })
    }
}

/// Map a failed run's exit code and stderr to a user-facing reason.
pub fn classify_failure(exit_code: Option<i32>, stderr: &str) -> (FailureKind, String) {
    if stderr.contains("This version of ChromeDriver only supports Chrome version") {
        return (
            FailureKind::Infrastructure,
            "Browser compatibility issue detected. The automation system is attempting to \
             resolve this automatically. Please try again in a few moments."
                .to_string(),
        );
    }
    if stderr.contains("SessionNotCreatedException") {
        return (
            FailureKind::Infrastructure,
            "Unable to start browser session. Please contact support if this persists."
                .to_string(),
        );
    }
    if stderr.contains("Invalid Login Credentials") {
        return (
            FailureKind::CredentialsInvalid,
            INVALID_CREDENTIALS_MESSAGE.to_string(),
        );
    }

    let message = if stderr.trim().is_empty() {
        match exit_code {
            Some(code) => format!("Script exited with code {}", code),
            None => "Script terminated by signal".to_string(),
        }
    } else {
        stderr.trim().to_string()
    };
    (FailureKind::Unknown, message)
}

/// Launches one worker process per job attempt.
///
/// The worker is invoked as
/// `<interpreter> <script> <input> <output_dir> <job_id> [extra..] [user pass]`
/// and reports back only through its exit status; stdout and stderr are
/// kept for diagnostics.
#[derive(Clone)]
pub struct WorkerInvoker {
    config: WorkerConfig,
    credentials: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
}

impl WorkerInvoker {
    pub fn new(
        config: WorkerConfig,
        credentials: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            credentials,
            notifier,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn invoke(&self, job: &Job, category: &CategoryConfig) -> WorkerOutcome {
        let script = self.config.scripts_dir.join(&category.script);
        let mut args = vec![
            script.to_string_lossy().into_owned(),
            job.input_path.to_string_lossy().into_owned(),
            job.output_dir.to_string_lossy().into_owned(),
            job.id.to_string(),
        ];
        args.extend(job.extra_args.iter().cloned());

        if let Some(portal) = &category.credential_portal {
            match self.credentials.portal_credentials(&job.user_id, portal).await {
                Ok(Some(creds)) => {
                    tracing::info!(job_id = %job.id, portal = %portal, username = %creds.username, "Using stored portal credentials");
                    args.push(creds.username);
                    args.push(creds.password);
                }
                Ok(None) => {
                    tracing::error!(job_id = %job.id, portal = %portal, "No credentials stored for portal");
                    return WorkerOutcome::failure(
                        FailureKind::CredentialsMissing,
                        format!(
                            "Portal credentials not configured. Please configure your {} credentials in the dashboard.",
                            category.name
                        ),
                    );
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, portal = %portal, error = %e, "Failed to fetch portal credentials");
                    return WorkerOutcome::failure(
                        FailureKind::Infrastructure,
                        "Failed to retrieve portal credentials. Please try again.",
                    );
                }
            }
        }

        tracing::info!(
            job_id = %job.id,
            category = %job.category,
            script = %script.display(),
            "Starting worker"
        );

        let mut command = Command::new(&self.config.interpreter);
        command
            .args(&args)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, command.output()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(job_id = %job.id, limit_secs = limit.as_secs(), "Worker timed out, killed");
                    return WorkerOutcome::failure(
                        FailureKind::Timeout,
                        format!("Job timeout - exceeded {} seconds", limit.as_secs()),
                    );
                }
            },
            None => command.output().await,
        };

        let outcome = Self::process_output(job.id, result);
        if let WorkerOutcome::InvalidCredentials { .. } = outcome {
            self.report_invalid_credentials(job, category);
        }
        outcome
    }

    fn process_output(
        job_id: Uuid,
        result: Result<std::process::Output, std::io::Error>,
    ) -> WorkerOutcome {
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Worker process could not start");
                return WorkerOutcome::failure(FailureKind::Infrastructure, e.to_string());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        for line in stdout.lines() {
            tracing::debug!(job_id = %job_id, "{}", line);
        }
        for line in stderr.lines() {
            tracing::debug!(job_id = %job_id, stream = "stderr", "{}", line);
        }
        tracing::info!(job_id = %job_id, exit_code = ?exit_code, "Worker exited");

        match exit_code {
            Some(0) => WorkerOutcome::Success { output: stdout },
            Some(EXIT_INVALID_CREDENTIALS) => WorkerOutcome::InvalidCredentials {
                message: INVALID_CREDENTIALS_MESSAGE.to_string(),
            },
            code => {
                let (kind, message) = classify_failure(code, &stderr);
                WorkerOutcome::Failure { kind, message }
            }
        }
    }

    /// Credential health side channel. Runs detached from the job's own
    /// failure path; errors are only logged.
    fn report_invalid_credentials(&self, job: &Job, category: &CategoryConfig) {
        let notifier = self.notifier.clone();
        let credentials = self.credentials.clone();
        let portal = category.credential_portal.clone();
        let notification = Notification {
            user_id: job.user_id.clone(),
            kind: "credential_failure".to_string(),
            title: "Portal Credentials Invalid".to_string(),
            message: format!(
                "Your {} portal credentials are invalid or have expired. Please update them to continue using automation services.",
                category.name
            ),
            portal: portal.clone(),
            job_id: Some(job.id),
            action_url: Some("/dashboard?tab=credentials".to_string()),
            action_label: Some("Update Credentials".to_string()),
        };
        let job_id = job.id;
        let user_id = job.user_id.clone();

        tokio::spawn(async move {
            if let Err(e) = notifier.notify(notification).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to create credential failure notification");
            }
            if let Some(portal) = portal {
                if let Err(e) = credentials.record_test_result(&user_id, &portal, false).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to update credential test result");
                }
            }
        });
    }
}
