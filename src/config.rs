use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One kind of automation work and the worker program that handles it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Identifier used in submissions and queue lookups (e.g. "egm-download")
    pub id: String,
    /// Human readable name, used in notifications
    pub name: String,
    /// Worker script, relative to [`WorkerConfig::scripts_dir`]
    pub script: String,
    /// Credits charged when the caller does not specify an amount
    #[serde(default = "default_credits")]
    pub credits: f64,
    /// Portal whose stored login must be injected before launch.
    /// Categories without a portal never touch the credential store.
    #[serde(default)]
    pub credential_portal: Option<String>,
}

fn default_credits() -> f64 {
    1.0
}

impl CategoryConfig {
    pub fn new(id: &str, name: &str, script: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            script: script.to_string(),
            credits: default_credits(),
            credential_portal: None,
        }
    }

    pub fn with_credits(mut self, credits: f64) -> Self {
        self.credits = credits;
        self
    }

    pub fn with_portal(mut self, portal: &str) -> Self {
        self.credential_portal = Some(portal.to_string());
        self
    }
}

/// The automation catalogue the platform ships with.
pub fn default_categories() -> Vec<CategoryConfig> {
    vec![
        CategoryConfig::new(
            "damco-tracking-maersk",
            "Damco (APM) Tracking",
            "damco_tracking_maersk.py",
        ),
        CategoryConfig::new(
            "ctg-port-tracking",
            "CTG Port Authority Tracking",
            "ctg_port_tracking.py",
        ),
        CategoryConfig::new(
            "egm-download",
            "EGM Download (Bill Tracking)",
            "egm_download.py",
        ),
        CategoryConfig::new(
            "exp-search",
            "Search EXP Detail Information",
            "bb_exp_search.py",
        )
        .with_credits(0.5)
        .with_portal("bangladesh_bank_exp"),
        CategoryConfig::new(
            "rex-soo-submission",
            "REX/SOO Submission",
            "rex_submission.py",
        )
        .with_credits(10.0)
        .with_portal("epb_export_tracker"),
    ]
}

/// Load a category catalogue from a JSON array file.
pub fn load_categories(path: &Path) -> Result<Vec<CategoryConfig>> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// How worker processes are launched.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Program that runs the worker script (e.g. "python3")
    pub interpreter: String,
    /// Directory holding the worker scripts
    pub scripts_dir: PathBuf,
    /// Hard bound on a single worker run. `None` leaves the stuck-job
    /// reaper as the only safety net.
    pub timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            scripts_dir: PathBuf::from("automation_scripts"),
            timeout: Some(Duration::from_secs(10 * 60)),
        }
    }
}

/// Stuck-job sweep and housekeeping settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// Processing jobs started longer ago than this are failed
    pub stale_after: Duration,
    /// Completed job rows older than this are purged
    pub completed_retention: Duration,
    /// Failed job rows are kept longer for support, then purged too
    pub failed_retention: Duration,
    /// Result directories untouched for longer than this are pruned
    pub result_dir_retention: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            stale_after: Duration::from_secs(10 * 60),
            completed_retention: Duration::from_secs(7 * 24 * 60 * 60),
            failed_retention: Duration::from_secs(30 * 24 * 60 * 60),
            result_dir_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Ceiling on concurrently running jobs, fixed for the process lifetime
    pub max_concurrent: usize,
    /// Parent of every job's private output directory
    pub results_root: PathBuf,
    /// Assumed run time used for the progress estimate
    pub estimated_duration: Duration,
    /// Progress never reported above this until completion is observed
    pub progress_cap: u8,
    pub default_priority: i32,
    pub categories: Vec<CategoryConfig>,
    pub worker: WorkerConfig,
    pub reaper: ReaperConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            results_root: PathBuf::from("results"),
            estimated_duration: Duration::from_secs(30),
            progress_cap: 95,
            default_priority: 1,
            categories: default_categories(),
            worker: WorkerConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn category(&self, id: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_results_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.results_root = root.into();
        self
    }

    pub fn with_categories(mut self, categories: Vec<CategoryConfig>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub scheduler: SchedulerConfig,
    /// Accounts opened in the in-memory ledger at startup
    pub initial_balances: Vec<(String, f64)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            scheduler: SchedulerConfig::default(),
            initial_balances: Vec::new(),
        }
    }
}
