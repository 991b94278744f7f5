use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::ServerConfig;
use crate::reaper::StuckJobReaper;
use crate::scheduler::Scheduler;
use crate::store::{
    MemoryCredentialStore, MemoryJobStore, MemoryLedger, MemoryNotifier, MemoryWorkHistory,
};
use crate::worker::WorkerInvoker;

/// One scheduler process wired to in-memory collaborators.
pub struct Server {
    pub config: ServerConfig,
    pub scheduler: Scheduler,
    pub ledger: Arc<MemoryLedger>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub notifier: Arc<MemoryNotifier>,
    pub history: Arc<MemoryWorkHistory>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let credentials = Arc::new(MemoryCredentialStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let history = Arc::new(MemoryWorkHistory::new());

        for (user_id, balance) in &config.initial_balances {
            ledger.open_account(user_id, *balance).await;
        }

        let invoker = WorkerInvoker::new(
            config.scheduler.worker.clone(),
            credentials.clone(),
            notifier.clone(),
        );
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            store,
            ledger.clone(),
            history.clone(),
            invoker,
        );

        Self {
            config,
            scheduler,
            ledger,
            credentials,
            notifier,
            history,
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// 1. Dispatches whatever the store already holds as queued
    /// 2. Spawns the stuck-job reaper
    /// 3. Serves the HTTP API (blocking)
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let resumed = self.scheduler.advance_all().await;
        if resumed > 0 {
            tracing::info!(resumed, "Dispatched jobs left queued from a previous run");
        }

        let reaper = StuckJobReaper::new(
            self.scheduler.clone(),
            self.config.scheduler.reaper.clone(),
        );
        let reaper_shutdown = shutdown.clone();
        let reaper_handle = tokio::spawn(async move {
            reaper.run(reaper_shutdown).await;
        });

        let state = ApiState {
            scheduler: self.scheduler.clone(),
            ledger: self.ledger.clone(),
        };
        tracing::info!(
            listen_addr = %self.config.listen_addr,
            max_concurrent = self.config.scheduler.max_concurrent,
            categories = self.config.scheduler.categories.len(),
            results_root = %self.config.scheduler.results_root.display(),
            "Starting jobgate"
        );
        run_api(self.config.listen_addr, state, shutdown.clone()).await?;

        shutdown.cancel();
        if let Err(e) = reaper_handle.await {
            tracing::error!(error = %e, "Reaper task failed");
        }
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
