// Persistent job worker loop

use crate::application::jobs::JobEngine;
use crate::application::worker::constants::ERROR_RECOVERY_SLEEP_DURATION;
use crate::application::worker::ShutdownToken;
use crate::error::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info};

impl JobEngine {
    /// Recover crashed rows, make sure every cron kind has a row, then spawn
    /// `count` workers. With `count = 0` only the startup steps run.
    pub async fn start(
        self: &Arc<Self>,
        count: usize,
        shutdown: ShutdownToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut rc = self.contexts.new_context("jobs:startup");
        let recovered = self.fail_running_jobs(&mut rc).await?;
        let scheduled = self.ensure_cron_jobs(&mut rc).await?;
        info!(count, recovered, scheduled, "Starting job workers");

        Ok((0..count)
            .map(|worker| {
                let engine = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { engine.run_worker(worker, shutdown).await })
            })
            .collect())
    }

    /// Run worker loop with graceful shutdown support. In-flight jobs finish
    /// before the loop notices the shutdown.
    pub async fn run_worker(self: Arc<Self>, worker: usize, shutdown: ShutdownToken) {
        info!(worker, "Job worker started");
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            match self.process_next_job(worker).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = sleep(self.idle_interval) => {},
                        _ = shutdown.wait() => {
                            info!(worker, "Job worker interrupted during idle");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(worker, error = %e, "Job worker error");
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                        _ = shutdown.wait() => {
                            info!(worker, "Job worker interrupted during error recovery");
                            break;
                        }
                    }
                }
            }
        }
        info!(worker, "Job worker stopped");
    }
}
