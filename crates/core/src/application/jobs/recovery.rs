// Startup recovery: rows left running by a dead process, missing cron rows

use crate::application::context::RequestContext;
use crate::application::jobs::JobEngine;
use crate::domain::{Affinity, Job, PROCESS_CRASHED};
use crate::error::Result;
use tracing::{debug, info, warn};

impl JobEngine {
    /// Complete every Running/RunningPending row of a registered kind with
    /// the error `"process crashed"`. Rows of unknown kinds are left alone.
    ///
    /// # Returns
    /// Number of jobs recovered
    pub async fn fail_running_jobs(&self, rc: &mut RequestContext) -> Result<usize> {
        let scope = rc.enter_tx(Affinity::SafeWriter).await?;
        let result = self.fail_running_in_tx(rc).await;
        rc.exit_tx(scope, result).await
    }

    async fn fail_running_in_tx(&self, rc: &mut RequestContext) -> Result<usize> {
        let now = self.now();
        let tx = rc.tx()?;
        let running = tx.running_jobs().await?;
        let mut recovered = 0;

        for mut job in running {
            let Some(kind) = self.schema.persistent_kind(&job.kind).ok() else {
                debug!(job_id = %job.id, kind = %job.kind, "Skipping running job of unknown kind");
                continue;
            };

            job.record_completion(
                now,
                0,
                Some(PROCESS_CRASHED),
                &kind.backoff,
                kind.repeat_interval,
            );
            tx.put_job(&job).await?;
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                status = %job.status,
                "Recovered job left running by a crashed process"
            );
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "Crash recovery complete");
        }
        Ok(recovered)
    }

    /// Insert the initial row of every cron kind that has none yet.
    ///
    /// # Returns
    /// Number of rows created
    pub async fn ensure_cron_jobs(&self, rc: &mut RequestContext) -> Result<usize> {
        let scope = rc.enter_tx(Affinity::SafeWriter).await?;
        let result = self.ensure_cron_in_tx(rc).await;
        rc.exit_tx(scope, result).await
    }

    async fn ensure_cron_in_tx(&self, rc: &mut RequestContext) -> Result<usize> {
        let now = self.now();
        let tx = rc.tx()?;
        let mut created = 0;

        for kind in self.schema.cron_kinds() {
            if !tx.jobs_by_kind(&kind.name).await?.is_empty() {
                continue;
            }
            let job = Job::new(self.ids.next_at(now), kind.name.clone(), "", "", now);
            tx.put_job(&job).await?;
            info!(job_id = %job.id, kind = %kind.name, "Cron job scheduled");
            created += 1;
        }
        Ok(created)
    }
}
