// Persistent Job Engine - enqueue, dequeue, execute, complete
//
// Every row mutation happens inside a writer transaction opened through the
// request context. The engine owns the rows it dequeued until completion.

use crate::application::context::{ContextFactory, RequestContext};
use crate::application::jobs::Schema;
use crate::application::worker::constants::{
    COMPLETE_MAX_ATTEMPTS, ERROR_RECOVERY_SLEEP_DURATION,
};
use crate::application::worker::run_guarded;
use crate::domain::{Affinity, IdGenerator, Job, JobId, JobKind, JobParams, JobStatus};
use crate::error::{AppError, Result};
use crate::port::TimeProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn, Instrument};

pub struct JobEngine {
    pub(super) schema: Arc<Schema>,
    pub(super) ids: Arc<IdGenerator>,
    pub(super) clock: Arc<dyn TimeProvider>,
    pub(super) contexts: ContextFactory,
    pub(super) idle_interval: Duration,
    /// Persistent kinds this process can run; dequeue ignores the rest
    kind_names: Vec<String>,
}

impl JobEngine {
    /// Create an engine
    ///
    /// # Arguments
    /// * `schema` - Registered kinds; only persistent ones are dequeued
    /// * `ids` - Generator for new job IDs
    /// * `clock` - Source of "now" for scheduling fields
    /// * `contexts` - Builds worker request contexts
    /// * `idle_interval` - Worker sleep when nothing is due
    pub fn new(
        schema: Arc<Schema>,
        ids: Arc<IdGenerator>,
        clock: Arc<dyn TimeProvider>,
        contexts: ContextFactory,
        idle_interval: Duration,
    ) -> Self {
        let kind_names = schema.persistent_kind_names();
        Self {
            schema,
            ids,
            clock,
            contexts,
            idle_interval,
            kind_names,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    pub fn contexts(&self) -> &ContextFactory {
        &self.contexts
    }

    pub(super) fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    // ------------------------------------------------------------------
    // Enqueue / Reenqueue
    // ------------------------------------------------------------------

    /// Enqueue a job of `kind`. A named job whose (kind, name) already
    /// exists is re-enqueued instead and its existing ID returned.
    pub async fn enqueue<P: JobParams>(
        &self,
        rc: &mut RequestContext,
        kind: &str,
        params: &P,
    ) -> Result<JobId> {
        let kind = self.schema.persistent_kind(kind)?.clone();
        if kind.is_cron() {
            return Err(AppError::Validation(format!(
                "cron kind {} is scheduled by the engine",
                kind.name
            )));
        }
        let name = params.job_name();
        let encoded = serde_json::to_string(params)?;

        let scope = rc.enter_tx(Affinity::SafeWriter).await?;
        let result = self.enqueue_in_tx(rc, &kind, name, encoded).await;
        rc.exit_tx(scope, result).await
    }

    async fn enqueue_in_tx(
        &self,
        rc: &mut RequestContext,
        kind: &JobKind,
        name: String,
        params: String,
    ) -> Result<JobId> {
        let now = self.now();
        let tx = rc.tx()?;

        if !name.is_empty() {
            if let Some(mut existing) = tx.lookup_job_by_kind_name(&kind.name, &name).await? {
                if existing.reenqueue(kind.is_repeatable(), false, &params, now) {
                    tx.put_job(&existing).await?;
                    info!(
                        job_id = %existing.id,
                        kind = %kind.name,
                        name = %name,
                        status = %existing.status,
                        "Job re-enqueued"
                    );
                } else {
                    debug!(job_id = %existing.id, kind = %kind.name, name = %name, "Job already enqueued");
                }
                return Ok(existing.id);
            }
        }

        let job = Job::new(self.ids.next_at(now), kind.name.clone(), name, params, now);
        tx.put_job(&job).await?;
        info!(job_id = %job.id, kind = %job.kind, name = %job.name, "Job enqueued");
        Ok(job.id)
    }

    /// Re-enqueue an existing job keeping its params. Returns true if the
    /// row changed.
    ///
    /// # Arguments
    /// * `force` - Re-run a non-repeatable job (terminal or pending only)
    pub async fn reenqueue(&self, rc: &mut RequestContext, id: JobId, force: bool) -> Result<bool> {
        let scope = rc.enter_tx(Affinity::SafeWriter).await?;
        let result = self.reenqueue_in_tx(rc, id, None, force).await;
        rc.exit_tx(scope, result).await
    }

    /// Re-enqueue an existing job with fresh params
    pub async fn reenqueue_with<P: JobParams>(
        &self,
        rc: &mut RequestContext,
        id: JobId,
        params: &P,
        force: bool,
    ) -> Result<bool> {
        let encoded = serde_json::to_string(params)?;
        let scope = rc.enter_tx(Affinity::SafeWriter).await?;
        let result = self.reenqueue_in_tx(rc, id, Some(encoded), force).await;
        rc.exit_tx(scope, result).await
    }

    async fn reenqueue_in_tx(
        &self,
        rc: &mut RequestContext,
        id: JobId,
        params: Option<String>,
        force: bool,
    ) -> Result<bool> {
        let now = self.now();
        let tx = rc.tx()?;
        let mut job = tx
            .lookup_job(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;
        let kind = self.schema.persistent_kind(&job.kind)?;

        let params = params.unwrap_or_else(|| job.params.clone());
        let changed = job.reenqueue(kind.is_repeatable(), force, &params, now);
        if changed {
            tx.put_job(&job).await?;
            info!(job_id = %id, kind = %job.kind, status = %job.status, force, "Job re-enqueued");
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub async fn find_job(&self, rc: &mut RequestContext, id: JobId) -> Result<Option<Job>> {
        let scope = rc.enter_tx(Affinity::SafeReader).await?;
        let result = match rc.tx() {
            Ok(tx) => tx.lookup_job(id).await,
            Err(e) => Err(e),
        };
        rc.exit_tx(scope, result).await
    }

    pub async fn find_named(
        &self,
        rc: &mut RequestContext,
        kind: &str,
        name: &str,
    ) -> Result<Option<Job>> {
        let scope = rc.enter_tx(Affinity::SafeReader).await?;
        let result = match rc.tx() {
            Ok(tx) => tx.lookup_job_by_kind_name(kind, name).await,
            Err(e) => Err(e),
        };
        rc.exit_tx(scope, result).await
    }

    pub async fn jobs_of_kind(&self, rc: &mut RequestContext, kind: &str) -> Result<Vec<Job>> {
        let scope = rc.enter_tx(Affinity::SafeReader).await?;
        let result = match rc.tx() {
            Ok(tx) => tx.jobs_by_kind(kind).await,
            Err(e) => Err(e),
        };
        rc.exit_tx(scope, result).await
    }

    // ------------------------------------------------------------------
    // Dequeue / Execute / Complete
    // ------------------------------------------------------------------

    /// Lease the first due job: `attempt += 1`, status Running.
    /// Returns `None` when nothing is due.
    pub async fn dequeue(&self, rc: &mut RequestContext) -> Result<Option<Job>> {
        let scope = rc.enter_tx(Affinity::SafeWriter).await?;
        let result = self.dequeue_in_tx(rc).await;
        rc.exit_tx(scope, result).await
    }

    async fn dequeue_in_tx(&self, rc: &mut RequestContext) -> Result<Option<Job>> {
        let now = self.now();
        let tx = rc.tx()?;
        let Some(mut job) = tx.first_pending_job(&self.kind_names).await? else {
            return Ok(None);
        };
        if job.next_run_time > now {
            return Ok(None);
        }

        job.mark_started(now);
        tx.put_job(&job).await?;
        debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "Job dequeued");
        Ok(Some(job))
    }

    /// Run the kind's handler for `job` in the kind's affinity. Panics come
    /// back as `AppError::Panic`.
    pub async fn execute(&self, rc: &mut RequestContext, job: &Job) -> Result<()> {
        let kind = self.schema.persistent_kind(&job.kind)?;
        let handler = self
            .schema
            .handler(&job.kind)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("kind {} has no handler", job.kind)))?;

        let params = job.params.clone();
        let name = job.name.clone();
        let result = rc
            .in_tx(kind.affinity, move |rc| {
                Box::pin(run_guarded(async move { handler(rc, &params, &name).await }))
            })
            .await;
        rc.abandon_tx().await;
        result
    }

    /// Record the outcome of a run. The row is reloaded first; a row that
    /// vanished is logged and skipped.
    pub async fn complete(
        &self,
        rc: &mut RequestContext,
        id: JobId,
        duration_ms: i64,
        outcome: Option<&AppError>,
    ) -> Result<Option<Job>> {
        let err = outcome.map(|e| e.to_string());
        let scope = rc.enter_tx(Affinity::SafeWriter).await?;
        let result = self.complete_in_tx(rc, id, duration_ms, err.as_deref()).await;
        rc.exit_tx(scope, result).await
    }

    async fn complete_in_tx(
        &self,
        rc: &mut RequestContext,
        id: JobId,
        duration_ms: i64,
        err: Option<&str>,
    ) -> Result<Option<Job>> {
        let now = self.now();
        let tx = rc.tx()?;
        let Some(mut job) = tx.lookup_job(id).await? else {
            warn!(job_id = %id, "Completed job no longer exists");
            return Ok(None);
        };
        let kind = self.schema.persistent_kind(&job.kind)?;

        job.record_completion(now, duration_ms, err, &kind.backoff, kind.repeat_interval);
        tx.put_job(&job).await?;
        log_completion(&job, err);
        Ok(Some(job))
    }

    /// Dequeue, execute and complete one job. Returns false if nothing was due.
    pub async fn process_next_job(&self, worker: usize) -> Result<bool> {
        let mut rc = self.contexts.new_context(format!("jobs:w{worker}"));
        let Some(job) = self.dequeue(&mut rc).await? else {
            return Ok(false);
        };

        rc.set_request_id(format!(
            "jobs:w{}:{}:{}:{}",
            worker, job.kind, job.id, job.attempt
        ));
        let started = std::time::Instant::now();
        let result = self.execute(&mut rc, &job).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        // The row stays Running until its outcome is stored, so keep trying
        let span = rc.span().clone();
        let mut attempt = 1;
        loop {
            match self
                .complete(&mut rc, job.id, duration_ms, result.as_ref().err())
                .instrument(span.clone())
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if attempt < COMPLETE_MAX_ATTEMPTS => {
                    warn!(
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "Recording job outcome failed"
                    );
                    attempt += 1;
                    sleep(ERROR_RECOVERY_SLEEP_DURATION).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn log_completion(job: &Job, err: Option<&str>) {
    match (job.status, err) {
        (_, None) => info!(
            job_id = %job.id,
            kind = %job.kind,
            status = %job.status,
            duration_ms = job.last_duration_ms,
            "Job completed"
        ),
        (JobStatus::Retrying, Some(err)) => warn!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempt,
            next_run_time = job.next_run_time,
            error = %err,
            "Job failed, will retry"
        ),
        (JobStatus::Failed, Some(err)) => error!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempt,
            error = %err,
            "Job failed permanently"
        ),
        (_, Some(err)) => warn!(
            job_id = %job.id,
            kind = %job.kind,
            status = %job.status,
            next_run_time = job.next_run_time,
            error = %err,
            "Job failed, rescheduled"
        ),
    }
}
