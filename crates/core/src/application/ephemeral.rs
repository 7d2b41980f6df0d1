// Ephemeral Job Engine
//
// Best-effort in-memory jobs. At most one instance per de-duplication key is
// queued or running; a repeatable kind enqueued again while in flight runs
// exactly once more afterwards. Failures are logged, never retried.

use crate::application::context::{ContextFactory, RequestContext};
use crate::application::jobs::Schema;
use crate::application::worker::{run_guarded, ShutdownToken};
use crate::config::QueueFullPolicy;
use crate::domain::JobKind;
use crate::error::{AppError, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Closure run by an ephemeral job
pub type EphemeralFn =
    Arc<dyn for<'r> Fn(&'r mut RequestContext) -> BoxFuture<'r, Result<()>> + Send + Sync>;

/// What `enqueue` did with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Handed to the workers (or run in-line)
    Queued,
    /// Same key already in flight; one more run will follow it
    Coalesced,
    /// Same key already in flight and the kind is idempotent
    Duplicate,
    /// Queue full under `QueueFullPolicy::DropNewest`
    Rejected,
}

#[derive(Clone)]
struct EphemeralJob {
    kind: Arc<JobKind>,
    key: String,
    run: EphemeralFn,
}

/// Options for [`EphemeralEngine::new`]
#[derive(Debug, Clone, Copy)]
pub struct EphemeralOptions {
    pub queue_max_size: usize,
    pub queue_full: QueueFullPolicy,
    pub inline: bool,
}

pub struct EphemeralEngine {
    schema: Arc<Schema>,
    contexts: ContextFactory,
    queue_tx: mpsc::Sender<EphemeralJob>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EphemeralJob>>>,
    /// key -> pending again
    inflight: Mutex<HashMap<String, bool>>,
    queue_full: QueueFullPolicy,
    inline: bool,
}

impl EphemeralEngine {
    /// # Panics
    /// If `opts.queue_max_size` is zero.
    pub fn new(schema: Arc<Schema>, contexts: ContextFactory, opts: EphemeralOptions) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(opts.queue_max_size);
        Self {
            schema,
            contexts,
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            inflight: Mutex::new(HashMap::new()),
            queue_full: opts.queue_full,
            inline: opts.inline,
        }
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a closure under `kind`, de-duplicated by `kind[:name]`
    ///
    /// # Arguments
    /// * `kind` - A kind defined with `Schema::ephemeral`
    /// * `name` - Instance name, may be empty
    /// * `f` - The work; runs in a transaction matching the kind's affinity
    pub async fn enqueue<F>(&self, kind: &str, name: &str, f: F) -> Result<EnqueueOutcome>
    where
        F: for<'r> Fn(&'r mut RequestContext) -> BoxFuture<'r, Result<()>> + Send + Sync + 'static,
    {
        let kind = self.schema.ephemeral_kind(kind)?.clone();
        let key = kind.dedup_key(name);

        {
            let mut inflight = self.inflight();
            if let Some(pending_again) = inflight.get_mut(&key) {
                if kind.is_repeatable() {
                    *pending_again = true;
                    debug!(key = %key, "ephemeral job coalesced");
                    return Ok(EnqueueOutcome::Coalesced);
                }
                debug!(key = %key, "ephemeral job already in flight");
                return Ok(EnqueueOutcome::Duplicate);
            }
            inflight.insert(key.clone(), false);
        }

        let job = EphemeralJob {
            kind,
            key,
            run: Arc::new(f),
        };

        if self.inline {
            self.run_inline(job).await;
            return Ok(EnqueueOutcome::Queued);
        }

        let key = job.key.clone();
        match self.queue_full {
            QueueFullPolicy::Block => {
                if self.queue_tx.send(job).await.is_err() {
                    self.inflight().remove(&key);
                    return Err(AppError::InvalidState("ephemeral queue closed".to_string()));
                }
            }
            QueueFullPolicy::DropNewest => match self.queue_tx.try_send(job) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inflight().remove(&key);
                    warn!(key = %key, "ephemeral queue full, job rejected");
                    return Ok(EnqueueOutcome::Rejected);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.inflight().remove(&key);
                    return Err(AppError::InvalidState("ephemeral queue closed".to_string()));
                }
            },
        }
        Ok(EnqueueOutcome::Queued)
    }

    async fn run_inline(&self, job: EphemeralJob) {
        loop {
            self.run_job(0, &job).await;
            if !self.take_pending_again(&job.key) {
                break;
            }
        }
    }

    /// Run one job in a fresh context. Errors and panics are logged.
    async fn run_job(&self, worker: usize, job: &EphemeralJob) {
        let mut rc = self.contexts.new_context(job.key.clone());
        let span = rc.span().clone();
        let run = job.run.clone();

        let result = async {
            // The closure is called inside the guard so a panic before its
            // future exists is caught too
            rc.in_tx(job.kind.affinity, move |rc| {
                Box::pin(run_guarded(async move { run(rc).await }))
            })
            .await
        }
        .instrument(span.clone())
        .await;
        rc.abandon_tx().await;

        span.in_scope(|| match result {
            Ok(()) => debug!(worker, kind = %job.kind.name, "ephemeral job done"),
            Err(e) => info!(worker, kind = %job.kind.name, error = %e, "ephemeral job failed"),
        });
    }

    /// Clear the repeat flag if set; otherwise forget the key
    fn take_pending_again(&self, key: &str) -> bool {
        let mut inflight = self.inflight();
        match inflight.get_mut(key) {
            Some(pending_again) if *pending_again => {
                *pending_again = false;
                true
            }
            _ => {
                inflight.remove(key);
                false
            }
        }
    }

    /// Finaliser: requeue once if another enqueue arrived, else forget the key
    fn finish(&self, job: EphemeralJob) {
        if self.take_pending_again(&job.key) {
            let queue_tx = self.queue_tx.clone();
            tokio::spawn(async move {
                let key = job.key.clone();
                if queue_tx.send(job).await.is_err() {
                    warn!(key = %key, "ephemeral queue closed before re-enqueue");
                }
            });
        }
    }

    /// Spawn `count` workers
    pub fn start(self: &Arc<Self>, count: usize, shutdown: ShutdownToken) -> Vec<JoinHandle<()>> {
        info!(count, inline = self.inline, "Starting ephemeral workers");
        (0..count)
            .map(|worker| {
                let engine = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { engine.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(self: Arc<Self>, worker: usize, shutdown: ShutdownToken) {
        debug!(worker, "ephemeral worker started");
        loop {
            let job = {
                let mut queue = tokio::select! {
                    guard = self.queue_rx.lock() => guard,
                    _ = shutdown.wait() => break,
                };
                tokio::select! {
                    job = queue.recv() => job,
                    _ = shutdown.wait() => break,
                }
            };
            let Some(job) = job else { break };

            self.run_job(worker, &job).await;
            self.finish(job);
        }
        debug!(worker, "ephemeral worker stopped");
    }

    /// True while the key is queued or running
    pub fn is_tracked(&self, kind: &str, name: &str) -> bool {
        self.key_state(kind, name).is_some()
    }

    /// True if a repeat run is owed for the key
    pub fn pending_again(&self, kind: &str, name: &str) -> bool {
        self.key_state(kind, name).unwrap_or(false)
    }

    fn key_state(&self, kind: &str, name: &str) -> Option<bool> {
        let key = self.schema.kind(kind)?.dedup_key(name);
        self.inflight().get(&key).copied()
    }

    pub fn tracked_count(&self) -> usize {
        self.inflight().len()
    }
}
