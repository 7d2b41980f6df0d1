//! Shared fixtures: a throwaway SQLite file, a manual clock and a recording cache
#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskbed_core::application::{ContextFactory, JobEngine, RequestContext, Schema};
use taskbed_core::domain::{IdGenerator, JobParams, ID_EPOCH_MILLIS};
use taskbed_core::port::cache::mocks::RecordingCache;
use taskbed_core::port::time_provider::mocks::ManualTimeProvider;
use taskbed_core::port::{Store, StoreTx, TxMode};
use taskbed_core::{AppError, Result};
use taskbed_infra_sqlite::{create_pool, run_migrations, SqliteStore};

/// A day after the ID epoch
pub const NOW: i64 = ID_EPOCH_MILLIS + 86_400_000;
pub const MIN: i64 = 60_000;

/// Worker sleep used by engines built here
pub const IDLE: Duration = Duration::from_millis(20);

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub clock: Arc<ManualTimeProvider>,
    pub cache: Arc<RecordingCache>,
    pub ids: Arc<IdGenerator>,
    pub contexts: ContextFactory,
    path: PathBuf,
}

impl Harness {
    pub async fn new() -> Self {
        let path = std::env::temp_dir().join(format!("taskbed-it-{}.db", uuid::Uuid::new_v4()));
        let pool = create_pool(&format!("sqlite://{}", path.display()))
            .await
            .expect("create pool");
        run_migrations(&pool).await.expect("migrate");

        let store = Arc::new(SqliteStore::new(pool));
        let cache = Arc::new(RecordingCache::new());
        let contexts = ContextFactory::new(store.clone(), cache.clone());

        Self {
            store,
            clock: Arc::new(ManualTimeProvider::new(NOW)),
            cache,
            ids: Arc::new(IdGenerator::new(0x42, 0)),
            contexts,
            path,
        }
    }

    pub fn rc(&self, request_id: &str) -> RequestContext {
        self.contexts.new_context(request_id)
    }

    pub fn engine(&self, schema: Schema) -> Arc<JobEngine> {
        self.engine_with(schema, self.contexts.clone())
    }

    pub fn engine_with(&self, schema: Schema, contexts: ContextFactory) -> Arc<JobEngine> {
        Arc::new(JobEngine::new(
            Arc::new(schema),
            self.ids.clone(),
            self.clock.clone(),
            contexts,
            IDLE,
        ))
    }

    /// Contexts over a store whose writers can be told to fail
    pub fn flaky_contexts(&self) -> (Arc<FlakyStore>, ContextFactory) {
        let flaky = Arc::new(FlakyStore {
            inner: self.store.clone(),
            failing_writers: AtomicUsize::new(0),
        });
        let contexts = ContextFactory::new(flaky.clone(), self.cache.clone());
        (flaky, contexts)
    }
}

/// Wraps the SQLite store and refuses the next N writer transactions
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    failing_writers: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_next_writers(&self, n: usize) {
        self.failing_writers.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn StoreTx>> {
        let refused = mode.is_writable()
            && self
                .failing_writers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refused {
            return Err(AppError::Internal("database is locked".to_string()));
        }
        self.inner.begin(mode).await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", self.path.display(), suffix));
        }
    }
}

/// Unnamed mail job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailParams {
    pub to: String,
}

impl JobParams for MailParams {}

/// Named per repository, so re-enqueues target the same row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReindexParams {
    pub repo: String,
    pub rev: u32,
}

impl JobParams for ReindexParams {
    fn job_name(&self) -> String {
        self.repo.clone()
    }
}

/// Append-only log shared with handlers
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
