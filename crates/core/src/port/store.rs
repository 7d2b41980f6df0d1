// Store port: transactional access to the jobs table and its indices
//
// Index contract (maintained by the adapter on every put):
// - by_kind               all rows
// - by_kind_name          rows with a non-empty name, unique per (kind, name)
// - pending_by_run_time   status in (queued, retrying) and next_run_time != 0,
//                         ordered by (next_run_time, id)
// - running_by_start_time status in (running, running_pending), ordered by (start_time, id)

use crate::domain::{Job, JobId};
use crate::error::Result;
use async_trait::async_trait;

/// Kind of transaction to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxMode {
    Read,
    Write,
    /// Writer that must not overlap any other writer for its whole span
    Exclusive,
}

impl TxMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, TxMode::Read)
    }

    /// True if a transaction opened in `self` can serve a request for `wanted`
    pub fn satisfies(self, wanted: TxMode) -> bool {
        match wanted {
            TxMode::Read => true,
            TxMode::Write => self.is_writable(),
            TxMode::Exclusive => self == TxMode::Exclusive,
        }
    }
}

/// Transaction factory
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction. Writers serialise; this may wait.
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn StoreTx>>;
}

/// One open transaction
#[async_trait]
pub trait StoreTx: Send {
    fn mode(&self) -> TxMode;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;

    async fn job_exists(&mut self, id: JobId) -> Result<bool>;

    /// Insert or replace a row. Fails with `AppError::Conflict` if another
    /// row already holds the same (kind, name).
    async fn put_job(&mut self, job: &Job) -> Result<()>;

    /// Fetch a row by ID (also used to reload a row before mutating it)
    async fn lookup_job(&mut self, id: JobId) -> Result<Option<Job>>;

    /// `by_kind_name` lookup
    async fn lookup_job_by_kind_name(&mut self, kind: &str, name: &str) -> Result<Option<Job>>;

    /// `by_kind` scan in ID order
    async fn jobs_by_kind(&mut self, kind: &str) -> Result<Vec<Job>>;

    /// Head of `pending_by_run_time`, restricted to `kinds`
    async fn first_pending_job(&mut self, kinds: &[String]) -> Result<Option<Job>>;

    /// Full `running_by_start_time` scan
    async fn running_jobs(&mut self) -> Result<Vec<Job>>;

    /// Highest job ID ever stored
    async fn newest_job_id(&mut self) -> Result<Option<JobId>>;

    /// Small integer settings kept next to the jobs (e.g. the ID memento)
    async fn load_meta(&mut self, key: &str) -> Result<Option<i64>>;

    async fn save_meta(&mut self, key: &str, value: i64) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;

    /// Store for code paths that never touch the database
    pub struct NoStore;

    #[async_trait]
    impl Store for NoStore {
        async fn begin(&self, mode: TxMode) -> Result<Box<dyn StoreTx>> {
            Err(AppError::Config(format!(
                "no store configured ({mode:?} transaction requested)"
            )))
        }
    }
}
