// SQLite Store Implementation
//
// Readers are plain deferred transactions (WAL keeps them off the writers'
// path). Writers also hold a process-wide async lock, so at most one writer
// transaction is open at a time and a writer never starts from a stale
// snapshot.

use crate::map_sqlx_error;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use taskbed_core::domain::{Job, JobId};
use taskbed_core::error::{AppError, Result};
use taskbed_core::port::{Store, StoreTx, TxMode};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn StoreTx>> {
        let guard = if mode.is_writable() {
            Some(self.write_lock.clone().lock_owned().await)
        } else {
            None
        };
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        trace!(mode = ?mode, "SQLite transaction started");
        Ok(Box::new(SqliteTx {
            tx,
            mode,
            _write_guard: guard,
        }))
    }
}

pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
    mode: TxMode,
    /// Released after commit/rollback
    _write_guard: Option<OwnedMutexGuard<()>>,
}

impl SqliteTx {
    fn ensure_writable(&self, op: &str) -> Result<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(AppError::InvalidState(format!(
                "{op} needs a writer transaction"
            )))
        }
    }
}

const JOB_COLUMNS: &str = "id, kind, name, params, status, \
    next_run_time, enqueue_time, start_time, last_attempt_time, \
    last_success_time, last_failure_time, finish_time, \
    attempt, consec_failures, total_failures, \
    last_duration_ms, total_duration_ms, last_err";

#[async_trait]
impl StoreTx for SqliteTx {
    fn mode(&self) -> TxMode {
        self.mode
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let SqliteTx {
            tx, _write_guard, ..
        } = *self;
        let result = tx.commit().await.map_err(map_sqlx_error);
        drop(_write_guard);
        result
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let SqliteTx {
            tx, _write_guard, ..
        } = *self;
        let result = tx.rollback().await.map_err(map_sqlx_error);
        drop(_write_guard);
        result
    }

    async fn job_exists(&mut self, id: JobId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(found.is_some())
    }

    async fn put_job(&mut self, job: &Job) -> Result<()> {
        self.ensure_writable("put_job")?;

        let sql = format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                name = excluded.name,
                params = excluded.params,
                status = excluded.status,
                next_run_time = excluded.next_run_time,
                enqueue_time = excluded.enqueue_time,
                start_time = excluded.start_time,
                last_attempt_time = excluded.last_attempt_time,
                last_success_time = excluded.last_success_time,
                last_failure_time = excluded.last_failure_time,
                finish_time = excluded.finish_time,
                attempt = excluded.attempt,
                consec_failures = excluded.consec_failures,
                total_failures = excluded.total_failures,
                last_duration_ms = excluded.last_duration_ms,
                total_duration_ms = excluded.total_duration_ms,
                last_err = excluded.last_err
            "#
        );

        sqlx::query(&sql)
            .bind(job.id.to_string())
            .bind(&job.kind)
            .bind(&job.name)
            .bind(&job.params)
            .bind(job.status.as_str())
            .bind(job.next_run_time)
            .bind(job.enqueue_time)
            .bind(job.start_time)
            .bind(job.last_attempt_time)
            .bind(job.last_success_time)
            .bind(job.last_failure_time)
            .bind(job.finish_time)
            .bind(job.attempt)
            .bind(job.consec_failures)
            .bind(job.total_failures)
            .bind(job.last_duration_ms)
            .bind(job.total_duration_ms)
            .bind(&job.last_err)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn lookup_job(&mut self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn lookup_job_by_kind_name(&mut self, kind: &str, name: &str) -> Result<Option<Job>> {
        if name.is_empty() {
            return Ok(None);
        }
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE kind = ? AND name = ? AND name != ''");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(kind)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn jobs_by_kind(&mut self, kind: &str) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE kind = ? ORDER BY id");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(kind)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn first_pending_job(&mut self, kinds: &[String]) -> Result<Option<Job>> {
        if kinds.is_empty() {
            return Ok(None);
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status IN ('queued', 'retrying') AND next_run_time != 0 AND kind IN ("
        ));
        let mut separated = query.separated(", ");
        for kind in kinds {
            separated.push_bind(kind);
        }
        separated.push_unseparated(") ORDER BY next_run_time, id LIMIT 1");

        let row = query
            .build_query_as::<JobRow>()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn running_jobs(&mut self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status IN ('running', 'running_pending') ORDER BY start_time, id"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn newest_job_id(&mut self) -> Result<Option<JobId>> {
        let id: Option<String> = sqlx::query_scalar("SELECT id FROM jobs ORDER BY id DESC LIMIT 1")
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        id.map(|s| s.parse::<JobId>().map_err(AppError::from))
            .transpose()
    }

    async fn load_meta(&mut self, key: &str) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)
    }

    async fn save_meta(&mut self, key: &str, value: i64) -> Result<()> {
        self.ensure_writable("save_meta")?;
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    kind: String,
    name: String,
    params: String,
    status: String,

    next_run_time: i64,
    enqueue_time: i64,
    start_time: i64,
    last_attempt_time: i64,
    last_success_time: i64,
    last_failure_time: i64,
    finish_time: i64,

    attempt: i64,
    consec_failures: i64,
    total_failures: i64,

    last_duration_ms: i64,
    total_duration_ms: i64,
    last_err: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id.parse()?,
            kind: self.kind,
            name: self.name,
            params: self.params,
            status: self.status.parse()?,
            next_run_time: self.next_run_time,
            enqueue_time: self.enqueue_time,
            start_time: self.start_time,
            last_attempt_time: self.last_attempt_time,
            last_success_time: self.last_success_time,
            last_failure_time: self.last_failure_time,
            finish_time: self.finish_time,
            attempt: self.attempt,
            consec_failures: self.consec_failures,
            total_failures: self.total_failures,
            last_duration_ms: self.last_duration_ms,
            total_duration_ms: self.total_duration_ms,
            last_err: self.last_err,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use taskbed_core::domain::{Id, JobStatus, ID_EPOCH_MILLIS};
    use tokio_test::assert_err;

    const NOW: i64 = ID_EPOCH_MILLIS + 1_000_000;

    async fn store() -> (SqliteStore, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("taskbed-store-{}.db", uuid::Uuid::new_v4()));
        let pool = create_pool(&format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        (SqliteStore::new(pool), path)
    }

    fn job(raw: u64, kind: &str, name: &str) -> Job {
        Job::new(Id::from_raw(raw), kind, name, "{}", NOW)
    }

    #[tokio::test]
    async fn test_put_and_lookup() {
        let (store, path) = store().await;
        let mut tx = store.begin(TxMode::Write).await.unwrap();
        let j = job(0x0100_0001, "mail", "welcome");
        tx.put_job(&j).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(TxMode::Read).await.unwrap();
        assert!(tx.job_exists(j.id).await.unwrap());
        assert_eq!(tx.lookup_job(j.id).await.unwrap(), Some(j.clone()));
        assert_eq!(
            tx.lookup_job_by_kind_name("mail", "welcome").await.unwrap(),
            Some(j.clone())
        );
        assert_eq!(tx.newest_job_id().await.unwrap(), Some(j.id));
        tx.rollback().await.unwrap();
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let (store, path) = store().await;
        let mut tx = store.begin(TxMode::Write).await.unwrap();
        tx.put_job(&job(1 << 24 | 1, "mail", "welcome")).await.unwrap();
        let err = assert_err!(tx.put_job(&job(1 << 24 | 2, "mail", "welcome")).await);
        assert!(matches!(err, AppError::Conflict(_)));

        // Unnamed rows never collide
        tx.put_job(&job(1 << 24 | 3, "mail", "")).await.unwrap();
        tx.put_job(&job(1 << 24 | 4, "mail", "")).await.unwrap();
        assert_eq!(tx.jobs_by_kind("mail").await.unwrap().len(), 3);
        tx.rollback().await.unwrap();
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_reader_cannot_write() {
        let (store, path) = store().await;
        let mut tx = store.begin(TxMode::Read).await.unwrap();
        let err = assert_err!(tx.put_job(&job(1 << 24 | 1, "mail", "")).await);
        assert!(matches!(err, AppError::InvalidState(_)));
        tx.rollback().await.unwrap();
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_pending_order_and_kind_filter() {
        let (store, path) = store().await;
        let mut tx = store.begin(TxMode::Write).await.unwrap();

        let mut late = job(1 << 24 | 1, "mail", "");
        late.next_run_time = NOW + 500;
        let mut early = job(2 << 24 | 1, "mail", "");
        early.next_run_time = NOW + 100;
        let mut other = job(3 << 24 | 1, "report", "");
        other.next_run_time = NOW;
        let mut done = job(4 << 24 | 1, "mail", "");
        done.status = JobStatus::Done;
        done.next_run_time = 0;
        for j in [&late, &early, &other, &done] {
            tx.put_job(j).await.unwrap();
        }

        let first = tx.first_pending_job(&["mail".to_string()]).await.unwrap();
        assert_eq!(first.map(|j| j.id), Some(early.id));
        let first_any = tx
            .first_pending_job(&["mail".to_string(), "report".to_string()])
            .await
            .unwrap();
        assert_eq!(first_any.map(|j| j.id), Some(other.id));
        assert!(tx.first_pending_job(&[]).await.unwrap().is_none());
        tx.rollback().await.unwrap();
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let (store, path) = store().await;
        let mut tx = store.begin(TxMode::Write).await.unwrap();
        assert_eq!(tx.load_meta("id_memento").await.unwrap(), None);
        tx.save_meta("id_memento", 42).await.unwrap();
        tx.save_meta("id_memento", 43).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(TxMode::Read).await.unwrap();
        assert_eq!(tx.load_meta("id_memento").await.unwrap(), Some(43));
        tx.rollback().await.unwrap();
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_writers_serialise() {
        let (store, path) = store().await;
        let store = Arc::new(store);
        let first = store.begin(TxMode::Write).await.unwrap();

        let second = {
            let store = store.clone();
            tokio::spawn(async move { store.begin(TxMode::Exclusive).await.map(|_| ()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        first.commit().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let _ = std::fs::remove_file(path);
    }
}
