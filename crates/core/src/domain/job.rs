// Job Domain Model
//
// A durable job row plus the pure state transitions the engine applies to it.
// Times are epoch milliseconds; zero means "never".

use crate::domain::backoff::{is_infinite, Backoff};
use crate::domain::error::DomainError;
use crate::domain::id::Id;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Job ID (snowflake)
pub type JobId = Id;

/// Error text recorded for rows found running at startup
pub const PROCESS_CRASHED: &str = "process crashed";

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Blocked,
    Running,
    RunningPending,
    Waiting,
    Retrying,
    Done,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Blocked => "blocked",
            JobStatus::Running => "running",
            JobStatus::RunningPending => "running_pending",
            JobStatus::Waiting => "waiting",
            JobStatus::Retrying => "retrying",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    /// Waiting to be dequeued
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retrying)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::RunningPending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Skipped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => JobStatus::Queued,
            "blocked" => JobStatus::Blocked,
            "running" => JobStatus::Running,
            "running_pending" => JobStatus::RunningPending,
            "waiting" => JobStatus::Waiting,
            "retrying" => JobStatus::Retrying,
            "done" => JobStatus::Done,
            "failed" => JobStatus::Failed,
            "skipped" => JobStatus::Skipped,
            other => return Err(DomainError::UnknownStatus(other.to_string())),
        })
    }
}

/// Input parameters of a persistent job kind, stored as JSON.
///
/// `job_name` names the instance; named instances are unique per kind and
/// enqueueing the same name again re-enqueues the existing row.
pub trait JobParams: Serialize + DeserializeOwned + Send + 'static {
    fn job_name(&self) -> String {
        String::new()
    }

    /// Called with the row's name before the handler runs
    fn set_job_name(&mut self, _name: &str) {}
}

/// Parameters of kinds that take no input (cron kinds)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoParams {}

impl JobParams for NoParams {}

/// Durable job record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    /// Empty when unnamed
    pub name: String,
    /// JSON-encoded parameters
    pub params: String,
    pub status: JobStatus,

    pub next_run_time: i64,
    pub enqueue_time: i64,
    pub start_time: i64,
    pub last_attempt_time: i64,
    pub last_success_time: i64,
    pub last_failure_time: i64,
    pub finish_time: i64,

    pub attempt: i64,
    pub consec_failures: i64,
    pub total_failures: i64,

    pub last_duration_ms: i64,
    pub total_duration_ms: i64,
    pub last_err: String,
}

impl Job {
    /// Create a queued job due now
    pub fn new(
        id: JobId,
        kind: impl Into<String>,
        name: impl Into<String>,
        params: impl Into<String>,
        now_millis: i64,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            name: name.into(),
            params: params.into(),
            status: JobStatus::Queued,
            next_run_time: now_millis,
            enqueue_time: now_millis,
            start_time: 0,
            last_attempt_time: 0,
            last_success_time: 0,
            last_failure_time: 0,
            finish_time: 0,
            attempt: 0,
            consec_failures: 0,
            total_failures: 0,
            last_duration_ms: 0,
            total_duration_ms: 0,
            last_err: String::new(),
        }
    }

    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    /// Membership rule of the `pending_by_run_time` index
    pub fn in_pending_index(&self) -> bool {
        self.status.is_pending() && self.next_run_time != 0
    }

    /// Membership rule of the `running_by_start_time` index
    pub fn in_running_index(&self) -> bool {
        self.status.is_running()
    }

    /// Dequeue transition
    pub fn mark_started(&mut self, now_millis: i64) {
        self.attempt += 1;
        self.status = JobStatus::Running;
        self.start_time = now_millis;
        self.last_attempt_time = now_millis;
    }

    /// Apply the outcome of one execution.
    ///
    /// # Arguments
    /// * `err` - Handler error text, `None` on success
    /// * `backoff` - The kind's retry policy
    /// * `repeat_interval` - Set for cron kinds
    pub fn record_completion(
        &mut self,
        now_millis: i64,
        duration_ms: i64,
        err: Option<&str>,
        backoff: &Backoff,
        repeat_interval: Option<Duration>,
    ) {
        let pending_again = self.status == JobStatus::RunningPending;

        self.last_duration_ms = duration_ms;
        self.total_duration_ms += duration_ms;
        self.finish_time = now_millis;

        let interval_ms = repeat_interval.map(|d| d.as_millis() as i64);

        match err {
            Some(err) => {
                self.last_failure_time = now_millis;
                self.last_err = err.to_string();
                self.consec_failures += 1;
                self.total_failures += 1;

                let failures = u32::try_from(self.consec_failures).unwrap_or(u32::MAX);
                let delay = backoff.delay_after(failures);
                if !is_infinite(delay) {
                    self.status = JobStatus::Retrying;
                    self.next_run_time = now_millis + delay.as_millis() as i64;
                } else if let Some(interval_ms) = interval_ms {
                    self.status = JobStatus::Queued;
                    self.next_run_time = now_millis + interval_ms;
                } else if pending_again {
                    // A re-enqueue arrived mid-run; it outlives the exhausted retries
                    self.status = JobStatus::Queued;
                    self.next_run_time = now_millis;
                } else {
                    self.status = JobStatus::Failed;
                    self.next_run_time = 0;
                }
            }
            None => {
                self.last_success_time = now_millis;
                self.last_err.clear();
                self.consec_failures = 0;

                if let Some(interval_ms) = interval_ms {
                    self.status = JobStatus::Queued;
                    self.next_run_time = now_millis + interval_ms;
                } else if pending_again {
                    self.status = JobStatus::Queued;
                    self.next_run_time = now_millis;
                } else {
                    self.status = JobStatus::Done;
                    self.next_run_time = 0;
                }
            }
        }
    }

    /// Apply a re-enqueue request. Returns true if the row changed.
    ///
    /// # Arguments
    /// * `repeatable` - The kind coalesces re-enqueues
    /// * `force` - Re-run a non-repeatable job anyway
    /// * `params` - Fresh encoded parameters
    pub fn reenqueue(&mut self, repeatable: bool, force: bool, params: &str, now_millis: i64) -> bool {
        if !repeatable && !force {
            return false;
        }

        let changed = match self.status {
            JobStatus::Running | JobStatus::RunningPending if repeatable => {
                self.status = JobStatus::RunningPending;
                self.next_run_time = now_millis;
                true
            }
            s if s.is_terminal() => {
                self.status = JobStatus::Queued;
                self.next_run_time = now_millis;
                self.enqueue_time = now_millis;
                self.consec_failures = 0;
                true
            }
            s if s.is_pending() => {
                if self.next_run_time > now_millis || self.next_run_time == 0 {
                    self.next_run_time = now_millis;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        if changed && self.params != params {
            self.params = params.to_string();
        }
        changed
    }
}
