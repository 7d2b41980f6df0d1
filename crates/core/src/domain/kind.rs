// Job Kind descriptors
//
// A kind is the schema-time description of a class of jobs. Handlers are
// attached separately by the application schema.

use crate::domain::backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where jobs of a kind live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    Persistent,
    Ephemeral,
}

/// How a kind reacts to repeated enqueues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behaviour {
    /// Duplicate enqueues are dropped
    Idempotent,
    /// A duplicate enqueue while running schedules exactly one more run
    Repeatable,
    /// Interval-driven; every run is followed by another one
    Cron,
}

/// Transaction requirement declared by a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    SafeReader,
    SafeWriter,
    ExclusiveWriter,
    /// The handler opens its own transactions
    Manual,
    DbUnused,
}

/// Options shared by every way of defining a kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KindOptions {
    pub behaviour: Behaviour,
    pub affinity: Affinity,
    pub backoff: Backoff,
}

impl Default for KindOptions {
    fn default() -> Self {
        Self {
            behaviour: Behaviour::Idempotent,
            affinity: Affinity::SafeWriter,
            backoff: Backoff::default(),
        }
    }
}

impl KindOptions {
    pub fn idempotent() -> Self {
        Self::default()
    }

    pub fn repeatable() -> Self {
        Self {
            behaviour: Behaviour::Repeatable,
            ..Self::default()
        }
    }

    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Job kind descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct JobKind {
    pub name: String,
    pub persistence: Persistence,
    pub behaviour: Behaviour,
    /// Set for cron kinds only
    pub repeat_interval: Option<Duration>,
    pub backoff: Backoff,
    pub affinity: Affinity,
}

impl JobKind {
    /// Build and validate a kind.
    ///
    /// # Panics
    /// On an invalid definition: empty name, cron without a positive
    /// interval, interval on a non-cron kind, or an ephemeral cron kind.
    pub fn new(
        name: impl Into<String>,
        persistence: Persistence,
        opts: KindOptions,
        repeat_interval: Option<Duration>,
    ) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "job kind name must not be empty");
        match opts.behaviour {
            Behaviour::Cron => {
                assert!(
                    repeat_interval.is_some_and(|d| !d.is_zero()),
                    "cron kind {name} needs a non-zero interval"
                );
                assert!(
                    persistence == Persistence::Persistent,
                    "cron kind {name} must be persistent"
                );
            }
            _ => assert!(
                repeat_interval.is_none(),
                "kind {name} has a repeat interval but is not cron"
            ),
        }
        Self {
            name,
            persistence,
            behaviour: opts.behaviour,
            repeat_interval,
            backoff: opts.backoff,
            affinity: opts.affinity,
        }
    }

    pub fn is_repeatable(&self) -> bool {
        self.behaviour == Behaviour::Repeatable
    }

    pub fn is_cron(&self) -> bool {
        self.behaviour == Behaviour::Cron
    }

    /// Cron kinds never carry an instance name
    pub fn allows_names(&self) -> bool {
        !self.is_cron()
    }

    /// De-duplication key of an ephemeral job
    pub fn dedup_key(&self, name: &str) -> String {
        if name.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, name)
        }
    }
}
