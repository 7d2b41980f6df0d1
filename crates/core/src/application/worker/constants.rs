// Worker constants (no magic values)
use std::time::Duration;

/// Sleep duration when no persistent jobs are due (5s)
pub const IDLE_SLEEP_DURATION: Duration = Duration::from_secs(5);

/// Sleep duration after worker error before retry (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Attempts at recording a job outcome before the worker gives up on it
pub const COMPLETE_MAX_ATTEMPTS: u32 = 5;

/// Default ephemeral queue capacity
pub const DEFAULT_EPHEMERAL_QUEUE_MAX_SIZE: usize = 1024;

/// Default live message lifetime (60s)
pub const DEFAULT_LIVE_TTL: Duration = Duration::from_secs(60);

/// Default per-channel live buffer size
pub const DEFAULT_MAX_MESSAGES_PER_CHANNEL: usize = 100;

/// How often idle live channels are swept (60s)
pub const LIVE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How often the ID memento is persisted (60s)
pub const ID_MEMENTO_SAVE_INTERVAL: Duration = Duration::from_secs(60);
