// Engine configuration knobs

use crate::application::worker::constants::{
    DEFAULT_EPHEMERAL_QUEUE_MAX_SIZE, DEFAULT_LIVE_TTL, DEFAULT_MAX_MESSAGES_PER_CHANNEL,
    IDLE_SLEEP_DURATION,
};
use crate::domain::id::MAX_NODE_ID;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the ephemeral engine does when its queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// `enqueue` waits for room
    #[default]
    Block,
    /// `enqueue` gives up and reports the job as rejected
    DropNewest,
}

/// Configuration consumed by the engines and the live queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persistent job workers
    pub worker_count: usize,
    pub ephemeral_worker_count: usize,
    pub ephemeral_queue_max_size: usize,
    pub ephemeral_queue_full: QueueFullPolicy,
    /// Persistent workers sleep this long when nothing is due
    pub idle_poll_interval_ms: u64,
    pub live_ttl_ms: u64,
    pub live_max_messages_per_channel: usize,
    /// ID generator node, 0..=255
    pub node_id: u16,
    /// Run ephemeral jobs synchronously inside `enqueue` (tests)
    pub inline_ephemeral: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            ephemeral_worker_count: 4,
            ephemeral_queue_max_size: DEFAULT_EPHEMERAL_QUEUE_MAX_SIZE,
            ephemeral_queue_full: QueueFullPolicy::Block,
            idle_poll_interval_ms: IDLE_SLEEP_DURATION.as_millis() as u64,
            live_ttl_ms: DEFAULT_LIVE_TTL.as_millis() as u64,
            live_max_messages_per_channel: DEFAULT_MAX_MESSAGES_PER_CHANNEL,
            node_id: 0,
            inline_ephemeral: false,
        }
    }
}

impl EngineConfig {
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn live_ttl(&self) -> Duration {
        Duration::from_millis(self.live_ttl_ms)
    }

    /// Reject values the engines cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_id > MAX_NODE_ID {
            return Err(AppError::Config(format!(
                "node_id {} out of range 0..={}",
                self.node_id, MAX_NODE_ID
            )));
        }
        if self.ephemeral_queue_max_size == 0 {
            return Err(AppError::Config(
                "ephemeral_queue_max_size must be at least 1".to_string(),
            ));
        }
        if self.live_max_messages_per_channel == 0 {
            return Err(AppError::Config(
                "live_max_messages_per_channel must be at least 1".to_string(),
            ));
        }
        if self.live_ttl_ms == 0 {
            return Err(AppError::Config("live_ttl_ms must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.live_ttl(), Duration::from_secs(60));
        assert_eq!(config.live_max_messages_per_channel, 100);
        assert_eq!(config.idle_poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_node_id_out_of_range() {
        let config = EngineConfig {
            node_id: 300,
            ..EngineConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("node_id"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"worker_count": 0, "ephemeral_queue_full": "drop_newest"}"#)
                .unwrap();
        assert_eq!(config.worker_count, 0);
        assert_eq!(config.ephemeral_queue_full, QueueFullPolicy::DropNewest);
        assert_eq!(config.ephemeral_worker_count, 4);
    }
}
