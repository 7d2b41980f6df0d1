// Cache invalidation port

/// Receives cache keys that became stale
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, keys: &[String]);
}

/// Used when the application runs without a cache
pub struct NoCache;

impl CacheInvalidator for NoCache {
    fn invalidate(&self, _keys: &[String]) {}
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Records every invalidation batch
    #[derive(Default)]
    pub struct RecordingCache {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingCache {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl CacheInvalidator for RecordingCache {
        fn invalidate(&self, keys: &[String]) {
            self.batches.lock().unwrap().push(keys.to_vec());
        }
    }
}
