// Port Layer - Interfaces for external dependencies

pub mod cache;
pub mod store;
pub mod time_provider;

// Re-exports
pub use cache::{CacheInvalidator, NoCache};
pub use store::{Store, StoreTx, TxMode};
pub use time_provider::{SystemTimeProvider, TimeProvider};
