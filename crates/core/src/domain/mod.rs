// Domain Layer - Pure values and state transitions

pub mod backoff;
pub mod error;
pub mod id;
pub mod job;
pub mod kind;
pub mod live;

// Re-exports
pub use backoff::{Backoff, INFINITE, MAX_FINITE_DELAY};
pub use error::DomainError;
pub use id::{Id, IdGenerator, ID_EPOCH_MILLIS};
pub use job::{Job, JobId, JobParams, JobStatus, NoParams, PROCESS_CRASHED};
pub use kind::{Affinity, Behaviour, JobKind, KindOptions, Persistence};
pub use live::{Channel, Envelope, LiveMsg};
