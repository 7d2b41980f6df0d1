// Application Layer - request contexts and the engines built on them

pub mod context;
pub mod ephemeral;
pub mod jobs;
pub mod live;
pub mod worker;

// Re-exports
pub use context::{ContextFactory, Identity, RequestContext, TxScope};
pub use ephemeral::{EnqueueOutcome, EphemeralEngine, EphemeralFn, EphemeralOptions};
pub use jobs::{JobEngine, Schema};
pub use live::LiveQueue;
pub use worker::{shutdown_channel, ShutdownSender, ShutdownToken};
