// Worker plumbing shared by the persistent and ephemeral engines

pub mod constants;
mod panic_guard;
mod shutdown;

pub use panic_guard::{execute_guarded_async, run_guarded, PanicGuardResult};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
