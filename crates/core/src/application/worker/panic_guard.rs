// Panic isolation for handler futures
use crate::error::AppError;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Result of a panic-guarded execution
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Execution completed
    Success(T),
    /// Execution panicked
    Panicked(String),
}

/// Execute a future with panic isolation
///
/// If the future panics while being polled, the panic is caught, logged
/// once together with a backtrace, and returned as `Panicked`. The worker
/// that drives the future keeps running.
///
/// # Example
/// ```text
/// match execute_guarded_async(handler(rc)).await {
///     PanicGuardResult::Success(result) => result,
///     PanicGuardResult::Panicked(msg) => Err(AppError::Panic(msg)),
/// }
/// ```
pub async fn execute_guarded_async<F, T>(future: F) -> PanicGuardResult<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => PanicGuardResult::Success(result),
        Err(panic_info) => {
            let panic_msg = panic_message(panic_info.as_ref());
            let backtrace = Backtrace::capture();
            error!(panic_msg = %panic_msg, backtrace = %backtrace, "Handler panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

/// Run a fallible handler future, turning panics into `AppError::Panic`
pub async fn run_guarded<F, T>(future: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match execute_guarded_async(future).await {
        PanicGuardResult::Success(result) => result,
        PanicGuardResult::Panicked(msg) => Err(AppError::Panic(msg)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
