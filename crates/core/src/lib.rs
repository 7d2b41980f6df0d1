// Taskbed Core - Domain Logic, Ports & Engines
// NO infrastructure dependencies: the store is reached only through ports

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
