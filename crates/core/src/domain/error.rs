// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid ID: {0:?}")]
    InvalidId(String),

    #[error("Unknown job status: {0}")]
    UnknownStatus(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
