//! Error types for overdue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown work status: {0}")]
    UnknownStatus(String),

    #[error("invalid stage name: {0}")]
    InvalidStage(String),
}

pub type Result<T> = std::result::Result<T, Error>;
