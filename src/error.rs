//! Error types for kiwi-node

use thiserror::Error;

/// Why a candidate message was refused admission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Stale or future message: timestamp {timestamp} outside window around {now}")]
    StaleOrFutureMessage { timestamp: u64, now: u64 },
}

impl ValidationError {
    /// Machine readable reason code surfaced on the admission boundary.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::SchemaInvalid(_) => "SchemaInvalid",
            ValidationError::InvalidSignature => "InvalidSignature",
            ValidationError::Unauthorized(_) => "Unauthorized",
            ValidationError::StaleOrFutureMessage { .. } => "StaleOrFutureMessage",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Writer unavailable")]
    WriterClosed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Pagination invalid: {0}")]
    PaginationInvalid(String),
}

impl QueryError {
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::PaginationInvalid(_) => "PaginationInvalid",
        }
    }
}

/// Failure of a submission through the admission path.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error(transparent)]
    Rejected(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
