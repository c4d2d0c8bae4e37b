use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request not found: {0}")]
    NotFound(Ulid),
    #[error("request already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict { id: Ulid, expected: u64, actual: u64 },
    #[error("journal error: {0}")]
    Journal(String),
}

#[derive(Debug, Error)]
pub enum BookingError {
    /// Bad input shape. Caller's fault, never retried.
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("{0}")]
    OutsideWindow(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("booking request not found: {0}")]
    NotFound(Ulid),
    #[error("booking request {0} belongs to another user")]
    Forbidden(Ulid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BookingError {
    /// True for the 4xx-equivalent class the HTTP layer reports back unchanged.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, BookingError::Store(_))
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start executor: {0}")]
    Spawn(String),
    #[error("executor i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("executor protocol: {0}")]
    Protocol(String),
    #[error("executor timed out after {0}s")]
    Timeout(u64),
    #[error("no credentials stored for user {0}")]
    MissingCredentials(String),
}

/// A job handler could not do its work; the scheduler's own backoff applies.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Handler(String),
    #[error("handler panicked")]
    Panicked,
    #[error("no handler registered for {0}")]
    UnknownJobType(crate::model::JobType),
}

impl From<BookingError> for JobError {
    fn from(e: BookingError) -> Self {
        JobError::Handler(e.to_string())
    }
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        JobError::Handler(e.to_string())
    }
}
