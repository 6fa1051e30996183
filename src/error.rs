//! Error taxonomy for the slicing pipeline.
//!
//! Errors are split by the component that raised them. Each one knows
//! whether it is transient (worth retrying with backoff) or permanent for
//! the job at hand. Nothing in here ever terminates the process; startup
//! failures are surfaced through `anyhow` in `main`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::job::JobStatus;

pub type QueueResult<T> = Result<T, QueueError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type JobResult<T> = Result<T, JobError>;

/// Classifies an error as retryable or not.
pub trait Transience {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Delivery {0} is no longer current; the message was redelivered or removed")]
    LeaseLost(String),
}

impl Transience for QueueError {
    /// A reply that cannot be parsed will not parse on retry either;
    /// everything else (IO, timeouts, busy or loading server) may pass.
    fn is_transient(&self) -> bool {
        match self {
            QueueError::Redis(e) => e.kind() != redis::ErrorKind::TypeError,
            QueueError::LeaseLost(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store transport error: {0}")]
    Transport(String),

    #[error("Failed to configure object store: {0}")]
    Config(String),
}

impl StoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

impl Transience for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

/// Failures of the external converter. All of them are permanent: the
/// converter is assumed deterministic, so rerunning it will not help.
#[derive(Debug, Error)]
pub enum ConverterError {
    #[error("Converter not registered: {0}")]
    NotRegistered(String),

    #[error("Failed to spawn converter {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Converter exited with status {code:?}")]
    Exited { code: Option<i32> },

    #[error("Converter timed out after {0:?}")]
    Timeout(Duration),

    #[error("Converter reported success but produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("IO error while running converter: {0}")]
    Io(#[from] std::io::Error),
}

/// Job-scoped failure, handled by the orchestrator's state machine.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to decode job: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Illegal status transition {from} -> {to}")]
    Transition { from: JobStatus, to: JobStatus },

    #[error(transparent)]
    Converter(#[from] ConverterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Scratch IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True when the message itself is unusable, as opposed to the work
    /// it describes having failed.
    pub fn is_bad_shape(&self) -> bool {
        matches!(
            self,
            JobError::Decode(_)
                | JobError::Validation(_)
                | JobError::Transition { .. }
                | JobError::Converter(ConverterError::NotRegistered(_))
        )
    }
}

impl Transience for JobError {
    fn is_transient(&self) -> bool {
        match self {
            JobError::Store(e) => e.is_transient(),
            JobError::Queue(e) => e.is_transient(),
            _ => false,
        }
    }
}
