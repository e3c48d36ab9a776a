use std::time::Duration;
use thiserror::Error;

use crate::types::SensorId;

/// Error type for pipeline, store and query operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Inbound payload could not be parsed at all.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Payload parsed but a field is missing or has the wrong shape.
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Sensor not found: {0}")]
    SensorNotFound(SensorId),

    #[error("Invalid metric: {0}")]
    InvalidMetric(String),

    /// The ingestion buffer has been stopped and no longer accepts readings.
    #[error("Ingestion buffer is stopped")]
    BufferStopped,

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Upstream connection error: {0}")]
    Connection(String),
}

impl PipelineError {
    /// True for errors caused by the caller's input rather than by the pipeline.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Parse(_)
                | PipelineError::Validation { .. }
                | PipelineError::InvalidMetric(_)
        )
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for PipelineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PipelineError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

/// Failure reported by a [`Sink`](crate::sink::Sink) write.
///
/// Every variant is retryable from the buffer's point of view.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink write timed out after {0:?}")]
    Timeout(Duration),

    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink serialization error: {0}")]
    Serialization(String),

    #[error("corruption detected: {details}")]
    Corruption { details: String },
}

impl<T> From<std::sync::PoisonError<T>> for SinkError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SinkError::Unavailable(format!("sink lock poisoned: {}", err))
    }
}
