#![doc = include_str!("../README.md")]
// Declare modules
pub mod aggregate;
pub mod broadcast;
pub mod buffer;
pub mod core;
pub mod decode;
pub mod error;
pub mod persistence;
pub mod query;
pub mod retry;
pub mod sink;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod upstream;

/// Windowed statistics and per-sensor overview rows.
pub use crate::aggregate::{SensorOverview, Stats};
/// Periodic `sensor_update` broadcast to subscribed observers.
pub use crate::broadcast::{Broadcaster, Observer, SensorUpdate};
/// Batching buffer between ingestion and the sink.
pub use crate::buffer::{BatchBuffer, BufferConfig, BufferStats, DrainReport};
/// Configuration options for the pipeline.
pub use crate::core::PipelineConfig;
/// Main entry point: ingestion, queries and broadcast.
pub use crate::core::Pipeline;
/// Error types for pipeline and sink operations.
pub use crate::error::{PipelineError, SinkError};
/// Append-only reading log sink.
pub use crate::persistence::LogFileSink;
/// Capped exponential backoff shared by the buffer and the upstream reader.
pub use crate::retry::{BackoffPolicy, ExponentialBackoff};
/// Durable destination for flushed batches.
pub use crate::sink::{MemorySink, Sink};
/// Bounded per-sensor history.
pub use crate::storage::SeriesStore;
/// Structured event hook for observability.
pub use crate::telemetry::{PipelineEvent, PipelineEventListener};
/// A single normalized sensor reading.
pub use crate::types::{Metric, Reading, SensorId, Timestamp, Value};

/// Readings retained per sensor unless configured otherwise.
pub use crate::storage::DEFAULT_HISTORY_CAPACITY;
