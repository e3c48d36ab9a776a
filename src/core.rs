//! Pipeline orchestration: owns the store, the ingestion buffer and the broadcaster.

use crate::aggregate::{self, SensorOverview, Stats};
use crate::broadcast::{BroadcastConfig, Broadcaster, Observer, TickReport};
use crate::buffer::{BatchBuffer, BufferConfig, BufferStats, DrainReport};
use crate::decode::decode_reading;
use crate::error::PipelineError;
use crate::sink::Sink;
use crate::storage::{SeriesStore, StoreConfig};
use crate::telemetry::{noop_event_listener, pipeline_metrics, PipelineEvent, PipelineEventListener};
use crate::types::{Reading, SensorId};

use std::sync::Arc;
use std::time::Duration;

/// Configuration options for the [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub buffer: BufferConfig,
    pub broadcast: BroadcastConfig,
    /// Structured event hook; installed on every component when the pipeline starts.
    pub event_listener: Arc<dyn PipelineEventListener>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            store: StoreConfig::default(),
            buffer: BufferConfig::default(),
            broadcast: BroadcastConfig::default(),
            event_listener: noop_event_listener(),
        }
    }
}

impl PipelineConfig {
    /// Rejects zero sizes and periods.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.store.capacity == 0 {
            return Err(PipelineError::ConfigError(
                "history capacity must be greater than zero".to_string(),
            ));
        }
        if self.broadcast.period.is_zero() {
            return Err(PipelineError::ConfigError(
                "broadcast period must be non-zero".to_string(),
            ));
        }
        self.buffer.validate()
    }
}

/// The ingestion pipeline.
///
/// Decoded readings fan out to two independent paths: the [`BatchBuffer`] (durable, towards the
/// sink) and the [`SeriesStore`] (live, read by queries and the broadcaster). A failure on one
/// path never blocks the other.
#[derive(Debug)]
pub struct Pipeline {
    store: Arc<SeriesStore>,
    buffer: BatchBuffer,
    broadcaster: Broadcaster,
    events: Arc<dyn PipelineEventListener>,
}

impl Pipeline {
    /// Builds every component and starts the background threads.
    ///
    /// # Errors
    /// `ConfigError` for an invalid configuration, `BackgroundTaskError` when a thread cannot
    /// be spawned.
    pub fn start(config: PipelineConfig, sink: Arc<dyn Sink>) -> Result<Self, PipelineError> {
        config.validate()?;
        let events = config.event_listener;

        let store = Arc::new(SeriesStore::new(config.store)?);
        let buffer = BatchBuffer::start(
            BufferConfig {
                event_listener: Arc::clone(&events),
                ..config.buffer
            },
            sink,
        )?;
        let broadcaster = Broadcaster::start(
            BroadcastConfig {
                event_listener: Arc::clone(&events),
                ..config.broadcast
            },
            Arc::clone(&store),
        )?;

        Ok(Pipeline {
            store,
            buffer,
            broadcaster,
            events,
        })
    }

    /// Decodes a raw payload and ingests it. Rejections are counted and reported as events.
    pub fn ingest_bytes(&self, payload: &[u8]) -> Result<Arc<Reading>, PipelineError> {
        match decode_reading(payload) {
            Ok(reading) => self.ingest(reading),
            Err(e) => {
                pipeline_metrics::record_rejected();
                self.events.on_event(PipelineEvent::ReadingRejected {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Hands a reading to the buffer and to the store.
    ///
    /// Both paths are always attempted; the first error (buffer first) is returned.
    pub fn ingest(&self, reading: Reading) -> Result<Arc<Reading>, PipelineError> {
        let reading = Arc::new(reading);
        let durable = self.buffer.accept(Reading::clone(&reading));
        let live = self.store.append(Arc::clone(&reading));
        durable?;
        live?;
        pipeline_metrics::record_accepted();
        Ok(reading)
    }

    pub fn latest_all(&self) -> Vec<Arc<Reading>> {
        self.store.latest_all()
    }

    pub fn latest(&self, sensor_id: &SensorId) -> Option<Arc<Reading>> {
        self.store.latest(sensor_id)
    }

    pub fn window(
        &self,
        sensor_id: &SensorId,
        duration: Duration,
    ) -> Result<Vec<Arc<Reading>>, PipelineError> {
        self.store.window(sensor_id, duration)
    }

    pub fn compute_stats(
        &self,
        sensor_id: &SensorId,
        metric: &str,
        duration: Duration,
    ) -> Result<Stats, PipelineError> {
        aggregate::compute_stats(&self.store, sensor_id, metric, duration)
    }

    pub fn overview(&self, duration: Duration) -> Vec<SensorOverview> {
        aggregate::overview(&self.store, duration)
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.broadcaster.subscribe(observer);
    }

    pub fn unsubscribe(&self, observer_id: &str) -> bool {
        self.broadcaster.unsubscribe(observer_id)
    }

    pub fn observer_count(&self) -> usize {
        self.broadcaster.observer_count()
    }

    /// Broadcasts immediately instead of waiting for the next tick.
    pub fn broadcast_now(&self) -> TickReport {
        self.broadcaster.tick_now()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Flushes everything currently buffered without stopping.
    pub fn drain(&self) -> Result<DrainReport, PipelineError> {
        self.buffer.drain()
    }

    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.store
    }

    /// Stops broadcasting, drains the buffer (bounded by the retry limit) and joins every
    /// background thread. Idempotent.
    pub fn stop(&self) -> Result<DrainReport, PipelineError> {
        let broadcast = self.broadcaster.stop();
        let report = self.buffer.stop()?;
        broadcast?;
        Ok(report)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelObserver;
    use crate::sink::MemorySink;
    use crate::telemetry::testing::RecordingListener;

    fn quiet_config() -> PipelineConfig {
        PipelineConfig {
            broadcast: BroadcastConfig {
                period: Duration::from_secs(3600),
                ..BroadcastConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_ingest_fans_out_to_store_and_sink() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = Pipeline::start(quiet_config(), sink.clone()).unwrap();

        let stored = pipeline
            .ingest_bytes(br#"{"sensor_id": 4, "temperature": 22.5, "msg_id": "a"}"#)
            .unwrap();
        assert_eq!(pipeline.latest(&SensorId::from(4)).unwrap(), stored);
        assert_eq!(sink.record_count(), 0);

        let report = pipeline.stop().unwrap();
        assert_eq!(report.flushed, 1);
        assert_eq!(sink.count_for_message("a"), 1);
    }

    #[test]
    fn test_rejected_payload_reported() {
        let listener = Arc::new(RecordingListener::default());
        let config = PipelineConfig {
            event_listener: listener.clone(),
            ..quiet_config()
        };
        let pipeline = Pipeline::start(config, Arc::new(MemorySink::new())).unwrap();

        assert!(pipeline.ingest_bytes(b"{}").is_err());
        assert!(listener
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::ReadingRejected { .. })));
        assert_eq!(pipeline.buffer_stats().accepted, 0);
    }

    #[test]
    fn test_ingest_after_stop_keeps_live_path() {
        let pipeline = Pipeline::start(quiet_config(), Arc::new(MemorySink::new())).unwrap();
        pipeline.stop().unwrap();

        let reading = Reading::builder(SensorId::from(1)).build();
        assert!(matches!(
            pipeline.ingest(reading),
            Err(PipelineError::BufferStopped)
        ));
        assert!(pipeline.latest(&SensorId::from(1)).is_some());
    }

    #[test]
    fn test_broadcast_now_reaches_subscribers() {
        let pipeline = Pipeline::start(quiet_config(), Arc::new(MemorySink::new())).unwrap();
        let (observer, rx) = ChannelObserver::bounded("o", 2);
        pipeline.subscribe(Arc::new(observer));
        pipeline
            .ingest(Reading::builder(SensorId::from(5)).build())
            .unwrap();

        assert_eq!(pipeline.broadcast_now().delivered, 1);
        assert_eq!(rx.try_recv().unwrap().readings.len(), 1);
    }

    #[test]
    fn test_invalid_config() {
        let config = PipelineConfig {
            store: StoreConfig {
                capacity: 0,
                ..StoreConfig::default()
            },
            ..PipelineConfig::default()
        };
        assert!(matches!(
            Pipeline::start(config, Arc::new(MemorySink::new())),
            Err(PipelineError::ConfigError(_))
        ));
    }
}
