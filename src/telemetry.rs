use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;

/// Structured, in-process event hook for observability.
///
/// The library never logs on its own. Callers plug in an implementation that forwards these
/// events to `tracing`, metrics, or a test recorder.
pub trait PipelineEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: PipelineEvent);
}

/// Structured events emitted by the buffer, broadcaster and upstream reader.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    BufferWorkerStarted,
    BufferWorkerStopping,
    BufferWorkerPanicked,

    BatchWritten { size: usize, attempts: u32, duration: Duration },
    SinkWriteFailed { size: usize, attempt: u32, error: String, retry_in: Duration },
    BatchDropped { size: usize, attempts: u32, error: String },
    DrainCompleted { flushed: u64, dropped: u64 },

    ReadingRejected { error: String },

    BroadcasterStarted,
    BroadcasterStopping,
    BroadcastSent { readings: usize, observers: usize },
    ObserverFailed { observer: String, error: String },
    ObserverRemoved { observer: String },

    UpstreamConnected { endpoint: String },
    UpstreamDisconnected { endpoint: String, error: String, retry_in: Duration },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl PipelineEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: PipelineEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn PipelineEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` with structured fields.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl PipelineEventListener for TracingEventListener {
    fn on_event(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::BufferWorkerStarted => tracing::debug!("buffer worker started"),
            PipelineEvent::BufferWorkerStopping => tracing::debug!("buffer worker stopping"),
            PipelineEvent::BufferWorkerPanicked => tracing::error!("buffer worker panicked"),
            PipelineEvent::BatchWritten { size, attempts, duration } => tracing::debug!(
                size,
                attempts,
                duration_ms = duration.as_millis() as u64,
                "batch written"
            ),
            PipelineEvent::SinkWriteFailed { size, attempt, error, retry_in } => tracing::warn!(
                size,
                attempt,
                retry_in_ms = retry_in.as_millis() as u64,
                %error,
                "sink write failed, retrying"
            ),
            PipelineEvent::BatchDropped { size, attempts, error } => {
                tracing::error!(size, attempts, %error, "retry limit reached, batch dropped")
            }
            PipelineEvent::DrainCompleted { flushed, dropped } => {
                tracing::info!(flushed, dropped, "buffer drained")
            }
            PipelineEvent::ReadingRejected { error } => {
                tracing::debug!(%error, "reading rejected")
            }
            PipelineEvent::BroadcasterStarted => tracing::debug!("broadcaster started"),
            PipelineEvent::BroadcasterStopping => tracing::debug!("broadcaster stopping"),
            PipelineEvent::BroadcastSent { readings, observers } => {
                tracing::trace!(readings, observers, "sensor_update sent")
            }
            PipelineEvent::ObserverFailed { observer, error } => {
                tracing::warn!(%observer, %error, "observer push failed")
            }
            PipelineEvent::ObserverRemoved { observer } => {
                tracing::info!(%observer, "observer disconnected")
            }
            PipelineEvent::UpstreamConnected { endpoint } => {
                tracing::info!(%endpoint, "upstream connected")
            }
            PipelineEvent::UpstreamDisconnected { endpoint, error, retry_in } => tracing::warn!(
                %endpoint,
                %error,
                retry_in_ms = retry_in.as_millis() as u64,
                "upstream connection lost"
            ),
        }
    }
}

/// Metrics instrumentation and in-process scraping.
///
/// Emitting is a no-op until a recorder is installed, so the library can call these freely.
pub mod pipeline_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const READINGS_ACCEPTED: &str = "sensorhub_readings_accepted";
    pub const READINGS_REJECTED: &str = "sensorhub_readings_rejected";
    pub const READINGS_FLUSHED: &str = "sensorhub_readings_flushed";
    pub const READINGS_DROPPED: &str = "sensorhub_readings_dropped";
    pub const SINK_WRITE_FAILURES: &str = "sensorhub_sink_write_failures";
    pub const SINK_WRITE_DURATION_SECONDS: &str = "sensorhub_sink_write_duration_seconds";
    pub const BUFFER_PENDING: &str = "sensorhub_buffer_pending";
    pub const BROADCASTS: &str = "sensorhub_broadcasts";
    pub const OBSERVERS: &str = "sensorhub_observers";

    pub const LOG_BYTES_WRITTEN: &str = "sensorhub_log_bytes_written";
    pub const LOG_FSYNC_DURATION_SECONDS: &str = "sensorhub_log_fsync_duration_seconds";

    /// Handle to the in-process Prometheus recorder. Does not start an HTTP server.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs the global recorder (once per process) and starts the upkeep thread
        /// required by `install_recorder`.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("sensorhub-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_accepted() {
        ::metrics::counter!(READINGS_ACCEPTED).increment(1);
    }

    #[inline]
    pub fn record_rejected() {
        ::metrics::counter!(READINGS_REJECTED).increment(1);
    }

    #[inline]
    pub fn record_batch_written(duration: Duration, readings: u64) {
        ::metrics::histogram!(SINK_WRITE_DURATION_SECONDS).record(duration.as_secs_f64());
        if readings > 0 {
            ::metrics::counter!(READINGS_FLUSHED).increment(readings);
        }
    }

    #[inline]
    pub fn record_write_failure() {
        ::metrics::counter!(SINK_WRITE_FAILURES).increment(1);
    }

    #[inline]
    pub fn record_dropped(readings: u64) {
        if readings > 0 {
            ::metrics::counter!(READINGS_DROPPED).increment(readings);
        }
    }

    #[inline]
    pub fn record_pending(pending: usize) {
        ::metrics::gauge!(BUFFER_PENDING).set(pending as f64);
    }

    #[inline]
    pub fn record_broadcast(observers: usize) {
        ::metrics::counter!(BROADCASTS).increment(1);
        ::metrics::gauge!(OBSERVERS).set(observers as f64);
    }

    #[inline]
    pub fn record_log_bytes_written(bytes: u64) {
        if bytes > 0 {
            ::metrics::counter!(LOG_BYTES_WRITTEN).increment(bytes);
        }
    }

    #[inline]
    pub fn record_log_fsync(duration: Duration) {
        ::metrics::histogram!(LOG_FSYNC_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    fn describe_all() {
        describe_counter!(
            READINGS_ACCEPTED,
            Unit::Count,
            "Readings accepted by the pipeline."
        );
        describe_counter!(
            READINGS_REJECTED,
            Unit::Count,
            "Payloads rejected by the decoder."
        );
        describe_counter!(
            READINGS_FLUSHED,
            Unit::Count,
            "Readings durably written by the sink."
        );
        describe_counter!(
            READINGS_DROPPED,
            Unit::Count,
            "Readings dropped after the retry limit was reached."
        );
        describe_counter!(
            SINK_WRITE_FAILURES,
            Unit::Count,
            "Failed or timed-out sink writes."
        );
        describe_counter!(BROADCASTS, Unit::Count, "sensor_update messages broadcast.");
        describe_counter!(
            LOG_BYTES_WRITTEN,
            Unit::Bytes,
            "Bytes appended to the reading log."
        );

        describe_histogram!(
            SINK_WRITE_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of successful sink writes."
        );
        describe_histogram!(
            LOG_FSYNC_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of reading log sync_data calls."
        );

        describe_gauge!(BUFFER_PENDING, Unit::Count, "Readings waiting in the ingestion buffer.");
        describe_gauge!(OBSERVERS, Unit::Count, "Connected broadcast observers.");
    }
}
