//! Ingestion buffer: batches readings under size and time pressure and hands them to a [`Sink`].
//!
//! One flush worker thread is the only caller of the sink, so at most one flush is in flight.
//! `accept` takes the queue lock briefly and wakes the worker; it never waits on the sink.
//! Sink writes run on a separate writer thread and are awaited with a timeout.

use crate::error::{PipelineError, SinkError};
use crate::retry::{BackoffPolicy, ExponentialBackoff};
use crate::sink::Sink;
use crate::telemetry::{noop_event_listener, pipeline_metrics, PipelineEvent, PipelineEventListener};
use crate::types::Reading;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Configuration for [`BatchBuffer`].
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Queue length that triggers an immediate flush; also the maximum batch length.
    pub batch_size: usize,
    /// How long a partial batch may wait before it is flushed anyway.
    pub batch_timeout: Duration,
    /// Delay schedule between failed attempts of the same batch.
    pub backoff: BackoffPolicy,
    /// Retries after the first failed attempt before a batch is dropped.
    pub max_retries: u32,
    /// Upper bound on a single `Sink::write`; exceeding it counts as a failed attempt.
    pub write_timeout: Duration,
    pub event_listener: Arc<dyn PipelineEventListener>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            batch_size: 10,
            batch_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            max_retries: 8,
            write_timeout: Duration::from_secs(10),
            event_listener: noop_event_listener(),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::ConfigError("batch_size must be greater than zero".into()));
        }
        if self.batch_timeout.is_zero() {
            return Err(PipelineError::ConfigError("batch_timeout must be non-zero".into()));
        }
        if self.write_timeout.is_zero() {
            return Err(PipelineError::ConfigError("write_timeout must be non-zero".into()));
        }
        if self.backoff.base.is_zero() || self.backoff.cap < self.backoff.base {
            return Err(PipelineError::ConfigError(
                "backoff base must be non-zero and not exceed the cap".into(),
            ));
        }
        Ok(())
    }
}

/// Observable lifecycle state of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferState {
    Idle,
    Accumulating,
    Flushing,
    Stopped,
}

/// Counters since the buffer started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub accepted: u64,
    pub flushed: u64,
    pub batches_written: u64,
    pub write_failures: u64,
    pub retries: u64,
    pub dropped: u64,
    pub pending: usize,
    pub state: BufferState,
}

/// Outcome of a [`BatchBuffer::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub flushed: u64,
    pub dropped: u64,
}

/// Single cancellable flush deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushTimer {
    deadline: Option<Instant>,
}

impl FlushTimer {
    /// Arms (or re-arms) the timer to fire `after` from now.
    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }

    /// Time left until the deadline (zero once due), or `None` when disarmed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    accepted: u64,
    flushed: u64,
    batches_written: u64,
    write_failures: u64,
    retries: u64,
    dropped: u64,
}

#[derive(Debug, Default)]
struct Shared {
    queue: VecDeque<Reading>,
    timer: FlushTimer,
    flushing: bool,
    /// Length of the failed batch at the head of the queue. While set, the armed timer is its
    /// retry backoff and the size threshold must not bypass it.
    retry_len: Option<usize>,
    stopped: bool,
    counters: Counters,
}

enum BufferCommand {
    Wake,
    Drain { ack: mpsc::Sender<DrainReport> },
    Shutdown,
}

/// Batching front of the durable path.
#[derive(Debug)]
pub struct BatchBuffer {
    shared: Arc<Mutex<Shared>>,
    cmd_tx: mpsc::Sender<BufferCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: BufferConfig,
}

impl BatchBuffer {
    /// Starts the flush worker and the sink writer.
    pub fn start(config: BufferConfig, sink: Arc<dyn Sink>) -> Result<Self, PipelineError> {
        config.validate()?;

        let shared = Arc::new(Mutex::new(Shared::default()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<BufferCommand>();
        let writer = SinkWriter::spawn(sink)?;

        let mut worker = FlushWorker {
            shared: Arc::clone(&shared),
            backoff: ExponentialBackoff::new(config.backoff, config.max_retries),
            config: config.clone(),
            writer,
        };
        let handle = thread::Builder::new()
            .name("sensorhub-flush".to_string())
            .spawn(move || worker.run(cmd_rx))
            .map_err(|e| PipelineError::BackgroundTaskError(format!("failed to spawn flush worker: {}", e)))?;

        Ok(BatchBuffer {
            shared,
            cmd_tx,
            worker: Mutex::new(Some(handle)),
            config,
        })
    }

    /// Appends a reading to the queue.
    ///
    /// Reaching `batch_size` wakes the worker for an immediate flush (unless a retry backoff is
    /// pending). Otherwise the first reading of a batch arms the flush timer. While a flush is
    /// executing the reading is only enqueued.
    pub fn accept(&self, reading: Reading) -> Result<(), PipelineError> {
        let (wake, pending) = {
            let mut shared = self.shared.lock()?;
            if shared.stopped {
                return Err(PipelineError::BufferStopped);
            }
            shared.queue.push_back(reading);
            shared.counters.accepted += 1;

            let wake = if shared.flushing {
                false
            } else if shared.queue.len() >= self.config.batch_size && shared.retry_len.is_none() {
                shared.timer.cancel();
                true
            } else if !shared.timer.is_armed() {
                shared.timer.arm(self.config.batch_timeout);
                true
            } else {
                false
            };
            (wake, shared.queue.len())
        };

        pipeline_metrics::record_pending(pending);
        if wake {
            self.cmd_tx.send(BufferCommand::Wake).map_err(|e| {
                PipelineError::BackgroundTaskError(format!("flush worker unreachable: {}", e))
            })?;
        }
        Ok(())
    }

    /// Flushes until the queue is empty, bypassing the batch timer. Failed batches are retried
    /// with backoff sleeps up to the retry limit and then dropped.
    pub fn drain(&self) -> Result<DrainReport, PipelineError> {
        let (tx, rx) = mpsc::channel();
        self.cmd_tx
            .send(BufferCommand::Drain { ack: tx })
            .map_err(|e| PipelineError::BackgroundTaskError(format!("Failed to send drain command: {}", e)))?;
        rx.recv()
            .map_err(|e| PipelineError::BackgroundTaskError(format!("Failed to receive drain ack: {}", e)))
    }

    /// Rejects further readings, drains, and joins the worker. Later calls return an empty report.
    pub fn stop(&self) -> Result<DrainReport, PipelineError> {
        let handle = match self.worker.lock()?.take() {
            Some(handle) => handle,
            None => return Ok(DrainReport::default()),
        };
        self.shared.lock()?.stopped = true;

        let report = self.drain();
        let _ = self.cmd_tx.send(BufferCommand::Shutdown);
        if handle.join().is_err() {
            self.config.event_listener.on_event(PipelineEvent::BufferWorkerPanicked);
            return Err(PipelineError::BackgroundTaskError("flush worker panicked".to_string()));
        }
        report
    }

    pub fn stats(&self) -> BufferStats {
        let shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let state = if shared.stopped {
            BufferState::Stopped
        } else if shared.flushing {
            BufferState::Flushing
        } else if !shared.queue.is_empty() {
            BufferState::Accumulating
        } else {
            BufferState::Idle
        };
        let c = shared.counters;
        BufferStats {
            accepted: c.accepted,
            flushed: c.flushed,
            batches_written: c.batches_written,
            write_failures: c.write_failures,
            retries: c.retries,
            dropped: c.dropped,
            pending: shared.queue.len(),
            state,
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
}

impl Drop for BatchBuffer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FlushWorker {
    shared: Arc<Mutex<Shared>>,
    config: BufferConfig,
    backoff: ExponentialBackoff,
    writer: SinkWriter,
}

impl FlushWorker {
    fn run(&mut self, cmd_rx: mpsc::Receiver<BufferCommand>) {
        let events = Arc::clone(&self.config.event_listener);
        events.on_event(PipelineEvent::BufferWorkerStarted);

        loop {
            let wait = lock_shared(&self.shared).timer.remaining(Instant::now());
            let cmd = match wait {
                Some(timeout) => cmd_rx.recv_timeout(timeout),
                None => cmd_rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
            };
            match cmd {
                Ok(BufferCommand::Wake) | Err(mpsc::RecvTimeoutError::Timeout) => self.flush_due(),
                Ok(BufferCommand::Drain { ack }) => {
                    let report = self.drain_all();
                    events.on_event(PipelineEvent::DrainCompleted {
                        flushed: report.flushed,
                        dropped: report.dropped,
                    });
                    let _ = ack.send(report);
                }
                Ok(BufferCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        events.on_event(PipelineEvent::BufferWorkerStopping);
        self.writer.shutdown();
    }

    /// Flushes while the size threshold or the timer says so.
    fn flush_due(&mut self) {
        while let Some(batch) = self.take_batch(false) {
            self.write_batch(batch);
        }
    }

    fn drain_all(&mut self) -> DrainReport {
        let before = lock_shared(&self.shared).counters;
        loop {
            // A pending retry still honours its backoff, even when draining.
            let wait = {
                let shared = lock_shared(&self.shared);
                if shared.retry_len.is_some() {
                    shared.timer.remaining(Instant::now())
                } else {
                    None
                }
            };
            if let Some(wait) = wait {
                thread::sleep(wait);
            }
            match self.take_batch(true) {
                Some(batch) => self.write_batch(batch),
                None => break,
            }
        }
        let after = lock_shared(&self.shared).counters;
        DrainReport {
            flushed: after.flushed - before.flushed,
            dropped: after.dropped - before.dropped,
        }
    }

    /// Removes up to `batch_size` readings (or the whole pending retry) from the head when a flush
    /// is due (or `force`d).
    fn take_batch(&mut self, force: bool) -> Option<Vec<Reading>> {
        let mut shared = lock_shared(&self.shared);
        if shared.queue.is_empty() {
            shared.timer.cancel();
            shared.retry_len = None;
            return None;
        }
        let size_ready = shared.queue.len() >= self.config.batch_size && shared.retry_len.is_none();
        if !(force || size_ready || shared.timer.is_due(Instant::now())) {
            return None;
        }

        shared.timer.cancel();
        shared.flushing = true;
        // A retry resends exactly the failed batch; later arrivals wait behind it.
        let n = shared
            .retry_len
            .take()
            .unwrap_or(self.config.batch_size)
            .min(shared.queue.len());
        Some(shared.queue.drain(..n).collect())
    }

    fn write_batch(&mut self, batch: Vec<Reading>) {
        let size = batch.len();
        let batch = Arc::new(batch);
        let started = Instant::now();
        let result = self.writer.write(Arc::clone(&batch), self.config.write_timeout);
        let duration = started.elapsed();
        let events = &self.config.event_listener;

        let mut shared = lock_shared(&self.shared);
        shared.flushing = false;
        match result {
            Ok(()) => {
                let attempts = self.backoff.attempt() + 1;
                self.backoff.reset();
                shared.counters.flushed += size as u64;
                shared.counters.batches_written += 1;
                pipeline_metrics::record_batch_written(duration, size as u64);
                events.on_event(PipelineEvent::BatchWritten { size, attempts, duration });
            }
            Err(error) => {
                shared.counters.write_failures += 1;
                pipeline_metrics::record_write_failure();
                let attempt = self.backoff.attempt() + 1;
                match self.backoff.next_delay() {
                    Some(retry_in) => {
                        let batch = Arc::try_unwrap(batch).unwrap_or_else(|still_held| (*still_held).clone());
                        for reading in batch.into_iter().rev() {
                            shared.queue.push_front(reading);
                        }
                        shared.counters.retries += 1;
                        shared.timer.arm(retry_in);
                        shared.retry_len = Some(size);
                        events.on_event(PipelineEvent::SinkWriteFailed {
                            size,
                            attempt,
                            error: error.to_string(),
                            retry_in,
                        });
                        return;
                    }
                    None => {
                        self.backoff.reset();
                        shared.counters.dropped += size as u64;
                        pipeline_metrics::record_dropped(size as u64);
                        events.on_event(PipelineEvent::BatchDropped {
                            size,
                            attempts: attempt,
                            error: error.to_string(),
                        });
                    }
                }
            }
        }

        // Readings that arrived during the flush wait for a fresh timer, unless they already
        // fill a batch, in which case the caller's loop flushes them right away.
        if !shared.queue.is_empty() && shared.queue.len() < self.config.batch_size {
            shared.timer.arm(self.config.batch_timeout);
        }
        pipeline_metrics::record_pending(shared.queue.len());
    }
}

struct WriteJob {
    batch: Arc<Vec<Reading>>,
    reply: mpsc::SyncSender<Result<(), SinkError>>,
}

/// Dedicated thread performing `Sink::write` so a stalled sink can be timed out.
struct SinkWriter {
    jobs: Option<mpsc::Sender<WriteJob>>,
    handle: Option<JoinHandle<()>>,
    /// A timed-out write has not reported back yet.
    stalled: bool,
}

impl SinkWriter {
    fn spawn(sink: Arc<dyn Sink>) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let handle = thread::Builder::new()
            .name("sensorhub-sink-writer".to_string())
            .spawn(move || {
                for job in rx {
                    let result = sink.write(&job.batch);
                    let _ = job.reply.send(result);
                }
            })
            .map_err(|e| PipelineError::BackgroundTaskError(format!("failed to spawn sink writer: {}", e)))?;
        Ok(SinkWriter {
            jobs: Some(tx),
            handle: Some(handle),
            stalled: false,
        })
    }

    fn write(&mut self, batch: Arc<Vec<Reading>>, timeout: Duration) -> Result<(), SinkError> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| SinkError::Unavailable("sink writer stopped".to_string()))?;
        let (reply, result) = mpsc::sync_channel(1);
        jobs.send(WriteJob { batch, reply })
            .map_err(|_| SinkError::Unavailable("sink writer exited".to_string()))?;

        // Writes are sequential, so any reply also means an earlier stalled write finished.
        match result.recv_timeout(timeout) {
            Ok(res) => {
                self.stalled = false;
                res
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.stalled = true;
                Err(SinkError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(SinkError::Unavailable("sink writer exited".to_string()))
            }
        }
    }

    /// Closes the job channel and joins the writer unless it is stuck in a timed-out write.
    fn shutdown(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if !self.stalled {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::telemetry::testing::RecordingListener;
    use crate::types::{Metric, SensorId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reading(i: u64) -> Reading {
        Reading::builder(SensorId::from(1 + i % 3))
            .metric(Metric::Temperature, i as f64)
            .message_id(format!("m-{}", i))
            .build()
    }

    /// Fails the first `failures` writes, then records batches.
    #[derive(Debug)]
    struct FlakySink {
        failures: AtomicUsize,
        batches: Mutex<Vec<Vec<Reading>>>,
    }

    impl FlakySink {
        fn failing(n: usize) -> Self {
            FlakySink {
                failures: AtomicUsize::new(n),
                batches: Mutex::new(Vec::new()),
            }
        }
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    impl Sink for FlakySink {
        fn write(&self, batch: &[Reading]) -> Result<(), SinkError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(SinkError::Unavailable("down".to_string()));
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn fast_config(batch_size: usize, batch_timeout: Duration) -> BufferConfig {
        BufferConfig {
            batch_size,
            batch_timeout,
            backoff: BackoffPolicy {
                base: Duration::from_millis(5),
                multiplier: 2,
                cap: Duration::from_millis(20),
            },
            max_retries: 2,
            write_timeout: Duration::from_secs(2),
            event_listener: noop_event_listener(),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_flush_timer() {
        let mut timer = FlushTimer::default();
        assert!(!timer.is_armed());
        assert_eq!(timer.remaining(Instant::now()), None);
        timer.arm(Duration::from_secs(60));
        assert!(timer.is_armed());
        assert!(!timer.is_due(Instant::now()));
        assert!(timer.is_due(Instant::now() + Duration::from_secs(61)));
        timer.cancel();
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let sink: Arc<dyn Sink> = Arc::new(MemorySink::new());
        let config = BufferConfig {
            batch_size: 0,
            ..BufferConfig::default()
        };
        assert!(matches!(
            BatchBuffer::start(config, sink),
            Err(PipelineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_size_threshold_flushes_one_full_batch() {
        let sink = Arc::new(MemorySink::new());
        let buffer =
            BatchBuffer::start(fast_config(10, Duration::from_secs(60)), sink.clone()).unwrap();
        for i in 0..10 {
            buffer.accept(reading(i)).unwrap();
        }
        wait_for(|| sink.batches_written() == 1);
        assert_eq!(sink.record_count(), 10);
        let stats = buffer.stats();
        assert_eq!(stats.batches_written, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.state, BufferState::Idle);
    }

    #[test]
    fn test_timer_flushes_partial_batch() {
        let sink = Arc::new(MemorySink::new());
        let buffer =
            BatchBuffer::start(fast_config(10, Duration::from_millis(50)), sink.clone()).unwrap();
        buffer.accept(reading(1)).unwrap();
        buffer.accept(reading(2)).unwrap();
        assert_eq!(buffer.stats().state, BufferState::Accumulating);
        wait_for(|| sink.record_count() == 2);
        assert_eq!(sink.batches_written(), 1);
    }

    #[test]
    fn test_failed_batch_retried_then_written() {
        let sink = Arc::new(FlakySink::failing(1));
        let buffer =
            BatchBuffer::start(fast_config(3, Duration::from_secs(60)), sink.clone()).unwrap();
        for i in 0..3 {
            buffer.accept(reading(i)).unwrap();
        }
        wait_for(|| sink.batch_sizes() == vec![3]);
        let stats = buffer.stats();
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.flushed, 3);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn test_batch_dropped_after_retry_limit() {
        let listener = Arc::new(RecordingListener::default());
        let sink = Arc::new(FlakySink::failing(usize::MAX));
        let config = BufferConfig {
            event_listener: listener.clone(),
            ..fast_config(2, Duration::from_secs(60))
        };
        let buffer = BatchBuffer::start(config, sink).unwrap();
        buffer.accept(reading(1)).unwrap();
        buffer.accept(reading(2)).unwrap();

        wait_for(|| buffer.stats().dropped == 2);
        let stats = buffer.stats();
        // First attempt plus two retries.
        assert_eq!(stats.write_failures, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.pending, 0);
        assert!(listener
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::BatchDropped { size: 2, attempts: 3, .. })));
    }

    #[test]
    fn test_stop_drains_and_rejects() {
        let sink = Arc::new(MemorySink::new());
        let buffer =
            BatchBuffer::start(fast_config(10, Duration::from_secs(60)), sink.clone()).unwrap();
        for i in 0..4 {
            buffer.accept(reading(i)).unwrap();
        }
        let report = buffer.stop().unwrap();
        assert_eq!(report, DrainReport { flushed: 4, dropped: 0 });
        assert_eq!(sink.record_count(), 4);
        assert!(matches!(buffer.accept(reading(9)), Err(PipelineError::BufferStopped)));
        assert_eq!(buffer.stats().state, BufferState::Stopped);
        assert_eq!(buffer.stop().unwrap(), DrainReport::default());
    }

    #[derive(Debug)]
    struct StallingSink {
        release: Mutex<Option<mpsc::Receiver<()>>>,
        inner: MemorySink,
    }

    impl Sink for StallingSink {
        fn write(&self, batch: &[Reading]) -> Result<(), SinkError> {
            if let Some(rx) = self.release.lock().unwrap().take() {
                let _ = rx.recv();
            }
            self.inner.write(batch)
        }
    }

    #[test]
    fn test_write_timeout_counts_as_failure() {
        let (release_tx, release_rx) = mpsc::channel();
        let sink = Arc::new(StallingSink {
            release: Mutex::new(Some(release_rx)),
            inner: MemorySink::new(),
        });
        let config = BufferConfig {
            write_timeout: Duration::from_millis(30),
            max_retries: 50,
            ..fast_config(1, Duration::from_secs(60))
        };
        let buffer = BatchBuffer::start(config, sink.clone()).unwrap();
        buffer.accept(reading(7)).unwrap();

        wait_for(|| buffer.stats().write_failures >= 1);
        release_tx.send(()).unwrap();
        wait_for(|| buffer.stats().flushed == 1);
        // The stalled write and the retry both land; the message id keeps it to one record.
        assert_eq!(sink.inner.count_for_message("m-7"), 1);
    }
}
