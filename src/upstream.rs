//! Upstream source reader: pulls newline-delimited JSON from a producer and feeds the pipeline.
//!
//! Connection failures are never fatal. The reader reconnects forever with capped exponential
//! backoff, resetting the backoff after every successful connect.

use crate::core::Pipeline;
use crate::error::PipelineError;
use crate::retry::{BackoffPolicy, ExponentialBackoff};
use crate::telemetry::{PipelineEvent, PipelineEventListener};
use std::io::{self, BufRead, BufReader};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often blocked reads and backoff sleeps re-check the stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Opens a line-oriented byte stream to an upstream producer.
pub trait Connector: Send + 'static {
    /// Human-readable endpoint used in events.
    fn endpoint(&self) -> String;

    /// Opens a new stream. Reads on it should time out periodically (`WouldBlock`/`TimedOut`)
    /// so the reader can notice a stop request.
    fn connect(&mut self) -> Result<Box<dyn BufRead + Send>, PipelineError>;
}

/// TCP connector for `host:port` producers.
#[derive(Debug, Clone)]
pub struct TcpLineConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpLineConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        TcpLineConnector {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for TcpLineConnector {
    fn endpoint(&self) -> String {
        self.addr.clone()
    }

    fn connect(&mut self) -> Result<Box<dyn BufRead + Send>, PipelineError> {
        let addr = self
            .addr
            .to_socket_addrs()
            .map_err(|e| PipelineError::Connection(format!("{}: {}", self.addr, e)))?
            .next()
            .ok_or_else(|| PipelineError::Connection(format!("{}: no address", self.addr)))?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| PipelineError::Connection(format!("{}: {}", self.addr, e)))?;
        stream
            .set_read_timeout(Some(STOP_POLL))
            .map_err(|e| PipelineError::Connection(e.to_string()))?;
        Ok(Box::new(BufReader::new(stream)))
    }
}

/// Handle to a running upstream reader thread.
#[derive(Debug)]
pub struct UpstreamReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UpstreamReader {
    /// Spawns the reader. Every complete line is passed to [`Pipeline::ingest_bytes`]; decode
    /// failures are reported by the pipeline and do not interrupt the stream.
    pub fn spawn<C: Connector>(
        mut connector: C,
        pipeline: Arc<Pipeline>,
        backoff: BackoffPolicy,
        events: Arc<dyn PipelineEventListener>,
    ) -> Result<Self, PipelineError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("sensorhub-upstream".to_string())
            .spawn(move || {
                let endpoint = connector.endpoint();
                let mut backoff = ExponentialBackoff::unbounded(backoff);
                while !stop_flag.load(Ordering::Relaxed) {
                    let error = match connector.connect() {
                        Ok(mut stream) => {
                            events.on_event(PipelineEvent::UpstreamConnected {
                                endpoint: endpoint.clone(),
                            });
                            backoff.reset();
                            match pump_lines(&mut *stream, &pipeline, &stop_flag) {
                                Ok(()) => break,
                                Err(e) => e.to_string(),
                            }
                        }
                        Err(e) => e.to_string(),
                    };
                    let retry_in = backoff.next_delay().unwrap_or(backoff.policy().cap);
                    events.on_event(PipelineEvent::UpstreamDisconnected {
                        endpoint: endpoint.clone(),
                        error,
                        retry_in,
                    });
                    sleep_unless_stopped(retry_in, &stop_flag);
                }
            })
            .map_err(|e| PipelineError::BackgroundTaskError(format!("failed to spawn upstream reader: {}", e)))?;

        Ok(UpstreamReader {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UpstreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Feeds complete lines to the pipeline until the stream ends (`Err`) or a stop is requested
/// (`Ok`). Lines are handed over as raw bytes so invalid UTF-8 is rejected by the decoder like any
/// other malformed payload.
fn pump_lines(
    stream: &mut dyn BufRead,
    pipeline: &Pipeline,
    stop: &AtomicBool,
) -> Result<(), io::Error> {
    let mut line = Vec::new();
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        // A timed-out read keeps the partial line in `line`; it is only cleared once complete.
        match stream.read_until(b'\n', &mut line) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by upstream",
                ))
            }
            Ok(_) if line.ends_with(b"\n") => {
                let payload = line.trim_ascii();
                if !payload.is_empty() {
                    let _ = pipeline.ingest_bytes(payload);
                }
                line.clear();
            }
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return;
        }
        thread::sleep(left.min(STOP_POLL));
    }
}
