//! Sensor telemetry ingestion daemon.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`SENSORHUB_*`), and CLI flags. Starts the pipeline, optionally connects to an upstream
//! producer, serves the HTTP ingestion/query API plus a server-sent `sensor_update` stream, and
//! runs until graceful shutdown (SIGINT/SIGTERM), draining the buffer on the way out.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use clap::Parser;
use config::{Config, Environment, File};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use sensorhub::broadcast::{Observer, PushError, SensorUpdate};
use sensorhub::persistence::LogFileSink;
use sensorhub::retry::BackoffPolicy;
use sensorhub::sink::{MemorySink, Sink};
use sensorhub::telemetry::TracingEventListener;
use sensorhub::upstream::{TcpLineConnector, UpstreamReader};
use sensorhub::{Pipeline, PipelineConfig, PipelineError, SensorId};

const DEFAULT_HTTP_BIND: &str = "127.0.0.1:3000";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_SENSORS: u64 = 10;
const MAX_BODY_BYTES: usize = 64 * 1024;
const SSE_QUEUE: usize = 16;

// ---------- CLI ----------

/// Sensor telemetry ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "sensorhubd", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `./sensorhubd.toml` is loaded when present.
    #[arg(long, env = "SENSORHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the directory holding the reading log.
    #[arg(long, env = "SENSORHUB_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Keep sunk readings in memory only (no reading log).
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config, print the effective settings, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// HTTP listen address (e.g. 127.0.0.1:3000 or 0.0.0.0:3000).
    #[arg(long, env = "SENSORHUB_HTTP_BIND")]
    pub http_bind: Option<String>,

    /// Upstream producer (`host:port`) streaming newline-delimited JSON readings.
    #[arg(long, env = "SENSORHUB_UPSTREAM")]
    pub upstream: Option<String>,
}

// ---------- File/env config (all optional for partial config) ----------

/// Top-level daemon config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct DaemonFileConfig {
    pub http_bind: Option<String>,
    pub data_dir: Option<String>,
    /// `false` keeps sunk readings in memory only.
    pub persist: Option<bool>,
    pub upstream: Option<String>,
    /// Sensors 1..=N known at startup.
    pub sensors: Option<u64>,
    pub history_capacity: Option<usize>,
    pub batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub write_timeout_ms: Option<u64>,
    pub retry_base_ms: Option<u64>,
    pub retry_cap_ms: Option<u64>,
    pub broadcast_period_ms: Option<u64>,
}

/// Runtime options for the daemon derived from config + env + CLI.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub http_bind: SocketAddr,
    pub data_dir: PathBuf,
    pub persist: bool,
    pub upstream: Option<String>,
    pub sensors: u64,
}

fn parse_http_bind(s: &str) -> Result<SocketAddr, String> {
    s.parse::<SocketAddr>()
        .map_err(|e| format!("invalid http_bind {:?}: {}", s, e))
}

/// Load merged config and daemon options. CLI overrides file/env for both.
fn load_daemon_config(cli: &Cli) -> Result<(PipelineConfig, DaemonOptions), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("sensorhubd.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("SENSORHUB")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: DaemonFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut config = PipelineConfig::default();
    config.event_listener = Arc::new(TracingEventListener);
    merge_into_pipeline_config(&mut config, &partial);

    let sensors = partial.sensors.unwrap_or(DEFAULT_SENSORS);
    config.store.preregistered = (1..=sensors).map(SensorId::from).collect();
    config.validate().map_err(|e| e.to_string())?;

    let http_bind_str = cli
        .http_bind
        .as_deref()
        .or(partial.http_bind.as_deref())
        .unwrap_or(DEFAULT_HTTP_BIND);
    let http_bind = parse_http_bind(http_bind_str)?;

    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| partial.data_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    let options = DaemonOptions {
        http_bind,
        data_dir,
        persist: !cli.in_memory && partial.persist.unwrap_or(true),
        upstream: cli.upstream.clone().or_else(|| partial.upstream.clone()),
        sensors,
    };
    Ok((config, options))
}

/// Merge file/env partial config onto `PipelineConfig`. Only overwrites fields that are `Some`.
fn merge_into_pipeline_config(base: &mut PipelineConfig, partial: &DaemonFileConfig) {
    if let Some(n) = partial.history_capacity {
        base.store.capacity = n;
    }
    if let Some(n) = partial.batch_size {
        base.buffer.batch_size = n;
    }
    if let Some(ms) = partial.batch_timeout_ms {
        base.buffer.batch_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = partial.max_retries {
        base.buffer.max_retries = n;
    }
    if let Some(ms) = partial.write_timeout_ms {
        base.buffer.write_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = partial.retry_base_ms {
        base.buffer.backoff.base = Duration::from_millis(ms);
    }
    if let Some(ms) = partial.retry_cap_ms {
        base.buffer.backoff.cap = Duration::from_millis(ms);
    }
    if let Some(ms) = partial.broadcast_period_ms {
        base.broadcast.period = Duration::from_millis(ms);
    }
}

fn print_effective_config(config: &PipelineConfig, options: &DaemonOptions) {
    println!("http_bind={}", options.http_bind);
    println!("storage={}", storage_kind(options));
    println!("data_dir={}", options.data_dir.display());
    println!("upstream={}", options.upstream.as_deref().unwrap_or("<none>"));
    println!("sensors={}", options.sensors);
    println!("history_capacity={}", config.store.capacity);
    println!("batch_size={}", config.buffer.batch_size);
    println!("batch_timeout_ms={}", config.buffer.batch_timeout.as_millis());
    println!("max_retries={}", config.buffer.max_retries);
    println!("write_timeout_ms={}", config.buffer.write_timeout.as_millis());
    println!("retry_base_ms={}", config.buffer.backoff.base.as_millis());
    println!("retry_cap_ms={}", config.buffer.backoff.cap.as_millis());
    println!("broadcast_period_ms={}", config.broadcast.period.as_millis());
}

fn storage_kind(options: &DaemonOptions) -> &'static str {
    if options.persist {
        "log-file"
    } else {
        "in-memory"
    }
}

// ---------- Safe startup checks ----------

/// Ensures `data_dir` exists and is writable. Returns an error message on failure.
fn check_data_dir_writable(data_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| format!("data_dir {} cannot be created: {}", data_dir.display(), e))?;
    let marker = data_dir.join(".sensorhub_write_check");
    std::fs::write(&marker, b"")
        .map_err(|e| format!("data_dir {} not writable: {}", data_dir.display(), e))?;
    let _ = std::fs::remove_file(marker);
    Ok(())
}

// ---------- HTTP ----------

type Body = UnsyncBoxBody<Bytes, Infallible>;

struct AppState {
    pipeline: Arc<Pipeline>,
    ready: AtomicBool,
    storage: &'static str,
    next_observer: AtomicU64,
    #[cfg(feature = "prometheus")]
    metrics: Option<sensorhub::telemetry::pipeline_metrics::InProcessPrometheus>,
}

/// Forwards broadcasts into one server-sent events response.
#[derive(Debug)]
struct SseObserver {
    id: String,
    tx: tokio::sync::mpsc::Sender<Arc<SensorUpdate>>,
}

impl Observer for SseObserver {
    fn id(&self) -> &str {
        &self.id
    }

    fn push(&self, update: &Arc<SensorUpdate>) -> Result<(), PushError> {
        use tokio::sync::mpsc::error::TrySendError;
        self.tx.try_send(Arc::clone(update)).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Disconnected,
        })
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct IngestAck {
    success: bool,
    message: String,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    sensors_online: usize,
    storage: &'static str,
    timestamp: String,
    buffer: sensorhub::buffer::BufferStats,
    observers: usize,
}

fn response(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    response(status, "text/plain; charset=utf-8", Full::new(Bytes::from(body)).boxed_unsync())
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => response(status, "application/json", Full::new(Bytes::from(bytes)).boxed_unsync()),
        Err(e) => {
            tracing::error!(error = %e, "response serialization failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
        }
    }
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    json(status, &ErrorBody { error: message.into() })
}

fn pipeline_error(e: &PipelineError) -> Response<Body> {
    match e {
        PipelineError::SensorNotFound(_) => error_json(StatusCode::NOT_FOUND, "Sensor not found"),
        PipelineError::InvalidMetric(_) => error_json(StatusCode::BAD_REQUEST, "Invalid parameter"),
        PipelineError::BufferStopped => error_json(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        e if e.is_client_error() => error_json(StatusCode::BAD_REQUEST, e.to_string()),
        e => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Window length in minutes from a path segment; unparsable or zero means one minute.
fn minutes(segment: &str) -> Duration {
    let minutes = segment.parse::<u64>().ok().filter(|m| *m > 0).unwrap_or(1);
    Duration::from_secs(minutes.saturating_mul(60))
}

async fn ingest(state: &AppState, req: Request<Incoming>) -> Response<Body> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return error_json(StatusCode::BAD_REQUEST, format!("unreadable body: {}", e)),
    };
    match state.pipeline.ingest_bytes(&body) {
        Ok(reading) => json(
            StatusCode::OK,
            &IngestAck {
                success: true,
                message: format!("Sensor {} data recorded", reading.sensor_id()),
            },
        ),
        Err(e) => pipeline_error(&e),
    }
}

fn events_stream(state: &AppState) -> Response<Body> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Arc<SensorUpdate>>(SSE_QUEUE);
    let id = format!("sse-{}", state.next_observer.fetch_add(1, Ordering::Relaxed));
    state.pipeline.subscribe(Arc::new(SseObserver { id, tx }));

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let update = rx.recv().await?;
        let frame = match update.readings_json() {
            Ok(data) => format!("event: {}\ndata: {}\n\n", update.event, data),
            Err(e) => format!(": dropped update: {}\n\n", e),
        };
        Some((Ok::<_, Infallible>(Frame::data(Bytes::from(frame))), rx))
    });

    let mut resp = response(
        StatusCode::OK,
        "text/event-stream",
        StreamBody::new(stream).boxed_unsync(),
    );
    resp.headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}

#[cfg(feature = "prometheus")]
fn metrics_text(state: &AppState) -> Response<Body> {
    match &state.metrics {
        Some(m) => response(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            Full::new(Bytes::from(m.render())).boxed_unsync(),
        ),
        None => text(StatusCode::NOT_FOUND, "metrics recorder not installed"),
    }
}

#[cfg(not(feature = "prometheus"))]
fn metrics_text(_state: &AppState) -> Response<Body> {
    text(StatusCode::NOT_FOUND, "metrics support not compiled in")
}

async fn service(state: Arc<AppState>, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let pipeline = &state.pipeline;

    let resp = match (&method, segments.as_slice()) {
        (&Method::POST, ["api", "sensor-data"]) => ingest(&state, req).await,
        (&Method::GET, ["latest"]) => json(StatusCode::OK, &pipeline.latest_all()),
        (&Method::GET, ["history", sensor, window]) => match SensorId::new(*sensor) {
            Ok(id) => match pipeline.window(&id, minutes(window)) {
                Ok(readings) => json(StatusCode::OK, &readings),
                Err(e) => pipeline_error(&e),
            },
            Err(_) => error_json(StatusCode::NOT_FOUND, "Sensor not found"),
        },
        (&Method::GET, ["analysis", sensor, metric, window]) => match SensorId::new(*sensor) {
            Ok(id) => match pipeline.compute_stats(&id, metric, minutes(window)) {
                Ok(stats) => json(StatusCode::OK, &stats),
                Err(e) => pipeline_error(&e),
            },
            Err(_) => error_json(StatusCode::NOT_FOUND, "Sensor not found"),
        },
        (&Method::GET, ["overview", window]) => {
            json(StatusCode::OK, &pipeline.overview(minutes(window)))
        }
        (&Method::GET, ["health"]) => json(
            StatusCode::OK,
            &HealthBody {
                status: "ok",
                sensors_online: pipeline.store().len(),
                storage: state.storage,
                timestamp: Utc::now().to_rfc3339(),
                buffer: pipeline.buffer_stats(),
                observers: pipeline.observer_count(),
            },
        ),
        // Liveness: process is alive and responding.
        (&Method::GET, ["healthz"]) => text(StatusCode::OK, "ok"),
        // Readiness: pipeline started and accepting readings.
        (&Method::GET, ["readyz"]) => {
            if state.ready.load(Ordering::Acquire) {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        (&Method::GET, ["metrics"]) => metrics_text(&state),
        (&Method::GET, ["events"]) => events_stream(&state),
        _ => error_json(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(resp)
}

/// Returns a future that completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c handler failed");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Serves HTTP until a shutdown signal, then stops the pipeline (which drains the buffer and
/// ends every event stream) and waits for open connections.
async fn run_server(
    state: Arc<AppState>,
    options: DaemonOptions,
    mut upstream: Option<UpstreamReader>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(options.http_bind)
        .await
        .map_err(|e| format!("failed to bind {}: {}", options.http_bind, e))?;
    tracing::info!(
        http = %options.http_bind,
        storage = state.storage,
        data_dir = %options.data_dir.display(),
        "sensorhubd running; press Ctrl+C or send SIGTERM to stop"
    );

    let server = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            Ok((stream, _addr)) = listener.accept() => {
                let io = TokioIo::new(Box::pin(stream));
                let state = Arc::clone(&state);
                let conn = server.serve_connection_with_upgrades(io, service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { service(state, req).await }
                }));
                let fut = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        tracing::debug!(error = ?e, "connection error");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    drop(listener);
    state.ready.store(false, Ordering::Release);

    let pipeline = Arc::clone(&state.pipeline);
    let stopped = tokio::task::spawn_blocking(move || {
        if let Some(reader) = upstream.as_mut() {
            reader.stop();
        }
        pipeline.stop()
    })
    .await;
    match stopped {
        Ok(Ok(report)) => tracing::info!(
            flushed = report.flushed,
            dropped = report.dropped,
            "pipeline stopped"
        ),
        Ok(Err(e)) => tracing::error!(error = %e, "pipeline stop failed"),
        Err(e) => tracing::error!(error = %e, "pipeline stop task failed"),
    }

    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
    tokio::select! {
        _ = graceful.shutdown() => {
            tracing::info!("all connections closed");
        }
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            tracing::warn!("shutdown timeout waiting for connections");
        }
    }
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ---------- Main ----------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing();

    let (config, options) = load_daemon_config(&cli).map_err(|e| {
        tracing::error!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        print_effective_config(&config, &options);
        return Ok(());
    }

    let sink: Arc<dyn Sink> = if options.persist {
        check_data_dir_writable(&options.data_dir).map_err(|e| {
            tracing::error!("startup check failed: {}", e);
            e
        })?;
        let sink = LogFileSink::open(&options.data_dir).map_err(|e| {
            tracing::error!("failed to open reading log: {}", e);
            e
        })?;
        tracing::info!(path = %sink.path().display(), records = sink.record_count(), "reading log opened");
        Arc::new(sink)
    } else {
        Arc::new(MemorySink::new())
    };

    #[cfg(feature = "prometheus")]
    let metrics = match sensorhub::telemetry::pipeline_metrics::InProcessPrometheus::install(
        Duration::from_secs(5),
    ) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = %e, "metrics disabled");
            None
        }
    };

    let backoff = config.buffer.backoff;
    let events = Arc::clone(&config.event_listener);
    let pipeline = Arc::new(Pipeline::start(config, sink).map_err(|e| {
        tracing::error!("failed to start pipeline: {}", e);
        e
    })?);

    let upstream = match &options.upstream {
        Some(addr) => Some(UpstreamReader::spawn(
            TcpLineConnector::new(addr.clone()),
            Arc::clone(&pipeline),
            backoff,
            events,
        )?),
        None => None,
    };

    let state = Arc::new(AppState {
        pipeline,
        ready: AtomicBool::new(true),
        storage: storage_kind(&options),
        next_observer: AtomicU64::new(1),
        #[cfg(feature = "prometheus")]
        metrics,
    });
    run_server(state, options, upstream).await
}
