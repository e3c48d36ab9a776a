//! End-to-end pipeline behaviour: fan-out, path independence, lifecycle and upstream ingestion.

use sensorhub::broadcast::{BroadcastConfig, ChannelObserver};
use sensorhub::buffer::BufferConfig;
use sensorhub::retry::BackoffPolicy;
use sensorhub::storage::StoreConfig;
use sensorhub::telemetry::{PipelineEvent, PipelineEventListener};
use sensorhub::upstream::{TcpLineConnector, UpstreamReader};
use sensorhub::{
    MemorySink, Pipeline, PipelineConfig, PipelineError, Reading, SensorId, Sink, SinkError,
};
use std::io::Write;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Sink that is down until switched on.
#[derive(Debug, Default)]
struct OutageSink {
    up: AtomicBool,
    inner: MemorySink,
}

impl Sink for OutageSink {
    fn write(&self, batch: &[Reading]) -> Result<(), SinkError> {
        if self.up.load(Ordering::Relaxed) {
            self.inner.write(batch)
        } else {
            Err(SinkError::Unavailable("database offline".to_string()))
        }
    }
}

#[derive(Debug, Default)]
struct CollectingListener {
    events: Mutex<Vec<PipelineEvent>>,
}

impl PipelineEventListener for CollectingListener {
    fn on_event(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        broadcast: BroadcastConfig {
            period: Duration::from_secs(3600),
            ..BroadcastConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn live_queries_work_while_sink_is_down() {
    let sink = Arc::new(OutageSink::default());
    let config = PipelineConfig {
        buffer: BufferConfig {
            batch_size: 5,
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                multiplier: 2,
                cap: Duration::from_millis(50),
            },
            max_retries: 100,
            ..BufferConfig::default()
        },
        ..quiet_config()
    };
    let pipeline = Pipeline::start(config, sink.clone()).unwrap();

    for i in 0..5 {
        let payload = format!(r#"{{"sensor_id": 1, "temperature": {}, "msg_id": "m{}"}}"#, 20 + i, i);
        pipeline.ingest_bytes(payload.as_bytes()).unwrap();
    }
    wait_for(|| pipeline.buffer_stats().write_failures >= 2, "failed attempts");

    // The live path is unaffected by the outage.
    let stats = pipeline
        .compute_stats(&SensorId::from(1), "temperature", Duration::from_secs(60))
        .unwrap();
    assert_eq!(stats.count, 5);
    assert_eq!(stats.mean, 22.0);
    assert_eq!(sink.inner.record_count(), 0);

    sink.up.store(true, Ordering::Relaxed);
    wait_for(|| sink.inner.record_count() == 5, "recovery flush");
    let stats = pipeline.buffer_stats();
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.flushed, 5);
    pipeline.stop().unwrap();
}

#[test]
fn replayed_message_is_stored_once() {
    let sink = Arc::new(MemorySink::new());
    let pipeline = Pipeline::start(quiet_config(), sink.clone()).unwrap();

    for _ in 0..3 {
        pipeline
            .ingest_bytes(br#"{"sensor_id": 9, "humidity": 55, "message_id": "X"}"#)
            .unwrap();
    }
    pipeline.drain().unwrap();
    assert_eq!(sink.count_for_message("X"), 1);
    assert_eq!(sink.record_count(), 1);
    pipeline.stop().unwrap();
}

#[test]
fn rejected_payloads_do_not_stop_ingestion() {
    let listener = Arc::new(CollectingListener::default());
    let config = PipelineConfig {
        event_listener: listener.clone(),
        ..quiet_config()
    };
    let pipeline = Pipeline::start(config, Arc::new(MemorySink::new())).unwrap();

    assert!(matches!(
        pipeline.ingest_bytes(b"\xff\xfe"),
        Err(PipelineError::Parse(_))
    ));
    assert!(matches!(
        pipeline.ingest_bytes(br#"{"sensor_id": 1, "temperature": "hot"}"#),
        Err(PipelineError::Validation { .. })
    ));
    pipeline
        .ingest_bytes(br#"{"sensor_id": 1, "temperature": 18}"#)
        .unwrap();

    assert_eq!(pipeline.latest_all().len(), 1);
    let rejected = listener
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, PipelineEvent::ReadingRejected { .. }))
        .count();
    assert_eq!(rejected, 2);
}

#[test]
fn overview_includes_preregistered_sensors() {
    let config = PipelineConfig {
        store: StoreConfig {
            preregistered: (1..=3).map(SensorId::from).collect(),
            ..StoreConfig::default()
        },
        ..quiet_config()
    };
    let pipeline = Pipeline::start(config, Arc::new(MemorySink::new())).unwrap();
    pipeline
        .ingest_bytes(br#"{"sensor_id": 2, "temperature": 30, "sensor_name": "Kiln"}"#)
        .unwrap();

    let rows = pipeline.overview(Duration::from_secs(60));
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1].sensor_name, "Kiln");
    assert_eq!(rows[1].reading_count, 1);
    assert_eq!(rows[0].sensor_name, "Sensor_1");
    assert_eq!(rows[2].reading_count, 0);
}

#[test]
fn stop_ends_subscriptions_and_flushes() {
    let sink = Arc::new(MemorySink::new());
    let pipeline = Pipeline::start(quiet_config(), sink.clone()).unwrap();
    let (observer, rx) = ChannelObserver::bounded("ws", 4);
    pipeline.subscribe(Arc::new(observer));
    assert_eq!(pipeline.observer_count(), 1);

    pipeline
        .ingest(Reading::builder(SensorId::from(1)).message_id("only").build())
        .unwrap();
    assert_eq!(pipeline.broadcast_now().delivered, 1);

    let report = pipeline.stop().unwrap();
    assert_eq!(report.flushed, 1);
    assert_eq!(sink.count_for_message("only"), 1);

    assert!(rx.recv().is_ok());
    assert!(rx.recv().is_err(), "channel closes on stop");
    assert_eq!(pipeline.observer_count(), 0);
    // Idempotent.
    assert_eq!(pipeline.stop().unwrap().flushed, 0);
}

#[test]
fn upstream_tcp_lines_reach_the_store() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let producer = thread::spawn(move || {
        // First connection drops mid-stream; the reader must reconnect for the rest.
        let (mut conn, _) = listener.accept().unwrap();
        conn.write_all(b"{\"sensor_id\": 1, \"temperature\": 20}\n{\"sensor_id\": 2,")
            .unwrap();
        drop(conn);
        let (mut conn, _) = listener.accept().unwrap();
        conn.write_all(b"{\"sensor_id\": 3, \"temperature\": 22}\n").unwrap();
        thread::sleep(Duration::from_millis(300));
    });

    let pipeline = Arc::new(Pipeline::start(quiet_config(), Arc::new(MemorySink::new())).unwrap());
    let events = Arc::new(CollectingListener::default());
    let mut reader = UpstreamReader::spawn(
        TcpLineConnector::new(addr),
        Arc::clone(&pipeline),
        BackoffPolicy {
            base: Duration::from_millis(10),
            multiplier: 2,
            cap: Duration::from_millis(50),
        },
        events.clone(),
    )
    .unwrap();

    wait_for(|| pipeline.latest(&SensorId::from(3)).is_some(), "second connection");
    reader.stop();
    producer.join().unwrap();

    assert!(pipeline.latest(&SensorId::from(1)).is_some());
    // The torn line from the dropped connection is discarded.
    assert!(pipeline.latest(&SensorId::from(2)).is_none());
    let connected = events
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, PipelineEvent::UpstreamConnected { .. }))
        .count();
    assert!(connected >= 2);
}
