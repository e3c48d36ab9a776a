//! Broadcaster: periodic delivery, empty-snapshot suppression and observer failure isolation.

use sensorhub::broadcast::{BroadcastConfig, ChannelObserver, PushError, SENSOR_UPDATE_EVENT};
use sensorhub::storage::StoreConfig;
use sensorhub::{Broadcaster, Metric, Observer, Reading, SensorId, SensorUpdate, SeriesStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Always fails with a transient error.
#[derive(Debug, Default)]
struct FailingObserver {
    attempts: AtomicUsize,
}

impl Observer for FailingObserver {
    fn id(&self) -> &str {
        "failing"
    }

    fn push(&self, _update: &Arc<SensorUpdate>) -> Result<(), PushError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(PushError::Failed("socket write error".to_string()))
    }
}

fn store_with(sensors: &[u64]) -> Arc<SeriesStore> {
    let store = Arc::new(SeriesStore::new(StoreConfig::default()).unwrap());
    for &id in sensors {
        let reading = Reading::builder(SensorId::from(id))
            .metric(Metric::Voltage, 3.3)
            .build();
        store.append(Arc::new(reading)).unwrap();
    }
    store
}

fn config(period: Duration) -> BroadcastConfig {
    BroadcastConfig {
        period,
        ..BroadcastConfig::default()
    }
}

#[test]
fn ticker_pushes_latest_readings_every_period() {
    let store = store_with(&[3, 1, 2]);
    let broadcaster = Broadcaster::start(config(Duration::from_millis(50)), store).unwrap();
    let (observer, rx) = ChannelObserver::bounded("dashboard", 16);
    broadcaster.subscribe(Arc::new(observer));

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.event, SENSOR_UPDATE_EVENT);
    let ids: Vec<&str> = first.readings.iter().map(|r| r.sensor_id().as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(second.readings.len(), 3);

    let json: serde_json::Value = serde_json::from_str(&first.readings_json().unwrap()).unwrap();
    assert_eq!(json.as_array().map(Vec::len), Some(3));
    assert_eq!(json[0]["metrics"]["voltage"], 3.3);

    broadcaster.stop().unwrap();
}

#[test]
fn empty_store_emits_nothing() {
    let store = store_with(&[]);
    let broadcaster = Broadcaster::start(config(Duration::from_millis(20)), store).unwrap();
    let (observer, rx) = ChannelObserver::bounded("idle", 4);
    broadcaster.subscribe(Arc::new(observer));

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(broadcaster.tick_now().readings, 0);
}

#[test]
fn failing_observer_does_not_affect_others() {
    let store = store_with(&[1]);
    let broadcaster = Broadcaster::start(config(Duration::from_secs(3600)), store).unwrap();
    let failing = Arc::new(FailingObserver::default());
    let (healthy, rx) = ChannelObserver::bounded("healthy", 4);
    broadcaster.subscribe(failing.clone());
    broadcaster.subscribe(Arc::new(healthy));

    for _ in 0..3 {
        let report = broadcaster.tick_now();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
    }
    assert_eq!(failing.attempts.load(Ordering::Relaxed), 3);
    // A transient failure keeps the observer subscribed.
    assert_eq!(broadcaster.observer_count(), 2);
    assert_eq!(rx.try_iter().count(), 3);
}

#[test]
fn disconnected_observer_is_removed() {
    let store = store_with(&[1]);
    let broadcaster = Broadcaster::start(config(Duration::from_secs(3600)), store).unwrap();
    let (gone, rx_gone) = ChannelObserver::bounded("gone", 1);
    let (stays, _rx_stays) = ChannelObserver::bounded("stays", 1);
    broadcaster.subscribe(Arc::new(gone));
    broadcaster.subscribe(Arc::new(stays));
    drop(rx_gone);

    let report = broadcaster.tick_now();
    assert_eq!(report.removed, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(broadcaster.observer_count(), 1);

    // The full queue of "stays" is a transient failure, not a disconnect.
    let report = broadcaster.tick_now();
    assert_eq!(report.failed, 1);
    assert_eq!(broadcaster.observer_count(), 1);
}

#[test]
fn stop_releases_observers() {
    let store = store_with(&[1]);
    let broadcaster = Broadcaster::start(config(Duration::from_secs(3600)), store).unwrap();
    let (observer, rx) = ChannelObserver::bounded("o", 1);
    broadcaster.subscribe(Arc::new(observer));
    assert!(broadcaster.unsubscribe("o"));
    assert!(!broadcaster.unsubscribe("o"));

    let (observer, rx2) = ChannelObserver::bounded("o2", 1);
    broadcaster.subscribe(Arc::new(observer));
    broadcaster.stop().unwrap();

    assert_eq!(broadcaster.observer_count(), 0);
    assert!(rx.recv().is_err());
    assert!(rx2.recv().is_err());
}
