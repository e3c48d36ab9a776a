//! Periodic push of the store's latest readings to connected observers.

use crate::error::PipelineError;
use crate::storage::SeriesStore;
use crate::telemetry::{noop_event_listener, pipeline_metrics, PipelineEvent, PipelineEventListener};
use crate::types::Reading;
use serde::Serialize;
use std::fmt;
use std::sync::{mpsc, Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Event name carried by every broadcast.
pub const SENSOR_UPDATE_EVENT: &str = "sensor_update";

/// One broadcast: the latest reading of every sensor that has data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorUpdate {
    pub event: &'static str,
    pub readings: Vec<Arc<Reading>>,
}

impl SensorUpdate {
    pub fn new(readings: Vec<Arc<Reading>>) -> Self {
        SensorUpdate {
            event: SENSOR_UPDATE_EVENT,
            readings,
        }
    }

    /// JSON array of readings, as sent on the wire.
    pub fn readings_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.readings)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The observer is alive but cannot take more messages right now; this update is lost.
    #[error("observer queue is full")]
    Full,
    /// The observer is gone and should be unsubscribed.
    #[error("observer disconnected")]
    Disconnected,
    #[error("push failed: {0}")]
    Failed(String),
}

/// Receiver of broadcasts. `push` must not block.
pub trait Observer: fmt::Debug + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn push(&self, update: &Arc<SensorUpdate>) -> Result<(), PushError>;
}

/// Observer backed by a bounded std channel.
#[derive(Debug)]
pub struct ChannelObserver {
    id: String,
    tx: mpsc::SyncSender<Arc<SensorUpdate>>,
}

impl ChannelObserver {
    pub fn bounded(
        id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<SensorUpdate>>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (ChannelObserver { id: id.into(), tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn id(&self) -> &str {
        &self.id
    }

    fn push(&self, update: &Arc<SensorUpdate>) -> Result<(), PushError> {
        self.tx.try_send(Arc::clone(update)).map_err(|e| match e {
            mpsc::TrySendError::Full(_) => PushError::Full,
            mpsc::TrySendError::Disconnected(_) => PushError::Disconnected,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub period: Duration,
    pub event_listener: Arc<dyn PipelineEventListener>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            period: Duration::from_secs(1),
            event_listener: noop_event_listener(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub readings: usize,
    pub delivered: usize,
    pub failed: usize,
    pub removed: usize,
}

#[derive(Debug)]
struct Hub {
    store: Arc<SeriesStore>,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    events: Arc<dyn PipelineEventListener>,
}

impl Hub {
    fn tick(&self) -> TickReport {
        let mut readings = self.store.latest_all();
        if readings.is_empty() {
            return TickReport::default();
        }
        readings.sort_by(|a, b| a.sensor_id().cmp(b.sensor_id()));
        let update = Arc::new(SensorUpdate::new(readings));

        let observers: Vec<Arc<dyn Observer>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut report = TickReport {
            readings: update.readings.len(),
            ..TickReport::default()
        };
        let mut gone = Vec::new();
        for observer in &observers {
            match observer.push(&update) {
                Ok(()) => report.delivered += 1,
                Err(PushError::Disconnected) => gone.push(observer.id().to_string()),
                Err(e) => {
                    report.failed += 1;
                    self.events.on_event(PipelineEvent::ObserverFailed {
                        observer: observer.id().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !gone.is_empty() {
            let mut list = self.observers.write().unwrap_or_else(PoisonError::into_inner);
            list.retain(|o| !gone.iter().any(|id| id == o.id()));
            for id in gone {
                report.removed += 1;
                self.events.on_event(PipelineEvent::ObserverRemoved { observer: id });
            }
        }

        pipeline_metrics::record_broadcast(observers.len() - report.removed);
        self.events.on_event(PipelineEvent::BroadcastSent {
            readings: report.readings,
            observers: report.delivered,
        });
        report
    }
}

/// Fires every `period`, pushing a [`SensorUpdate`] to every observer.
///
/// A failing observer never affects the others or the ticker. Observers reporting
/// [`PushError::Disconnected`] are unsubscribed.
#[derive(Debug)]
pub struct Broadcaster {
    hub: Arc<Hub>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn start(config: BroadcastConfig, store: Arc<SeriesStore>) -> Result<Self, PipelineError> {
        if config.period.is_zero() {
            return Err(PipelineError::ConfigError(
                "broadcast period must be non-zero".to_string(),
            ));
        }
        let hub = Arc::new(Hub {
            store,
            observers: RwLock::new(Vec::new()),
            events: config.event_listener,
        });

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let ticker_hub = Arc::clone(&hub);
        let period = config.period;
        let handle = thread::Builder::new()
            .name("sensorhub-broadcast".to_string())
            .spawn(move || {
                ticker_hub.events.on_event(PipelineEvent::BroadcasterStarted);
                let mut next = Instant::now() + period;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            ticker_hub.tick();
                            next += period;
                            // Skip missed ticks instead of bursting.
                            let now = Instant::now();
                            if next < now {
                                next = now + period;
                            }
                        }
                        _ => break,
                    }
                }
                ticker_hub.events.on_event(PipelineEvent::BroadcasterStopping);
            })
            .map_err(|e| PipelineError::BackgroundTaskError(format!("failed to spawn broadcaster: {}", e)))?;

        Ok(Broadcaster {
            hub,
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.hub
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Removes every observer with this id. Returns whether one was found.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut list = self.hub.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = list.len();
        list.retain(|o| o.id() != id);
        list.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.hub
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Runs one tick immediately on the calling thread.
    pub fn tick_now(&self) -> TickReport {
        self.hub.tick()
    }

    /// Stops the ticker and releases every observer, which closes their channels.
    pub fn stop(&self) -> Result<(), PipelineError> {
        // Dropping the sender wakes the ticker with `Disconnected`.
        self.stop_tx.lock()?.take();
        let joined = match self.handle.lock()?.take() {
            Some(handle) => handle.join().map_err(|_| {
                PipelineError::BackgroundTaskError("broadcaster thread panicked".to_string())
            }),
            None => Ok(()),
        };
        self.hub
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        joined
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use crate::types::{Metric, SensorId};

    #[derive(Debug)]
    struct BrokenObserver;

    impl Observer for BrokenObserver {
        fn id(&self) -> &str {
            "broken"
        }
        fn push(&self, _update: &Arc<SensorUpdate>) -> Result<(), PushError> {
            Err(PushError::Failed("socket error".to_string()))
        }
    }

    fn store_with(sensors: &[u64]) -> Arc<SeriesStore> {
        let store = Arc::new(SeriesStore::new(StoreConfig::default()).unwrap());
        for &s in sensors {
            let reading = Reading::builder(SensorId::from(s))
                .metric(Metric::Current, s as f64)
                .build();
            store.append(Arc::new(reading)).unwrap();
        }
        store
    }

    fn idle_config() -> BroadcastConfig {
        BroadcastConfig {
            period: Duration::from_secs(3600),
            ..BroadcastConfig::default()
        }
    }

    #[test]
    fn test_empty_snapshot_not_emitted() {
        let broadcaster = Broadcaster::start(idle_config(), store_with(&[])).unwrap();
        let (observer, rx) = ChannelObserver::bounded("a", 4);
        broadcaster.subscribe(Arc::new(observer));
        assert_eq!(broadcaster.tick_now(), TickReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failing_observer_isolated() {
        let broadcaster = Broadcaster::start(idle_config(), store_with(&[10, 2])).unwrap();
        let (good, rx) = ChannelObserver::bounded("good", 4);
        broadcaster.subscribe(Arc::new(BrokenObserver));
        broadcaster.subscribe(Arc::new(good));

        let report = broadcaster.tick_now();
        assert_eq!(report.readings, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(broadcaster.observer_count(), 2);

        let update = rx.try_recv().unwrap();
        assert_eq!(update.event, SENSOR_UPDATE_EVENT);
        let ids: Vec<&str> = update.readings.iter().map(|r| r.sensor_id().as_str()).collect();
        assert_eq!(ids, vec!["2", "10"]);
    }

    #[test]
    fn test_disconnected_observer_removed() {
        let broadcaster = Broadcaster::start(idle_config(), store_with(&[1])).unwrap();
        let (observer, rx) = ChannelObserver::bounded("gone", 1);
        broadcaster.subscribe(Arc::new(observer));
        drop(rx);

        let report = broadcaster.tick_now();
        assert_eq!(report.removed, 1);
        assert_eq!(broadcaster.observer_count(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let broadcaster = Broadcaster::start(idle_config(), store_with(&[1])).unwrap();
        let (observer, _rx) = ChannelObserver::bounded("x", 1);
        broadcaster.subscribe(Arc::new(observer));
        assert!(broadcaster.unsubscribe("x"));
        assert!(!broadcaster.unsubscribe("x"));
    }

    #[test]
    fn test_ticker_pushes_periodically() {
        let config = BroadcastConfig {
            period: Duration::from_millis(20),
            ..BroadcastConfig::default()
        };
        let broadcaster = Broadcaster::start(config, store_with(&[1])).unwrap();
        let (observer, rx) = ChannelObserver::bounded("t", 16);
        broadcaster.subscribe(Arc::new(observer));

        for _ in 0..2 {
            let update = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(update.readings.len(), 1);
        }
        broadcaster.stop().unwrap();
    }
}
