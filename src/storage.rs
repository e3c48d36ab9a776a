use crate::error::PipelineError;
use crate::query::{select_window, window_cutoff};
use crate::types::{Reading, SensorId, Timestamp};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

/// Default number of readings retained per sensor (one minute at 1 Hz).
pub const DEFAULT_HISTORY_CAPACITY: usize = 60;

/// Configuration for [`SeriesStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum readings retained per sensor.
    pub capacity: usize,
    /// Sensors known before any reading arrives.
    pub preregistered: Vec<SensorId>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            capacity: DEFAULT_HISTORY_CAPACITY,
            preregistered: Vec::new(),
        }
    }
}

/// Bounded, insertion-ordered history of one sensor plus its latest reading.
///
/// Eviction is FIFO by insertion, never by `time`, so out-of-order producers are kept as sent.
#[derive(Debug)]
pub struct SensorSeries {
    history: VecDeque<Arc<Reading>>,
    latest: Option<Arc<Reading>>,
    capacity: usize,
}

impl SensorSeries {
    pub fn new(capacity: usize) -> Self {
        SensorSeries {
            history: VecDeque::with_capacity(capacity),
            latest: None,
            capacity,
        }
    }

    /// Appends a reading, returning the evicted one when the series was full.
    pub fn append(&mut self, reading: Arc<Reading>) -> Option<Arc<Reading>> {
        let evicted = if self.history.len() >= self.capacity {
            self.history.pop_front()
        } else {
            None
        };
        self.history.push_back(Arc::clone(&reading));
        self.latest = Some(reading);
        evicted
    }

    pub fn latest(&self) -> Option<&Arc<Reading>> {
        self.latest.as_ref()
    }

    /// Copies the history out (cheap `Arc` clones) so callers can work without the lock.
    pub fn snapshot(&self) -> Vec<Arc<Reading>> {
        self.history.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

type SharedSeries = Arc<Mutex<SensorSeries>>;

/// In-memory rolling window store, one [`SensorSeries`] per sensor.
///
/// The map is behind an `RwLock` (write only when a sensor is first seen) and every series has
/// its own `Mutex`, so appends to different sensors do not contend. Reads copy the series out
/// under its lock and filter afterwards.
///
/// Read paths recover from lock poisoning: a series is structurally valid after any
/// interrupted append, and `latest` must never fail.
#[derive(Debug)]
pub struct SeriesStore {
    series: RwLock<HashMap<SensorId, SharedSeries>>,
    capacity: usize,
}

impl SeriesStore {
    pub fn new(config: StoreConfig) -> Result<Self, PipelineError> {
        if config.capacity == 0 {
            return Err(PipelineError::ConfigError(
                "history capacity must be greater than zero".to_string(),
            ));
        }
        let store = SeriesStore {
            series: RwLock::new(HashMap::new()),
            capacity: config.capacity,
        };
        store.preregister(config.preregistered);
        Ok(store)
    }

    /// Creates empty series for sensors that should be known before their first reading.
    pub fn preregister<I>(&self, ids: I)
    where
        I: IntoIterator<Item = SensorId>,
    {
        let mut map = self.series.write().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            map.entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(SensorSeries::new(self.capacity))));
        }
    }

    /// Appends a reading to its sensor's series, creating the series on first sight.
    pub fn append(&self, reading: Arc<Reading>) -> Result<(), PipelineError> {
        let series = self.series_or_create(reading.sensor_id())?;
        let mut guard = series.lock()?;
        guard.append(reading);
        Ok(())
    }

    /// Latest appended reading for a sensor, or `None` if unknown or still empty.
    pub fn latest(&self, sensor_id: &SensorId) -> Option<Arc<Reading>> {
        let series = self.get(sensor_id)?;
        let guard = lock_series(&series);
        guard.latest().cloned()
    }

    /// Readings of the last `duration` (relative to now), in insertion order.
    pub fn window(
        &self,
        sensor_id: &SensorId,
        duration: Duration,
    ) -> Result<Vec<Arc<Reading>>, PipelineError> {
        self.window_at(sensor_id, duration, Utc::now())
    }

    /// Same as [`SeriesStore::window`] with an explicit `now`.
    pub fn window_at(
        &self,
        sensor_id: &SensorId,
        duration: Duration,
        now: Timestamp,
    ) -> Result<Vec<Arc<Reading>>, PipelineError> {
        let history = self.history(sensor_id)?;
        Ok(select_window(&history, window_cutoff(now, duration)))
    }

    /// Full retained history of a sensor in insertion order.
    pub fn history(&self, sensor_id: &SensorId) -> Result<Vec<Arc<Reading>>, PipelineError> {
        let series = self
            .get(sensor_id)
            .ok_or_else(|| PipelineError::SensorNotFound(sensor_id.clone()))?;
        let guard = lock_series(&series);
        Ok(guard.snapshot())
    }

    /// One latest reading per sensor that has data. Order is unspecified.
    pub fn latest_all(&self) -> Vec<Arc<Reading>> {
        self.all_series()
            .into_iter()
            .filter_map(|(_, series)| {
                let guard = lock_series(&series);
                guard.latest().cloned()
            })
            .collect()
    }

    /// Snapshot of every known sensor's history, including empty pre-registered ones.
    pub fn snapshot_all(&self) -> Vec<(SensorId, Vec<Arc<Reading>>)> {
        self.all_series()
            .into_iter()
            .map(|(id, series)| {
                let history = lock_series(&series).snapshot();
                (id, history)
            })
            .collect()
    }

    /// Ids of every known sensor, sorted.
    pub fn sensor_ids(&self) -> Vec<SensorId> {
        let mut ids: Vec<SensorId> = self
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, sensor_id: &SensorId) -> bool {
        self.get(sensor_id).is_some()
    }

    /// Number of known sensors.
    pub fn len(&self) -> usize {
        self.series.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn get(&self, sensor_id: &SensorId) -> Option<SharedSeries> {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sensor_id)
            .cloned()
    }

    fn series_or_create(&self, sensor_id: &SensorId) -> Result<SharedSeries, PipelineError> {
        if let Some(series) = self.get(sensor_id) {
            return Ok(series);
        }
        let mut map = self.series.write()?;
        let series = map
            .entry(sensor_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SensorSeries::new(self.capacity))));
        Ok(Arc::clone(series))
    }

    /// Clones the series handles out so no map lock is held while series locks are taken.
    fn all_series(&self) -> Vec<(SensorId, SharedSeries)> {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, series)| (id.clone(), Arc::clone(series)))
            .collect()
    }
}

fn lock_series(series: &SharedSeries) -> MutexGuard<'_, SensorSeries> {
    series.lock().unwrap_or_else(PoisonError::into_inner)
}
