//! Windowed statistics over store reads. Stateless: every call snapshots the store.

use crate::error::PipelineError;
use crate::query::{metric_values, select_window, window_cutoff};
use crate::storage::SeriesStore;
use crate::types::{Metric, Reading, SensorId, Timestamp, Value};
use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Summary statistics over one metric in a window.
///
/// `stddev` is the population standard deviation: the window is the complete set of retained
/// observations, not a sample of a larger population.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Stats {
    pub mean: Value,
    pub min: Value,
    pub max: Value,
    pub stddev: Value,
    #[serde(rename = "reading_count")]
    pub count: usize,
}

impl Stats {
    /// Computes statistics; an empty slice yields all zeros.
    pub fn from_values(values: &[Value]) -> Stats {
        if values.is_empty() {
            return Stats::default();
        }
        let count = values.len();
        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Stats {
            mean,
            min,
            max,
            stddev: variance.sqrt(),
            count,
        }
    }
}

/// Per-sensor dashboard row produced by [`overview`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorOverview {
    pub sensor_id: SensorId,
    pub sensor_name: String,
    pub avg_temperature: Value,
    pub max_temperature: Value,
    pub min_temperature: Value,
    pub avg_humidity: Value,
    pub reading_count: usize,
    /// Time of the last reading (in insertion order) inside the window.
    pub last_reading: Option<Timestamp>,
}

/// Statistics of `metric` for one sensor over the last `duration`.
///
/// # Errors
/// `InvalidMetric` when `metric` is not allow-listed (checked first), `SensorNotFound` when the
/// sensor was never observed.
pub fn compute_stats(
    store: &SeriesStore,
    sensor_id: &SensorId,
    metric: &str,
    duration: Duration,
) -> Result<Stats, PipelineError> {
    compute_stats_at(store, sensor_id, metric, duration, Utc::now())
}

/// Same as [`compute_stats`] with an explicit `now`.
pub fn compute_stats_at(
    store: &SeriesStore,
    sensor_id: &SensorId,
    metric: &str,
    duration: Duration,
    now: Timestamp,
) -> Result<Stats, PipelineError> {
    let metric: Metric = metric.parse()?;
    let window = store.window_at(sensor_id, duration, now)?;
    Ok(Stats::from_values(&metric_values(&window, metric)))
}

/// Overview rows for every known sensor, ordered by sensor id.
pub fn overview(store: &SeriesStore, duration: Duration) -> Vec<SensorOverview> {
    overview_at(store, duration, Utc::now())
}

/// Same as [`overview`] with an explicit `now`.
pub fn overview_at(store: &SeriesStore, duration: Duration, now: Timestamp) -> Vec<SensorOverview> {
    let cutoff = window_cutoff(now, duration);
    let mut rows: Vec<SensorOverview> = store
        .snapshot_all()
        .into_par_iter()
        .map(|(sensor_id, history)| summarize(sensor_id, &history, cutoff))
        .collect();
    rows.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
    rows
}

fn summarize(sensor_id: SensorId, history: &[Arc<Reading>], cutoff: Timestamp) -> SensorOverview {
    let window = select_window(history, cutoff);
    let temperature = Stats::from_values(&metric_values(&window, Metric::Temperature));
    let humidity = Stats::from_values(&metric_values(&window, Metric::Humidity));
    let sensor_name = history
        .last()
        .map(|r| r.sensor_name().to_string())
        .unwrap_or_else(|| sensor_id.default_name());

    SensorOverview {
        sensor_name,
        avg_temperature: temperature.mean,
        max_temperature: temperature.max,
        min_temperature: temperature.min,
        avg_humidity: humidity.mean,
        reading_count: window.len(),
        last_reading: window.last().map(|r| r.time()),
        sensor_id,
    }
}
