use crate::types::{Metric, Reading, Timestamp, Value};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Earliest timestamp still inside a window of `duration` ending at `now`.
///
/// Durations too large to represent saturate to the minimum timestamp (everything matches).
pub fn window_cutoff(now: Timestamp, duration: Duration) -> Timestamp {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Selects readings with `time >= cutoff`, preserving insertion order.
///
/// History is bounded, so this is a plain linear scan. Producers may deliver out of order,
/// so no sortedness is assumed (no binary search).
pub fn select_window(history: &[Arc<Reading>], cutoff: Timestamp) -> Vec<Arc<Reading>> {
    history
        .iter()
        .filter(|r| r.time() >= cutoff)
        .cloned()
        .collect()
}

/// Extracts one metric from each reading, in order.
#[inline]
pub fn metric_values(readings: &[Arc<Reading>], metric: Metric) -> Vec<Value> {
    readings.iter().map(|r| r.metric(metric)).collect()
}
