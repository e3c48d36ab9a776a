use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Timestamp type (UTC wall clock, serialized as RFC 3339).
pub type Timestamp = DateTime<Utc>;

/// Value type for a single metric.
pub type Value = f64;

/// Metric values keyed by metric name.
pub type MetricMap = BTreeMap<String, Value>;

/// Identifier of a sensor.
///
/// Producers send either integers (`3`) or strings (`"sensor_3"`); both end up here as text.
/// Ordering is numeric-aware so `"2"` sorts before `"10"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(String);

impl SensorId {
    /// Builds an id, rejecting empty or whitespace-only input.
    pub fn new(id: impl Into<String>) -> Result<Self, PipelineError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::Validation {
                field: "sensor_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(SensorId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Default display name used when a producer does not send one.
    pub fn default_name(&self) -> String {
        format!("Sensor_{}", self.0)
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for SensorId {
    fn from(id: u64) -> Self {
        SensorId(id.to_string())
    }
}

impl FromStr for SensorId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SensorId::new(s)
    }
}

impl Ord for SensorId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            // "03" and "3" share a number but are distinct ids.
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for SensorId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The fixed allow-list of metrics that statistics can be computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Temperature,
    Pressure,
    Current,
    Voltage,
    Humidity,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Temperature,
        Metric::Pressure,
        Metric::Current,
        Metric::Voltage,
        Metric::Humidity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Pressure => "pressure",
            Metric::Current => "current",
            Metric::Voltage => "voltage",
            Metric::Humidity => "humidity",
        }
    }

    /// Value substituted when a producer omits this metric.
    pub fn default_value(self) -> Value {
        0.0
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| PipelineError::InvalidMetric(s.to_string()))
    }
}

/// One immutable sensor observation.
///
/// Construct through [`Reading::builder`] (or the decoder) so the metric default table is
/// applied exactly once; fields are read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    time: Timestamp,
    sensor_id: SensorId,
    sensor_name: String,
    metrics: MetricMap,
    source: String,
    #[serde(default)]
    message_id: Option<String>,
}

impl Reading {
    pub fn builder(sensor_id: SensorId) -> ReadingBuilder {
        ReadingBuilder {
            sensor_id,
            time: None,
            sensor_name: None,
            metrics: MetricMap::new(),
            source: None,
            message_id: None,
        }
    }

    pub fn time(&self) -> Timestamp {
        self.time
    }

    pub fn sensor_id(&self) -> &SensorId {
        &self.sensor_id
    }

    pub fn sensor_name(&self) -> &str {
        &self.sensor_name
    }

    pub fn metrics(&self) -> &MetricMap {
        &self.metrics
    }

    /// Value of an allow-listed metric. Always present thanks to the default table.
    pub fn metric(&self, metric: Metric) -> Value {
        self.metrics
            .get(metric.as_str())
            .copied()
            .unwrap_or_else(|| metric.default_value())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }
}

/// Builder applying the documented defaults when a [`Reading`] is created.
///
/// | field        | default                 |
/// |--------------|-------------------------|
/// | `time`       | receipt time (`now`)    |
/// | `sensor_name`| `Sensor_<id>`           |
/// | metrics      | `0.0` for each [`Metric`] |
/// | `source`     | `"api"`                 |
/// | `message_id` | none                    |
#[derive(Debug, Clone)]
pub struct ReadingBuilder {
    sensor_id: SensorId,
    time: Option<Timestamp>,
    sensor_name: Option<String>,
    metrics: MetricMap,
    source: Option<String>,
    message_id: Option<String>,
}

pub const DEFAULT_SOURCE: &str = "api";

impl ReadingBuilder {
    pub fn time(mut self, time: Timestamp) -> Self {
        self.time = Some(time);
        self
    }

    pub fn sensor_name(mut self, name: impl Into<String>) -> Self {
        self.sensor_name = Some(name.into());
        self
    }

    pub fn metric(mut self, metric: Metric, value: Value) -> Self {
        self.metrics.insert(metric.as_str().to_string(), value);
        self
    }

    /// Sets a metric outside the allow-list. It is stored but cannot be aggregated.
    pub fn extra_metric(mut self, name: impl Into<String>, value: Value) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn build(self) -> Reading {
        self.build_at(Utc::now())
    }

    /// Builds using `received_at` as the fallback timestamp.
    pub fn build_at(mut self, received_at: Timestamp) -> Reading {
        for metric in Metric::ALL {
            self.metrics
                .entry(metric.as_str().to_string())
                .or_insert_with(|| metric.default_value());
        }
        let sensor_name = self
            .sensor_name
            .unwrap_or_else(|| self.sensor_id.default_name());
        Reading {
            time: self.time.unwrap_or(received_at),
            sensor_id: self.sensor_id,
            sensor_name,
            metrics: self.metrics,
            source: self.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            message_id: self.message_id,
        }
    }
}
