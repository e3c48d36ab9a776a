//! Reading decoder: raw producer payloads (JSON objects) into validated [`Reading`] values.
//!
//! Accepted shape:
//!
//! ```json
//! { "sensor_id": 3, "time": "2024-05-01T12:00:00Z", "temperature": 21.4,
//!   "humidity": 40.2, "msg_id": "5f0c...", "data_source": "mqtt" }
//! ```
//!
//! `sensor_id` is required (positive integer or non-empty string). `time` (alias `timestamp`)
//! is RFC 3339 text or epoch milliseconds and defaults to the receipt time. Allow-listed metrics
//! that are missing or `null` take their default value; other numeric fields are kept as extra
//! metrics. `message_id` (alias `msg_id`) and `source` (alias `data_source`) are optional.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value as Json};

use crate::error::PipelineError;
use crate::types::{Metric, Reading, SensorId, Timestamp};

const RESERVED_KEYS: &[&str] = &[
    "sensor_id",
    "sensor_name",
    "time",
    "timestamp",
    "source",
    "data_source",
    "message_id",
    "msg_id",
];

/// Decodes a payload, using the current time as the receipt time.
pub fn decode_reading(payload: &[u8]) -> Result<Reading, PipelineError> {
    decode_reading_at(payload, Utc::now())
}

/// Decodes a payload with an explicit receipt time (used when `time` is absent).
pub fn decode_reading_at(payload: &[u8], received_at: Timestamp) -> Result<Reading, PipelineError> {
    let value: Json =
        serde_json::from_slice(payload).map_err(|e| PipelineError::Parse(e.to_string()))?;
    decode_value(value, received_at)
}

/// Decodes an already-parsed JSON value.
pub fn decode_value(value: Json, received_at: Timestamp) -> Result<Reading, PipelineError> {
    let Json::Object(obj) = value else {
        return Err(invalid("payload", "expected a JSON object"));
    };

    let sensor_id = sensor_id_field(&obj)?;
    let mut builder = Reading::builder(sensor_id);

    if let Some(time) = time_field(&obj)? {
        builder = builder.time(time);
    }
    if let Some(name) = string_field(&obj, "sensor_name")? {
        builder = builder.sensor_name(name);
    }
    if let Some(source) = first_string_field(&obj, &["source", "data_source"])? {
        builder = builder.source(source);
    }
    if let Some(id) = message_id_field(&obj)? {
        builder = builder.message_id(id);
    }

    for metric in Metric::ALL {
        match obj.get(metric.as_str()) {
            None | Some(Json::Null) => {}
            Some(Json::Number(n)) => {
                let v = n
                    .as_f64()
                    .ok_or_else(|| invalid(metric.as_str(), "not representable as f64"))?;
                builder = builder.metric(metric, v);
            }
            Some(_) => return Err(invalid(metric.as_str(), "expected a number")),
        }
    }

    for (key, value) in &obj {
        if RESERVED_KEYS.contains(&key.as_str()) || key.parse::<Metric>().is_ok() {
            continue;
        }
        if let Some(v) = value.as_f64() {
            builder = builder.extra_metric(key.clone(), v);
        }
    }

    Ok(builder.build_at(received_at))
}

fn invalid(field: &str, reason: &str) -> PipelineError {
    PipelineError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn sensor_id_field(obj: &Map<String, Json>) -> Result<SensorId, PipelineError> {
    match obj.get("sensor_id") {
        None | Some(Json::Null) => Err(invalid("sensor_id", "is required")),
        Some(Json::Number(n)) => match n.as_u64() {
            Some(id) if id > 0 => Ok(SensorId::from(id)),
            _ => Err(invalid("sensor_id", "must be a positive integer")),
        },
        Some(Json::String(s)) => SensorId::new(s.as_str()),
        Some(_) => Err(invalid("sensor_id", "expected an integer or a string")),
    }
}

fn time_field(obj: &Map<String, Json>) -> Result<Option<Timestamp>, PipelineError> {
    let (key, value) = match ["time", "timestamp"]
        .iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()).map(|v| (*k, v)))
    {
        Some(found) => found,
        None => return Ok(None),
    };
    match value {
        Json::Null => Ok(None),
        Json::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| invalid(key, &format!("not an RFC 3339 timestamp: {}", e))),
        Json::Number(n) => {
            let millis = n
                .as_i64()
                .ok_or_else(|| invalid(key, "epoch milliseconds must be an integer"))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .map(Some)
                .ok_or_else(|| invalid(key, "epoch milliseconds out of range"))
        }
        _ => Err(invalid(key, "expected a string or a number")),
    }
}

fn string_field(obj: &Map<String, Json>, key: &str) -> Result<Option<String>, PipelineError> {
    match obj.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Json::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(key, "expected a string")),
    }
}

fn first_string_field(
    obj: &Map<String, Json>,
    keys: &[&str],
) -> Result<Option<String>, PipelineError> {
    for key in keys {
        if let Some(s) = string_field(obj, key)? {
            return Ok(Some(s));
        }
    }
    Ok(None)
}

fn message_id_field(obj: &Map<String, Json>) -> Result<Option<String>, PipelineError> {
    for key in ["message_id", "msg_id"] {
        match obj.get(key) {
            None | Some(Json::Null) => continue,
            Some(Json::String(s)) if !s.is_empty() => return Ok(Some(s.clone())),
            Some(Json::Number(n)) => return Ok(Some(n.to_string())),
            Some(_) => return Err(invalid(key, "expected a non-empty string or a number")),
        }
    }
    Ok(None)
}
