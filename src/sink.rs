//! Durable sink contract and the in-memory implementation.
//!
//! Every sink applies the same persistence policy:
//! - a reading with a `message_id` is written at most once (replays are skipped);
//! - a reading without one is upserted on `(sensor_id, time)`, last write wins.

use crate::error::SinkError;
use crate::types::{Reading, SensorId, Timestamp};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Destination for flushed batches.
///
/// `write` is called by the ingestion buffer's sink writer only, one batch at a time. An `Err`
/// means nothing in the batch can be assumed durable; the buffer will resend the whole batch,
/// so implementations must tolerate seeing the same readings again.
pub trait Sink: fmt::Debug + Send + Sync + 'static {
    fn write(&self, batch: &[Reading]) -> Result<(), SinkError>;
}

/// Identity of a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Message(String),
    SensorTime { sensor_id: SensorId, time: Timestamp },
}

impl RecordKey {
    pub fn of(reading: &Reading) -> RecordKey {
        match reading.message_id() {
            Some(id) => RecordKey::Message(id.to_string()),
            None => RecordKey::SensorTime {
                sensor_id: reading.sensor_id().clone(),
                time: reading.time(),
            },
        }
    }
}

/// What applying one reading did to a [`RecordTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Skipped,
}

/// Deduplicated record table, in first-insertion order.
#[derive(Debug, Default)]
pub struct RecordTable {
    rows: Vec<Reading>,
    index: HashMap<RecordKey, usize>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when applying `reading` would change the table.
    pub fn accepts(&self, reading: &Reading) -> bool {
        let key = RecordKey::of(reading);
        !(matches!(key, RecordKey::Message(_)) && self.index.contains_key(&key))
    }

    pub fn apply(&mut self, reading: Reading) -> Applied {
        let key = RecordKey::of(&reading);
        match self.index.get(&key) {
            Some(_) if matches!(key, RecordKey::Message(_)) => Applied::Skipped,
            Some(&pos) => {
                self.rows[pos] = reading;
                Applied::Replaced
            }
            None => {
                self.index.insert(key, self.rows.len());
                self.rows.push(reading);
                Applied::Inserted
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Reading] {
        &self.rows
    }

    pub fn count_for_message(&self, message_id: &str) -> usize {
        usize::from(self.index.contains_key(&RecordKey::Message(message_id.to_string())))
    }
}

/// In-process sink backed by a [`RecordTable`]. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemorySink {
    table: Mutex<RecordTable>,
    batches: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Copy of the stored records.
    pub fn records(&self) -> Vec<Reading> {
        self.table
            .lock()
            .map(|t| t.rows().to_vec())
            .unwrap_or_default()
    }

    pub fn count_for_message(&self, message_id: &str) -> usize {
        self.table
            .lock()
            .map(|t| t.count_for_message(message_id))
            .unwrap_or(0)
    }

    /// Number of successful `write` calls.
    pub fn batches_written(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

impl Sink for MemorySink {
    fn write(&self, batch: &[Reading]) -> Result<(), SinkError> {
        let mut table = self.table.lock()?;
        for reading in batch {
            table.apply(reading.clone());
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metric;
    use chrono::Utc;

    fn reading(sensor: u64, time: Timestamp, value: f64, message_id: Option<&str>) -> Reading {
        let mut builder = Reading::builder(SensorId::from(sensor))
            .time(time)
            .metric(Metric::Temperature, value);
        if let Some(id) = message_id {
            builder = builder.message_id(id);
        }
        builder.build()
    }

    #[test]
    fn test_message_id_is_idempotent() {
        let sink = MemorySink::new();
        let now = Utc::now();
        let first = reading(1, now, 1.0, Some("m-1"));
        let replay = reading(1, now, 99.0, Some("m-1"));

        sink.write(&[first]).unwrap();
        sink.write(&[replay]).unwrap();

        assert_eq!(sink.count_for_message("m-1"), 1);
        assert_eq!(sink.record_count(), 1);
        // First write wins for message-keyed records.
        assert_eq!(sink.records()[0].metric(Metric::Temperature), 1.0);
    }

    #[test]
    fn test_sensor_time_is_last_write_wins() {
        let sink = MemorySink::new();
        let now = Utc::now();
        sink.write(&[reading(1, now, 1.0, None), reading(2, now, 5.0, None)])
            .unwrap();
        sink.write(&[reading(1, now, 2.0, None)]).unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].metric(Metric::Temperature), 2.0);
        assert_eq!(records[1].metric(Metric::Temperature), 5.0);
        assert_eq!(sink.batches_written(), 2);
    }

    #[test]
    fn test_table_accepts() {
        let mut table = RecordTable::new();
        let now = Utc::now();
        let keyed = reading(1, now, 1.0, Some("a"));
        let unkeyed = reading(1, now, 1.0, None);
        assert!(table.accepts(&keyed));
        assert_eq!(table.apply(keyed.clone()), Applied::Inserted);
        assert!(!table.accepts(&keyed));
        assert_eq!(table.apply(unkeyed.clone()), Applied::Inserted);
        assert!(table.accepts(&unkeyed));
        assert_eq!(table.apply(unkeyed), Applied::Replaced);
    }
}
