//! Append-only log file sink.
//!
//! File layout: `SNHLOG01` magic, `u32` format version, then records framed as
//! `len: u32 LE | crc32: u32 LE | payload` where the payload is a bincode-encoded [`Reading`].
//! The deduplication index is rebuilt from the log on open, so idempotence holds across restarts.

use crate::error::SinkError;
use crate::sink::{RecordTable, Sink};
use crate::telemetry::pipeline_metrics;
use crate::types::Reading;
use crc32fast::Hasher as Crc32;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

const LOG_MAGIC: &[u8; 8] = b"SNHLOG01";
const LOG_VERSION: u32 = 1;

/// Largest payload a record may carry. Longer length fields are treated as corruption.
const MAX_RECORD_LEN: usize = 1 << 20;

/// File name used inside the sink's directory.
pub const LOG_FILE_NAME: &str = "readings.log";

/// Append target of the log. Implemented by [`File`].
trait LogTarget: Write + Send + fmt::Debug {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

#[derive(Debug)]
struct LogState {
    target: Box<dyn LogTarget>,
    /// Length of the file up to the last durable batch.
    committed_len: u64,
    /// Bytes past `committed_len` may be on disk and must be cut before the next append.
    torn: bool,
    table: RecordTable,
}

impl LogState {
    fn rollback(&mut self) -> io::Result<()> {
        self.target.truncate(self.committed_len)?;
        self.torn = false;
        Ok(())
    }
}

/// Durable [`Sink`] writing every batch to `readings.log` with one `sync_data` per batch.
#[derive(Debug)]
pub struct LogFileSink {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl LogFileSink {
    /// Opens (or creates) the log inside `dir` and replays it into the deduplication index.
    ///
    /// # Errors
    /// `Corruption` when the header is foreign or a record fails its checksum, `Io` otherwise.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, SinkError> {
        let (path, file, table) = open_log(dir.as_ref())?;
        let committed_len = file.metadata()?.len();
        Ok(Self::with_target(path, Box::new(file), committed_len, table))
    }

    fn with_target(
        path: PathBuf,
        target: Box<dyn LogTarget>,
        committed_len: u64,
        table: RecordTable,
    ) -> Self {
        LogFileSink {
            path,
            state: Mutex::new(LogState {
                target,
                committed_len,
                torn: false,
                table,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deduplicated view of everything persisted so far, in first-write order.
    pub fn load_records(&self) -> Result<Vec<Reading>, SinkError> {
        let state = self.state.lock()?;
        Ok(state.table.rows().to_vec())
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().map(|s| s.table.len()).unwrap_or(0)
    }

    pub fn count_for_message(&self, message_id: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.table.count_for_message(message_id))
            .unwrap_or(0)
    }
}

impl Sink for LogFileSink {
    fn write(&self, batch: &[Reading]) -> Result<(), SinkError> {
        let mut state = self.state.lock()?;

        // Frame everything first; the index is only updated once the bytes are durable.
        let mut frames = Vec::new();
        let mut staged = Vec::with_capacity(batch.len());
        let mut seen_messages = HashSet::new();
        for reading in batch {
            if !state.table.accepts(reading) {
                continue;
            }
            if let Some(id) = reading.message_id() {
                if !seen_messages.insert(id) {
                    continue;
                }
            }
            encode_record(reading, &mut frames)?;
            staged.push(reading);
        }
        if staged.is_empty() {
            return Ok(());
        }

        if state.torn {
            state.rollback()?;
        }
        state.torn = true;
        let fsync_start = Instant::now();
        let appended = match state.target.write_all(&frames) {
            Ok(()) => state.target.sync(),
            Err(e) => Err(e),
        };
        if let Err(e) = appended {
            // Cut any partial frame now so a retry appends after the last durable record. If
            // the cut fails it is attempted again before the next append.
            let _ = state.rollback();
            return Err(e.into());
        }
        state.torn = false;
        state.committed_len += frames.len() as u64;
        pipeline_metrics::record_log_fsync(fsync_start.elapsed());
        pipeline_metrics::record_log_bytes_written(frames.len() as u64);

        for reading in staged {
            state.table.apply(reading.clone());
        }
        Ok(())
    }
}

/// Creates or opens the log inside `dir`, writing the header into a new file and replaying an
/// existing one into a fresh index.
fn open_log(dir: &Path) -> Result<(PathBuf, File, RecordTable), SinkError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(&path)?;

    let mut table = RecordTable::new();
    if file.metadata()?.len() == 0 {
        write_header(&mut file)?;
    } else {
        for reading in read_records(&path)? {
            table.apply(reading);
        }
    }
    Ok((path, file, table))
}

fn write_header(file: &mut File) -> Result<(), SinkError> {
    file.write_all(LOG_MAGIC)?;
    file.write_all(&LOG_VERSION.to_le_bytes())?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

fn encode_record(reading: &Reading, out: &mut Vec<u8>) -> Result<(), SinkError> {
    let payload =
        bincode::serialize(reading).map_err(|e| SinkError::Serialization(e.to_string()))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(SinkError::Serialization(format!(
            "record of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_RECORD_LEN
        )));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| SinkError::Serialization("record too large".to_string()))?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

/// Reads every record of a log file, verifying checksums. Duplicates are returned as written.
pub fn read_records(path: &Path) -> Result<Vec<Reading>, SinkError> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    read_or_corrupt(&mut reader, &mut magic, path, 0, "header")?;
    if &magic != LOG_MAGIC {
        return Err(SinkError::Corruption {
            details: format!("{:?} is not a reading log (bad magic)", path),
        });
    }
    let mut ver = [0u8; 4];
    read_or_corrupt(&mut reader, &mut ver, path, 8, "header")?;
    let version = u32::from_le_bytes(ver);
    if version != LOG_VERSION {
        return Err(SinkError::Corruption {
            details: format!("{:?} has unsupported format version {}", path, version),
        });
    }

    let mut records = Vec::new();
    loop {
        let offset = reader.stream_position()?;

        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(SinkError::Io(e)),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_RECORD_LEN {
            return Err(SinkError::Corruption {
                details: format!(
                    "record length {} exceeds limit in {:?} at offset {}",
                    len, path, offset
                ),
            });
        }

        let mut crc_bytes = [0u8; 4];
        read_or_corrupt(&mut reader, &mut crc_bytes, path, offset, "record")?;
        let expected_crc = u32::from_le_bytes(crc_bytes);

        let mut payload = vec![0u8; len];
        read_or_corrupt(&mut reader, &mut payload, path, offset, "record")?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Err(SinkError::Corruption {
                details: format!("record CRC mismatch in {:?} at offset {}", path, offset),
            });
        }

        let reading = bincode::deserialize(&payload).map_err(|e| SinkError::Corruption {
            details: format!(
                "record decode failed in {:?} at offset {}: {}",
                path, offset, e
            ),
        })?;
        records.push(reading);
    }
    Ok(records)
}

fn read_or_corrupt<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    path: &Path,
    offset: u64,
    what: &str,
) -> Result<(), SinkError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(SinkError::Corruption {
            details: format!("truncated {} in {:?} at offset {}", what, path, offset),
        }),
        Err(e) => Err(SinkError::Io(e)),
    }
}
