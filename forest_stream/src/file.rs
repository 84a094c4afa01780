//! File-backed log engine.
//!
//! One directory per log:
//!
//! ```text
//! <dir>/log.jsonl        one JSON object per line, slot order
//! <dir>/meta.json        eviction floor, advanced by retention
//! <dir>/<name>.consumer  persisted floor of each named consumer
//! ```
//!
//! Appends are written through and fsync'd before the slot is handed back.
//! Retention drops records from the serving state immediately and rewrites
//! the segment only once enough evicted lines have accumulated. A partially
//! written trailing line (crash mid-append) is truncated away on open.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use forest_time::TimeProvider;
use forest_types::Slot;
use observability_deps::tracing::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::core::{
    LogConsumer, LogReading, LogRecord, LogRetention, LogWriting, PendingRecord, RecordAcker,
    SequencedRecord, StreamError,
};
use crate::state::{ConsumerShared, LogState};

const SEGMENT_FILE: &str = "log.jsonl";
const META_FILE: &str = "meta.json";
const CONSUMER_SUFFIX: &str = ".consumer";

/// Rewrite the segment once this many evicted lines have accumulated.
const COMPACT_THRESHOLD: usize = 4096;

#[derive(Debug, Serialize, Deserialize)]
struct SegmentLine {
    slot: u64,
    subject: String,
    /// Payload bytes, base64 so arbitrary ingress data survives JSON.
    payload: String,
    ts: String,
}

impl SegmentLine {
    fn from_record(record: &SequencedRecord) -> Self {
        Self {
            slot: record.slot.get(),
            subject: record.subject.clone(),
            payload: base64::encode(&record.payload),
            ts: record.timestamp.to_rfc3339(),
        }
    }

    fn into_record(self) -> Result<SequencedRecord, StreamError> {
        let payload = base64::decode(&self.payload).map_err(StreamError::invalid_data)?;
        let timestamp =
            forest_time::Time::from_rfc3339(&self.ts).map_err(StreamError::invalid_data)?;
        Ok(SequencedRecord {
            slot: Slot::new(self.slot),
            subject: self.subject,
            payload,
            timestamp,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaFile {
    /// Slots at or below this are logically discarded.
    evict_floor: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConsumerFile {
    floor: u64,
}

#[derive(Debug)]
struct FileIo {
    file: tokio::fs::File,
    next_slot: u64,
    evict_floor: u64,
    evicted_since_compaction: usize,
}

/// A directory-backed, retention-limited, sequenced log.
#[derive(Debug)]
pub struct FileLog {
    dir: PathBuf,
    state: Arc<LogState>,
    io: tokio::sync::Mutex<FileIo>,
    /// Serializes floor-file writes per consumer name.
    consumer_io: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLog {
    /// Open (creating if needed) the log stored in `dir`.
    ///
    /// Recovery re-reads the segment, drops records under the persisted
    /// eviction floor and truncates a corrupt or partially written tail.
    pub async fn open(
        dir: impl Into<PathBuf>,
        retention: LogRetention,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, StreamError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let evict_floor = match tokio::fs::read(dir.join(META_FILE)).await {
            Ok(bytes) => {
                let meta: MetaFile =
                    serde_json::from_slice(&bytes).map_err(StreamError::invalid_data)?;
                meta.evict_floor
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let segment_path = dir.join(SEGMENT_FILE);
        let (records, next_slot) = Self::recover_segment(&segment_path, evict_floor).await?;

        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&segment_path)
            .await?;

        Ok(Self {
            dir,
            state: Arc::new(LogState::new(retention, time_provider, records, next_slot)),
            io: tokio::sync::Mutex::new(FileIo {
                file,
                next_slot,
                evict_floor,
                evicted_since_compaction: 0,
            }),
            consumer_io: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    async fn recover_segment(
        path: &Path,
        evict_floor: u64,
    ) -> Result<(VecDeque<SequencedRecord>, u64), StreamError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut records = VecDeque::new();
        let mut next_slot = evict_floor + 1;
        let mut good_end = 0usize;

        for chunk in bytes.split_inclusive(|b| *b == b'\n') {
            if !chunk.ends_with(b"\n") {
                warn!(path = %path.display(), "partially written trailing record, truncating");
                break;
            }
            let line: SegmentLine = match serde_json::from_slice(chunk) {
                Ok(line) => line,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        %e,
                        "corrupt segment record, truncating remainder"
                    );
                    break;
                }
            };
            let record = line.into_record()?;
            let slot = record.slot.get();
            good_end += chunk.len();
            if slot <= evict_floor {
                continue;
            }
            if slot != next_slot && !records.is_empty() {
                return Err(StreamError::invalid_data(format!(
                    "segment slot gap: expected {next_slot}, found {slot}"
                )));
            }
            next_slot = slot + 1;
            records.push_back(record);
        }

        if good_end < bytes.len() {
            let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(good_end as u64).await?;
            file.sync_all().await?;
        }

        if !records.is_empty() {
            info!(
                path = %path.display(),
                records = records.len(),
                next_slot,
                "recovered log segment"
            );
        }

        Ok((records, next_slot))
    }

    fn consumer_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{CONSUMER_SUFFIX}"))
    }

    fn consumer_io(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.consumer_io.lock();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Rewrite the segment from the currently retained records.
    async fn compact(&self, io: &mut FileIo) -> Result<(), StreamError> {
        let tmp_path = self.dir.join(format!("{SEGMENT_FILE}.tmp"));
        let mut buf = Vec::new();
        for record in self.state.snapshot_records() {
            serde_json::to_writer(&mut buf, &SegmentLine::from_record(&record))
                .map_err(|e| StreamError::unknown(e.to_string()))?;
            buf.push(b'\n');
        }
        tokio::fs::write(&tmp_path, &buf).await?;
        tokio::fs::rename(&tmp_path, self.dir.join(SEGMENT_FILE)).await?;

        io.file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(self.dir.join(SEGMENT_FILE))
            .await?;
        io.evicted_since_compaction = 0;
        info!(dir = %self.dir.display(), "compacted log segment");
        Ok(())
    }
}

#[async_trait]
impl LogWriting for FileLog {
    async fn append(&self, record: LogRecord) -> Result<Slot, StreamError> {
        record.validate()?;

        let mut io = self.io.lock().await;
        let slot = Slot::new(io.next_slot);
        let sequenced = SequencedRecord {
            slot,
            subject: record.subject,
            payload: record.payload,
            timestamp: record.timestamp,
        };

        let mut line = serde_json::to_vec(&SegmentLine::from_record(&sequenced))
            .map_err(|e| StreamError::unknown(e.to_string()))?;
        line.push(b'\n');
        io.file.write_all(&line).await?;
        io.file.sync_data().await?;
        io.next_slot += 1;

        let evicted = self.state.publish_sequenced(sequenced);
        if evicted > 0 {
            io.evicted_since_compaction += evicted;
            let new_floor = self.state.earliest_retained().saturating_sub(1);
            if new_floor > io.evict_floor {
                io.evict_floor = new_floor;
                let meta = serde_json::to_vec(&MetaFile {
                    evict_floor: new_floor,
                })
                .map_err(|e| StreamError::unknown(e.to_string()))?;
                tokio::fs::write(self.dir.join(META_FILE), meta).await?;
            }
            if io.evicted_since_compaction >= COMPACT_THRESHOLD {
                self.compact(&mut io).await?;
            }
        }
        drop(io);

        self.state.notify.notify_waiters();
        Ok(slot)
    }

    async fn high_watermark(&self) -> Result<Slot, StreamError> {
        Ok(Slot::new(self.io.lock().await.next_slot))
    }
}

#[async_trait]
impl LogReading for FileLog {
    async fn consumer(&self, name: &str) -> Result<Box<dyn LogConsumer>, StreamError> {
        if name.is_empty() {
            return Err(StreamError::invalid_input("empty consumer name"));
        }
        if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return Err(StreamError::invalid_input(format!(
                "consumer name {name:?} is not filesystem safe"
            )));
        }

        let start = match tokio::fs::read(self.consumer_path(name)).await {
            Ok(bytes) => {
                let consumer: ConsumerFile =
                    serde_json::from_slice(&bytes).map_err(StreamError::invalid_data)?;
                Some(consumer.floor)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let consumer = self.state.get_or_create_consumer(name, start);
        Ok(Box::new(FileConsumer {
            state: Arc::clone(&self.state),
            consumer,
            floor_path: self.consumer_path(name),
            floor_io: self.consumer_io(name),
        }))
    }
}

#[derive(Debug)]
struct FileConsumer {
    state: Arc<LogState>,
    consumer: Arc<ConsumerShared>,
    floor_path: PathBuf,
    floor_io: Arc<tokio::sync::Mutex<()>>,
}

#[async_trait]
impl LogConsumer for FileConsumer {
    async fn next(&mut self) -> Result<PendingRecord, StreamError> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so an append between the
            // check and the await cannot be missed.
            notified.as_mut().enable();

            if let Some((record, delivery_count)) = self.state.try_next(&self.consumer) {
                let acker = Arc::new(FileAcker {
                    state: Arc::clone(&self.state),
                    consumer: Arc::clone(&self.consumer),
                    floor_path: self.floor_path.clone(),
                    floor_io: Arc::clone(&self.floor_io),
                });
                return Ok(PendingRecord::new(record, delivery_count, acker));
            }

            notified.await;
        }
    }
}

#[derive(Debug)]
struct FileAcker {
    state: Arc<LogState>,
    consumer: Arc<ConsumerShared>,
    floor_path: PathBuf,
    floor_io: Arc<tokio::sync::Mutex<()>>,
}

#[async_trait]
impl RecordAcker for FileAcker {
    async fn ack(&self, slot: Slot) -> Result<(), StreamError> {
        self.state.ack(&self.consumer, slot);

        // Recompute inside the critical section so concurrent acks cannot
        // persist a regressing floor.
        let _guard = self.floor_io.lock().await;
        let floor = self.state.floor(&self.consumer);
        let bytes = serde_json::to_vec(&ConsumerFile { floor })
            .map_err(|e| StreamError::unknown(e.to_string()))?;
        tokio::fs::write(&self.floor_path, bytes).await?;
        Ok(())
    }

    fn nak(&self, slot: Slot) {
        self.state.nak(&self.consumer, slot);
    }
}
