//! Append-only log-file backend.
//!
//! Every aggregate owns two files under the store's root directory:
//! `<stem>.events` holds one JSON line per event and `<stem>.snapshots` one
//! JSON line per snapshot. A per-aggregate offset index is built on first
//! access by scanning the event log once and then extended on every append.
//! Readers never read past the committed length recorded in the index, so a
//! batch that is still being written is invisible to them.
//!
//! Index loads and read-side opens go through [`with_retry`]. Appends are not
//! retried here: a failed append is rolled back and reported to the caller.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use futures_util::stream;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::retry::with_retry;
use crate::store::{EventStore, EventStream, validate_batch, validate_snapshot};
use crate::{AggregateId, EventEnvelope, EventStoreError, Result, Sequence, Snapshot};

/// Index over one aggregate's files.
#[derive(Debug, Default)]
struct StreamLog {
    loaded: bool,
    /// Byte offset of each committed event line; the position is the sequence.
    offsets: Vec<u64>,
    /// End of the last complete event line.
    committed_len: u64,
    /// Byte range of the most recent snapshot line.
    latest_snapshot: Option<(u64, u64)>,
    snapshots_len: u64,
}

impl StreamLog {
    fn last_sequence(&self) -> Option<Sequence> {
        (self.offsets.len() as u64).checked_sub(1).map(Sequence::new)
    }
}

/// Event store persisting one append-only file per aggregate.
pub struct LogFileEventStore {
    root: PathBuf,
    streams: std::sync::Mutex<HashMap<AggregateId, Arc<Mutex<StreamLog>>>>,
}

impl LogFileEventStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        tracing::info!(root = %root.display(), "log-file event store opened");
        Ok(Self {
            root,
            streams: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the aggregate logs.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the event log for an aggregate.
    pub fn events_path(&self, aggregate_id: &AggregateId) -> PathBuf {
        self.root.join(format!("{}.events", file_stem(aggregate_id)))
    }

    fn snapshots_path(&self, aggregate_id: &AggregateId) -> PathBuf {
        self.root.join(format!("{}.snapshots", file_stem(aggregate_id)))
    }

    fn stream(&self, aggregate_id: &AggregateId) -> Arc<Mutex<StreamLog>> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.entry(aggregate_id.clone()).or_default().clone()
    }

    /// Builds the index from disk the first time an aggregate is touched.
    ///
    /// `log` is only replaced once the whole index has been read, so a failed
    /// load leaves it untouched and the next call starts over.
    async fn ensure_loaded(&self, aggregate_id: &AggregateId, log: &mut StreamLog) -> Result<()> {
        if log.loaded {
            return Ok(());
        }

        let built = with_retry("load_index", || self.load_index(aggregate_id)).await?;
        tracing::debug!(
            aggregate_id = %aggregate_id,
            events = built.offsets.len(),
            "stream index loaded"
        );
        *log = built;
        Ok(())
    }

    async fn load_index(&self, aggregate_id: &AggregateId) -> Result<StreamLog> {
        let mut log = StreamLog::default();

        let events_path = self.events_path(aggregate_id);
        let bytes = read_if_exists(&events_path).await?;
        let mut offset = 0u64;
        for line in complete_lines(&bytes) {
            let event: EventEnvelope =
                serde_json::from_slice(line).map_err(|e| corrupted(&events_path, offset, e))?;
            let expected = Sequence::new(log.offsets.len() as u64);
            if event.sequence != expected || &event.aggregate_id != aggregate_id {
                return Err(corrupted(
                    &events_path,
                    offset,
                    format_args!("expected sequence {expected}, found {}", event.sequence),
                ));
            }
            log.offsets.push(offset);
            offset += line.len() as u64 + 1;
        }
        log.committed_len = offset;
        if offset < bytes.len() as u64 {
            truncate_torn_tail(&events_path, offset).await?;
        }

        let snapshots_path = self.snapshots_path(aggregate_id);
        let bytes = read_if_exists(&snapshots_path).await?;
        let mut offset = 0u64;
        for line in complete_lines(&bytes) {
            log.latest_snapshot = Some((offset, line.len() as u64));
            offset += line.len() as u64 + 1;
        }
        log.snapshots_len = offset;
        if offset < bytes.len() as u64 {
            truncate_torn_tail(&snapshots_path, offset).await?;
        }

        log.loaded = true;
        Ok(log)
    }
}

#[async_trait]
impl EventStore for LogFileEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        expected_last: Option<Sequence>,
        events: Vec<EventEnvelope>,
    ) -> Result<Sequence> {
        validate_batch(aggregate_id, expected_last, &events)?;

        let entry = self.stream(aggregate_id);
        let mut log = entry.lock().await;
        self.ensure_loaded(aggregate_id, &mut log).await?;

        let actual = log.last_sequence();
        if actual != expected_last {
            metrics::counter!("event_store_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.clone(),
                expected: expected_last,
                actual,
            });
        }

        let mut buf = Vec::new();
        let mut new_offsets = Vec::with_capacity(events.len());
        for event in &events {
            new_offsets.push(log.committed_len + buf.len() as u64);
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let path = self.events_path(aggregate_id);
        let created = log.committed_len == 0;
        if let Err(err) = append_durably(&path, &buf).await {
            // Nothing past `committed_len` was ever visible; drop the partial write.
            if let Err(rollback) = truncate_torn_tail(&path, log.committed_len).await {
                tracing::error!(error = %rollback, path = %path.display(), "failed to roll back partial append");
            }
            return Err(err);
        }
        log.offsets.extend(new_offsets);
        log.committed_len += buf.len() as u64;

        if created && let Err(err) = sync_dir(&self.root).await {
            tracing::warn!(error = %err, root = %self.root.display(), "failed to sync store directory");
        }

        metrics::counter!("events_appended_total").increment(events.len() as u64);
        let last = Sequence::after(expected_last).as_u64() + events.len() as u64 - 1;
        Ok(Sequence::new(last))
    }

    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from: Sequence,
    ) -> Result<EventStream> {
        let (start, end) = {
            let entry = self.stream(aggregate_id);
            let mut log = entry.lock().await;
            self.ensure_loaded(aggregate_id, &mut log).await?;
            match log.offsets.get(from.as_u64() as usize) {
                Some(&start) => (start, log.committed_len),
                None => return Ok(Box::pin(stream::empty())),
            }
        };

        let path = self.events_path(aggregate_id);
        let file = with_retry("read_stream", || open_at(&path, start)).await?;
        let lines = BufReader::new(file.take(end - start)).lines();

        let events = stream::try_unfold(
            (lines, from, start, path),
            |(mut lines, expected, offset, path)| async move {
                let Some(line) = lines.next_line().await? else {
                    return Ok(None);
                };
                let event: EventEnvelope =
                    serde_json::from_str(&line).map_err(|e| corrupted(&path, offset, e))?;
                if event.sequence != expected {
                    return Err(corrupted(
                        &path,
                        offset,
                        format_args!("expected sequence {expected}, found {}", event.sequence),
                    ));
                }
                let next_offset = offset + line.len() as u64 + 1;
                Ok::<_, EventStoreError>(Some((event, (lines, expected.next(), next_offset, path))))
            },
        );

        Ok(Box::pin(events))
    }

    async fn last_sequence(&self, aggregate_id: &AggregateId) -> Result<Option<Sequence>> {
        let entry = self.stream(aggregate_id);
        let mut log = entry.lock().await;
        self.ensure_loaded(aggregate_id, &mut log).await?;
        Ok(log.last_sequence())
    }

    #[tracing::instrument(skip(self, snapshot), fields(aggregate_id = %snapshot.aggregate_id, sequence = %snapshot.sequence))]
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let entry = self.stream(&snapshot.aggregate_id);
        let mut log = entry.lock().await;
        self.ensure_loaded(&snapshot.aggregate_id, &mut log).await?;
        validate_snapshot(&snapshot, log.last_sequence())?;

        let mut buf = serde_json::to_vec(&snapshot)?;
        let line_len = buf.len() as u64;
        buf.push(b'\n');

        let path = self.snapshots_path(&snapshot.aggregate_id);
        if let Err(err) = append_durably(&path, &buf).await {
            if let Err(rollback) = truncate_torn_tail(&path, log.snapshots_len).await {
                tracing::error!(error = %rollback, path = %path.display(), "failed to roll back partial snapshot");
            }
            return Err(err);
        }

        log.latest_snapshot = Some((log.snapshots_len, line_len));
        log.snapshots_len += buf.len() as u64;
        Ok(())
    }

    async fn latest_snapshot(&self, aggregate_id: &AggregateId) -> Result<Option<Snapshot>> {
        let range = {
            let entry = self.stream(aggregate_id);
            let mut log = entry.lock().await;
            self.ensure_loaded(aggregate_id, &mut log).await?;
            log.latest_snapshot
        };
        let Some((offset, len)) = range else {
            return Ok(None);
        };

        let path = self.snapshots_path(aggregate_id);
        let line = with_retry("latest_snapshot", || async {
            let mut file = open_at(&path, offset).await?;
            let mut line = vec![0u8; len as usize];
            file.read_exact(&mut line).await?;
            Ok(line)
        })
        .await?;

        let snapshot = serde_json::from_slice(&line).map_err(|e| corrupted(&path, offset, e))?;
        Ok(Some(snapshot))
    }
}

/// Maps an aggregate id onto a safe file name: `[A-Za-z0-9_-]` pass through,
/// every other byte is written as `%XX`.
fn file_stem(aggregate_id: &AggregateId) -> String {
    let mut stem = String::with_capacity(aggregate_id.as_str().len());
    for byte in aggregate_id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            let _ = write!(stem, "%{byte:02X}");
        }
    }
    stem
}

/// Newline-terminated lines of `bytes`, without the terminator. A trailing
/// fragment without a newline is a torn write and is not returned.
fn complete_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut rest = bytes;
    while let Some(end) = rest.iter().position(|b| *b == b'\n') {
        lines.push(&rest[..end]);
        rest = &rest[end + 1..];
    }
    lines
}

fn corrupted(path: &Path, offset: u64, reason: impl std::fmt::Display) -> EventStoreError {
    EventStoreError::Corrupted {
        location: format!("{} (byte {offset})", path.display()),
        reason: reason.to_string(),
    }
}

async fn read_if_exists(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

async fn open_at(path: &Path, offset: u64) -> Result<File> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

async fn append_durably(path: &Path, buf: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(buf).await?;
    file.sync_data().await?;
    Ok(())
}

async fn truncate_torn_tail(path: &Path, len: u64) -> Result<()> {
    let file = match OpenOptions::new().write(true).open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if file.metadata().await?.len() > len {
        tracing::warn!(path = %path.display(), len, "truncating incomplete trailing record");
        file.set_len(len).await?;
        file.sync_all().await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
