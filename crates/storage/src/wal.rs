//! Append-only write-ahead log.
//!
//! Every mutation is framed and appended before it becomes visible in the
//! in-memory map. Frames are `len: u32 | xxh3: u64 | payload`, big-endian,
//! and the payload is
//!
//! ```text
//! seq u64 | op u8 | key_len u32 | key | value_len u32 | value
//!   | ttl_ms u64 | timestamp_ms u64 | clock_len u32 | (node u64, counter u64)*
//! ```
//!
//! A frame cut short at the end of the file is a torn write from a crash and
//! is truncated when the log is opened. A bad frame anywhere else is
//! corruption and is reported, never skipped.
//!
//! A failed write or sync flips the log to unhealthy: further appends are
//! rejected until [`WriteAheadLog::restore`] re-validates the file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use corelib::{NodeId, VectorClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::entry::KvEntry;
use crate::error::WalError;

/// File name of the log within a node's data directory.
pub const WAL_LOG_FILE: &str = "wal.log";

const FRAME_HEADER: usize = 4 + 8;

/// How hard each append pushes bytes to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Leave flushing to the OS.
    None,
    /// `fdatasync` after every append.
    #[default]
    Data,
    /// `fsync` after every append.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Put = 1,
    Delete = 2,
}

impl OpKind {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(OpKind::Put),
            2 => Some(OpKind::Delete),
            _ => None,
        }
    }
}

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub seq: u64,
    pub entry: KvEntry,
}

impl LogEntry {
    pub fn op(&self) -> OpKind {
        if self.entry.is_tombstone() {
            OpKind::Delete
        } else {
            OpKind::Put
        }
    }
}

struct WalInner {
    file: File,
    next_seq: u64,
    /// File length covering only acknowledged frames.
    committed_len: u64,
}

pub struct WriteAheadLog {
    path: PathBuf,
    sync_mode: SyncMode,
    inner: Mutex<WalInner>,
    healthy: AtomicBool,
    fail_next_sync: AtomicBool,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_mode", &self.sync_mode)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl WriteAheadLog {
    /// Open (or create) the log under `dir`, truncating a torn tail.
    pub fn open(dir: impl AsRef<Path>, sync_mode: SyncMode) -> Result<Self, WalError> {
        fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(WAL_LOG_FILE);
        let (file, next_seq, committed_len) = open_validated(&path)?;

        Ok(Self {
            path,
            sync_mode,
            inner: Mutex::new(WalInner {
                file,
                next_seq,
                committed_len,
            }),
            healthy: AtomicBool::new(true),
            fail_next_sync: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Sequence number the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Highest sequence number handed out so far, 0 when none.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    /// Never hand out sequence numbers at or below `seq`. Used after loading
    /// a snapshot whose log prefix has already been checkpointed away.
    pub fn advance_to(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if inner.next_seq <= seq {
            inner.next_seq = seq + 1;
        }
    }

    /// Append `entry` and return its sequence number once it is durable
    /// under the configured sync mode.
    pub fn append(&self, entry: &KvEntry) -> Result<u64, WalError> {
        if !self.is_healthy() {
            return Err(WalError::Unhealthy);
        }

        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        let payload = encode_payload(seq, entry);

        let result = write_frame(&mut inner.file, &payload).and_then(|()| self.sync(&inner.file));
        if let Err(err) = result {
            self.healthy.store(false, Ordering::Release);
            metrics::counter!("kv_wal_failures_total").increment(1);
            tracing::error!(path = %self.path.display(), seq, error = %err, "wal append failed; rejecting writes until restored");
            return Err(WalError::Io(err));
        }

        inner.next_seq = seq + 1;
        inner.committed_len += (FRAME_HEADER + payload.len()) as u64;
        metrics::counter!("kv_wal_appends_total").increment(1);
        Ok(seq)
    }

    /// Feed every record, oldest first, to `apply`.
    pub fn replay<F>(&self, mut apply: F) -> Result<usize, WalError>
    where
        F: FnMut(LogEntry),
    {
        let _inner = self.inner.lock();
        let scan = scan(&read_all(&self.path)?)?;
        let count = scan.records.len();
        for record in scan.records {
            apply(record);
        }
        Ok(count)
    }

    /// All records currently in the log.
    pub fn entries(&self) -> Result<Vec<LogEntry>, WalError> {
        let mut out = Vec::new();
        self.replay(|record| out.push(record))?;
        Ok(out)
    }

    /// Drop every record with `seq <= snapshot_seq`. Returns how many were
    /// removed. Refused while the log is unhealthy; only acknowledged
    /// frames are carried over.
    pub fn checkpoint(&self, snapshot_seq: u64) -> Result<usize, WalError> {
        if !self.is_healthy() {
            return Err(WalError::Unhealthy);
        }
        let mut inner = self.inner.lock();
        let last = inner.next_seq - 1;
        if snapshot_seq > last {
            return Err(WalError::CheckpointAhead {
                requested: snapshot_seq,
                last,
            });
        }

        let mut data = read_all(&self.path)?;
        data.truncate(inner.committed_len as usize);
        let scan = scan(&data)?;
        let tmp_path = self.path.with_extension("log.tmp");
        let mut out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;

        let mut removed = 0usize;
        let mut kept_len = 0u64;
        for record in &scan.records {
            if record.seq <= snapshot_seq {
                removed += 1;
                continue;
            }
            let payload = encode_payload(record.seq, &record.entry);
            write_frame(&mut out, &payload)?;
            kept_len += (FRAME_HEADER + payload.len()) as u64;
        }
        out.flush()?;
        out.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;

        inner.file = open_log_for_append(&self.path)?;
        inner.committed_len = kept_len;
        tracing::debug!(path = %self.path.display(), snapshot_seq, removed, "wal checkpointed");
        Ok(removed)
    }

    /// Drop any frame whose append was not acknowledged, re-validate the
    /// file and accept writes again.
    pub fn restore(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        let on_disk = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if on_disk > inner.committed_len {
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(inner.committed_len)?;
            file.sync_all()?;
        }
        let (file, next_seq, committed_len) = open_validated(&self.path)?;
        inner.file = file;
        inner.next_seq = next_seq.max(inner.next_seq);
        inner.committed_len = committed_len;
        self.healthy.store(true, Ordering::Release);
        self.fail_next_sync.store(false, Ordering::Release);
        tracing::info!(path = %self.path.display(), next_seq = inner.next_seq, "wal restored");
        Ok(())
    }

    /// Make the next sync fail as if the disk had gone away.
    #[doc(hidden)]
    pub fn inject_sync_failure(&self) {
        self.fail_next_sync.store(true, Ordering::Release);
    }

    fn sync(&self, file: &File) -> io::Result<()> {
        if self.fail_next_sync.swap(false, Ordering::AcqRel) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure"));
        }
        let start = Instant::now();
        let res = match self.sync_mode {
            SyncMode::None => return Ok(()),
            SyncMode::Data => file.sync_data(),
            SyncMode::All => file.sync_all(),
        };
        metrics::histogram!("kv_wal_fsync_seconds").record(start.elapsed().as_secs_f64());
        res
    }
}

/// Open the log for appending after truncating any torn tail. Returns the
/// file, the next sequence number and the valid length.
fn open_validated(path: &Path) -> Result<(File, u64, u64), WalError> {
    let data = read_all(path)?;
    let scan = scan(&data)?;
    if scan.valid_len < data.len() {
        tracing::warn!(
            path = %path.display(),
            kept = scan.valid_len,
            dropped = data.len() - scan.valid_len,
            "truncating torn wal tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(scan.valid_len as u64)?;
        file.sync_all()?;
    }
    let next_seq = scan.records.last().map(|r| r.seq + 1).unwrap_or(1);
    Ok((open_log_for_append(path)?, next_seq, scan.valid_len as u64))
}

/// Make a rename into `path` durable.
pub(crate) fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

fn open_log_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn read_all(path: &Path) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut data)?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    Ok(data)
}

fn write_frame(out: &mut File, payload: &[u8]) -> io::Result<()> {
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&xxh3_64(payload).to_be_bytes());
    frame.extend_from_slice(payload);
    out.write_all(&frame)?;
    out.flush()
}

struct Scan {
    records: Vec<LogEntry>,
    /// Bytes up to the end of the last intact frame.
    valid_len: usize,
}

fn scan(data: &[u8]) -> Result<Scan, WalError> {
    let mut records: Vec<LogEntry> = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        if data.len() - offset < FRAME_HEADER {
            break;
        }
        let len = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap_or_default()) as usize;
        let checksum = u64::from_be_bytes(data[offset + 4..offset + 12].try_into().unwrap_or_default());
        let start = offset + FRAME_HEADER;
        let end = start + len;
        if end > data.len() {
            break;
        }

        let payload = &data[start..end];
        if xxh3_64(payload) != checksum {
            if end == data.len() {
                // Last frame, written partially before a crash.
                break;
            }
            return Err(corrupt(offset, "checksum mismatch"));
        }

        let record = decode_payload(payload).map_err(|reason| corrupt(offset, reason))?;
        if let Some(prev) = records.last() {
            if record.seq <= prev.seq {
                return Err(corrupt(offset, "sequence numbers out of order"));
            }
        }
        records.push(record);
        offset = end;
    }

    Ok(Scan {
        records,
        valid_len: offset,
    })
}

fn corrupt(offset: usize, reason: &str) -> WalError {
    WalError::Corrupt {
        offset: offset as u64,
        reason: reason.to_string(),
    }
}

fn encode_payload(seq: u64, entry: &KvEntry) -> Vec<u8> {
    let key = entry.key().as_bytes();
    let value = entry.value().map(|v| v.as_ref()).unwrap_or_default();
    let op = if entry.is_tombstone() {
        OpKind::Delete
    } else {
        OpKind::Put
    };

    let mut out = Vec::with_capacity(8 + 1 + 4 + key.len() + 4 + value.len() + 8 + 8 + 4 + entry.clock().len() * 16);
    out.extend_from_slice(&seq.to_be_bytes());
    out.push(op as u8);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    out.extend_from_slice(&entry.ttl_ms().to_be_bytes());
    out.extend_from_slice(&entry.timestamp_ms().to_be_bytes());
    out.extend_from_slice(&(entry.clock().len() as u32).to_be_bytes());
    for (node, counter) in entry.clock().iter() {
        out.extend_from_slice(&node.0.to_be_bytes());
        out.extend_from_slice(&counter.to_be_bytes());
    }
    out
}

fn decode_payload(buf: &[u8]) -> Result<LogEntry, &'static str> {
    let mut offset = 0usize;
    let seq = read_u64_at(buf, &mut offset)?;
    let op = OpKind::from_u8(read_bytes_at(buf, &mut offset, 1)?[0]).ok_or("unknown op")?;
    let key_len = read_u32_at(buf, &mut offset)? as usize;
    let key = std::str::from_utf8(read_bytes_at(buf, &mut offset, key_len)?)
        .map_err(|_| "key is not utf-8")?
        .to_string();
    let value_len = read_u32_at(buf, &mut offset)? as usize;
    let value = Bytes::copy_from_slice(read_bytes_at(buf, &mut offset, value_len)?);
    let ttl_ms = read_u64_at(buf, &mut offset)?;
    let timestamp_ms = read_u64_at(buf, &mut offset)?;
    let clock_len = read_u32_at(buf, &mut offset)? as usize;
    let mut pairs = Vec::with_capacity(clock_len.min(1024));
    for _ in 0..clock_len {
        let node = read_u64_at(buf, &mut offset)?;
        let counter = read_u64_at(buf, &mut offset)?;
        pairs.push((NodeId(node), counter));
    }
    if offset != buf.len() {
        return Err("trailing bytes");
    }
    let clock: VectorClock = pairs.into_iter().collect();

    let entry = match op {
        OpKind::Put => KvEntry::from_parts(key, Some(value), clock, timestamp_ms, ttl_ms),
        OpKind::Delete => KvEntry::from_parts(key, None, clock, timestamp_ms, 0),
    };
    Ok(LogEntry { seq, entry })
}

fn read_bytes_at<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], &'static str> {
    if *offset + len > data.len() {
        return Err("record too short");
    }
    let out = &data[*offset..*offset + len];
    *offset += len;
    Ok(out)
}

fn read_u64_at(data: &[u8], offset: &mut usize) -> Result<u64, &'static str> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(read_bytes_at(data, offset, 8)?);
    Ok(u64::from_be_bytes(buf))
}

fn read_u32_at(data: &[u8], offset: &mut usize) -> Result<u32, &'static str> {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(read_bytes_at(data, offset, 4)?);
    Ok(u32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn put(key: &str, value: &str, node: u64) -> KvEntry {
        let mut clock = VectorClock::new();
        clock.increment(NodeId(node));
        KvEntry::live(key, Bytes::copy_from_slice(value.as_bytes()), clock, 1_700_000_000_000, Some(Duration::from_secs(30)))
    }

    #[test]
    fn test_append_and_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path(), SyncMode::Data).unwrap();

        assert_eq!(wal.append(&put("a", "1", 1)).unwrap(), 1);
        assert_eq!(wal.append(&put("b", "2", 1)).unwrap(), 2);
        let mut clock = VectorClock::new();
        clock.increment(NodeId(2));
        assert_eq!(wal.append(&KvEntry::tombstone("a", clock, 5)).unwrap(), 3);

        let records = wal.entries().unwrap();
        assert_eq!(records.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(records[0].entry, put("a", "1", 1));
        assert_eq!(records[0].op(), OpKind::Put);
        assert_eq!(records[2].op(), OpKind::Delete);
        assert!(records[2].entry.is_tombstone());
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = WriteAheadLog::open(dir.path(), SyncMode::None).unwrap();
            wal.append(&put("a", "1", 1)).unwrap();
            wal.append(&put("b", "2", 1)).unwrap();
        }
        let wal = WriteAheadLog::open(dir.path(), SyncMode::None).unwrap();
        assert_eq!(wal.last_seq(), 2);
        assert_eq!(wal.append(&put("c", "3", 1)).unwrap(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let wal = WriteAheadLog::open(dir.path(), SyncMode::None).unwrap();
            wal.append(&put("a", "1", 1)).unwrap();
            wal.append(&put("b", "2", 1)).unwrap();
            wal.path().to_path_buf()
        };

        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let wal = WriteAheadLog::open(dir.path(), SyncMode::None).unwrap();
        let records = wal.entries().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry.key(), "a");
        assert_eq!(wal.append(&put("c", "3", 1)).unwrap(), 2);
        assert_eq!(wal.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_mid_log_corruption_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let wal = WriteAheadLog::open(dir.path(), SyncMode::None).unwrap();
            wal.append(&put("a", "1", 1)).unwrap();
            wal.append(&put("b", "2", 1)).unwrap();
            wal.path().to_path_buf()
        };

        let mut data = fs::read(&path).unwrap();
        data[FRAME_HEADER + 2] ^= 0xff;
        fs::write(&path, data).unwrap();

        let err = WriteAheadLog::open(dir.path(), SyncMode::None).unwrap_err();
        assert!(matches!(err, WalError::Corrupt { offset: 0, .. }), "{err}");
    }

    #[test]
    fn test_sync_failure_fences_writes_until_restore() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path(), SyncMode::Data).unwrap();
        wal.append(&put("a", "1", 1)).unwrap();

        wal.inject_sync_failure();
        assert!(matches!(wal.append(&put("b", "2", 1)), Err(WalError::Io(_))));
        assert!(!wal.is_healthy());
        assert!(matches!(wal.append(&put("c", "3", 1)), Err(WalError::Unhealthy)));

        wal.restore().unwrap();
        assert!(wal.is_healthy());
        assert_eq!(wal.append(&put("d", "4", 1)).unwrap(), 2);

        let keys: Vec<String> = wal.entries().unwrap().iter().map(|r| r.entry.key().to_string()).collect();
        assert_eq!(keys, vec!["a", "d"]);
    }

    #[test]
    fn test_checkpoint_drops_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path(), SyncMode::None).unwrap();
        for i in 0..5 {
            wal.append(&put(&format!("k{i}"), "v", 1)).unwrap();
        }

        assert_eq!(wal.checkpoint(3).unwrap(), 3);
        let seqs: Vec<u64> = wal.entries().unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(wal.append(&put("k5", "v", 1)).unwrap(), 6);

        assert!(matches!(
            wal.checkpoint(10),
            Err(WalError::CheckpointAhead { requested: 10, last: 6 })
        ));
    }

    #[test]
    fn test_advance_skips_checkpointed_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path(), SyncMode::None).unwrap();
        wal.advance_to(41);
        assert_eq!(wal.append(&put("a", "1", 1)).unwrap(), 42);
        wal.advance_to(10);
        assert_eq!(wal.next_seq(), 43);
    }
}
