//! Point-in-time copies of a node's map.
//!
//! A snapshot records the last WAL sequence number it covers so recovery
//! replays only the records written after it. Files are written to a
//! temporary path, synced, then renamed over the previous snapshot.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::entry::KvEntry;
use crate::error::StorageError;
use crate::wal::sync_parent_dir;

pub const SNAPSHOT_FILE: &str = "snapshot.bin";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last WAL sequence number reflected in `entries`.
    pub seq: u64,
    pub entries: Vec<KvEntry>,
}

impl Snapshot {
    pub fn write_to(&self, dir: &Path) -> Result<(), StorageError> {
        let bytes = bincode::serialize(self)?;
        let path = dir.join(SNAPSHOT_FILE);
        let tmp_path = path.with_extension("bin.tmp");

        let mut out = File::create(&tmp_path).map_err(snapshot_io)?;
        out.write_all(&bytes).map_err(snapshot_io)?;
        out.sync_all().map_err(snapshot_io)?;
        fs::rename(&tmp_path, &path).map_err(snapshot_io)?;
        sync_parent_dir(&path).map_err(snapshot_io)?;

        tracing::info!(path = %path.display(), seq = self.seq, entries = self.entries.len(), "snapshot written");
        Ok(())
    }

    /// The latest snapshot under `dir`, if any.
    pub fn load(dir: &Path) -> Result<Option<Self>, StorageError> {
        let path = dir.join(SNAPSHOT_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(snapshot_io(err)),
        };
        let snapshot: Snapshot = bincode::deserialize(&bytes)
            .map_err(|err| StorageError::Snapshot(format!("{}: {err}", path.display())))?;
        Ok(Some(snapshot))
    }
}

fn snapshot_io(err: io::Error) -> StorageError {
    StorageError::Snapshot(err.to_string())
}
