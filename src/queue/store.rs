//! Durable snapshot of pending queue entries
//!
//! The snapshot is rewritten atomically after every queue mutation. Entries
//! carry access tokens, so the file is owner-only. An exclusive lock on a
//! sibling `.lock` file keeps two processes from sharing one snapshot.

use crate::job::QueueEntry;
use crate::util::write_atomic;
use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

const SNAPSHOT_VERSION: u32 = 1;
const LOCK_TIMEOUT_SECS: u64 = 2;
const LOCK_RETRY_MS: u64 = 50;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<QueueEntry>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    entries: Vec<&'a QueueEntry>,
}

/// Released when dropped.
struct SnapshotLock {
    file: File,
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct SnapshotStore {
    path: PathBuf,
    _lock: SnapshotLock,
}

impl SnapshotStore {
    /// Open the snapshot at `path`, taking the process-exclusive lock.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let lock_path = path.with_extension("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open {}", lock_path.display()))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        anyhow::bail!(
                            "Queue snapshot {} is locked by another process",
                            path.display()
                        );
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock: SnapshotLock { file },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pending entries from the last run. A missing snapshot is empty; an
    /// unreadable one is moved aside.
    pub fn load(&self) -> anyhow::Result<Vec<QueueEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).context("Failed to read queue snapshot"),
        };

        match serde_json::from_str::<Snapshot>(&content) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Ok(snapshot.entries),
            Ok(snapshot) => {
                warn!(
                    version = snapshot.version,
                    "ignoring queue snapshot with unknown version"
                );
                self.preserve_corrupt(&content);
                Ok(Vec::new())
            }
            Err(err) => {
                warn!("Queue snapshot was corrupted ({}). A backup was saved.", err);
                self.preserve_corrupt(&content);
                Ok(Vec::new())
            }
        }
    }

    pub fn save<'a>(&self, entries: impl IntoIterator<Item = &'a QueueEntry>) -> anyhow::Result<()> {
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            entries: entries.into_iter().collect(),
        };
        let json = serde_json::to_string(&snapshot).context("Failed to serialize queue")?;
        write_atomic(&self.path, &json).context("Failed to write queue snapshot")
    }

    fn preserve_corrupt(&self, content: &str) {
        let corrupt_path = self.path.with_extension("json.corrupt");
        if fs::rename(&self.path, &corrupt_path).is_err() {
            let _ = fs::write(&corrupt_path, content);
        }
    }
}
