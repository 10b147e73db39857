//! Admission-controlled job queue
//!
//! A FIFO with a hard depth cap. Submissions beyond the cap are rejected
//! immediately and leave the queue untouched. The consumer waits for work
//! with a bounded timeout so it can periodically check for shutdown.

pub mod store;

pub use store::SnapshotStore;

use crate::error::{AgentError, AgentResult};
use crate::job::QueueEntry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub struct JobQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    available: Notify,
    max_depth: usize,
    store: Option<SnapshotStore>,
    /// Bumped under the `entries` lock on every mutation.
    revision: AtomicU64,
    /// Revision of the snapshot last written to disk.
    written: Mutex<u64>,
}

/// Copy of the queue taken under the lock, written after it is released.
struct PendingSnapshot {
    revision: u64,
    entries: Vec<QueueEntry>,
}

impl JobQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            max_depth: max_depth.max(1),
            store: None,
            revision: AtomicU64::new(0),
            written: Mutex::new(0),
        }
    }

    /// A queue backed by `store`, seeded with the entries it holds.
    /// Restored entries may exceed `max_depth`; they are never dropped.
    pub fn with_store(max_depth: usize, store: SnapshotStore) -> anyhow::Result<Self> {
        let restored = store.load()?;
        if !restored.is_empty() {
            info!(
                pending = restored.len(),
                path = %store.path().display(),
                "restored queue snapshot"
            );
        }
        let queue = Self {
            entries: Mutex::new(restored.into()),
            available: Notify::new(),
            max_depth: max_depth.max(1),
            store: Some(store),
            revision: AtomicU64::new(0),
            written: Mutex::new(0),
        };
        if queue.len() > 0 {
            queue.available.notify_one();
        }
        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a mutation. Must be called with the `entries` lock held.
    fn capture(&self, entries: &VecDeque<QueueEntry>) -> Option<PendingSnapshot> {
        self.store.as_ref()?;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        Some(PendingSnapshot {
            revision,
            entries: entries.iter().cloned().collect(),
        })
    }

    /// Write a captured snapshot unless a newer one already reached disk.
    fn persist(&self, pending: Option<PendingSnapshot>) {
        let (Some(store), Some(pending)) = (&self.store, pending) else {
            return;
        };
        let mut written = self.written.lock().unwrap_or_else(|p| p.into_inner());
        if pending.revision <= *written {
            return;
        }
        match store.save(&pending.entries) {
            Ok(()) => *written = pending.revision,
            Err(e) => warn!("failed to persist queue snapshot: {:#}", e),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Enqueue `entry`, or reject it when `max_depth` entries are pending.
    /// Returns the depth after the push.
    pub fn try_push(&self, entry: QueueEntry) -> AgentResult<usize> {
        let mut entries = self.lock();
        if entries.len() >= self.max_depth {
            debug!(depth = entries.len(), "queue full, rejecting submission");
            return Err(AgentError::AdmissionRejected {
                max_depth: self.max_depth,
            });
        }
        entries.push_back(entry);
        let depth = entries.len();
        let pending = self.capture(&entries);
        drop(entries);

        self.persist(pending);
        self.available.notify_one();
        Ok(depth)
    }

    fn pop_now(&self) -> Option<QueueEntry> {
        let mut entries = self.lock();
        let entry = entries.pop_front()?;
        let pending = self.capture(&entries);
        drop(entries);

        self.persist(pending);
        Some(entry)
    }

    /// Take the oldest entry, waiting up to `timeout` for one to arrive.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(entry) = self.pop_now() {
                return Some(entry);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.pop_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::fixtures;
    use std::sync::Arc;

    #[test]
    fn test_cap_is_inclusive() {
        let queue = JobQueue::new(10);
        for i in 0..10 {
            assert_eq!(queue.try_push(fixtures::entry(&i.to_string())).unwrap(), i + 1);
        }
        let err = queue.try_push(fixtures::entry("overflow")).unwrap_err();
        assert_eq!(err, AgentError::AdmissionRejected { max_depth: 10 });
        assert_eq!(queue.len(), 10);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new(5);
        for id in ["a", "b", "c"] {
            queue.try_push(fixtures::entry(id)).unwrap();
        }
        let mut order = Vec::new();
        while let Some(entry) = queue.pop_timeout(Duration::from_millis(10)).await {
            order.push(entry.socket_id);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = JobQueue::new(1);
        let start = std::time::Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(50)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(JobQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.try_push(fixtures::entry("late")).unwrap();
        let entry = consumer.await.unwrap().unwrap();
        assert_eq!(entry.socket_id, "late");
    }

    #[tokio::test]
    async fn test_concurrent_submissions_never_exceed_cap() {
        let queue = Arc::new(JobQueue::new(10));
        let handles: Vec<_> = (0..50)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.try_push(fixtures::entry(&i.to_string())).is_ok() })
            })
            .collect();
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(queue.len(), 10);
    }

    #[test]
    fn test_stale_snapshot_never_overwrites_newer_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let queue = JobQueue::with_store(5, SnapshotStore::open(&path).unwrap()).unwrap();

        let (older, newer) = {
            let mut entries = queue.lock();
            entries.push_back(fixtures::entry("one"));
            let older = queue.capture(&entries);
            entries.push_back(fixtures::entry("two"));
            let newer = queue.capture(&entries);
            (older, newer)
        };
        // Writes land out of order; the disk must keep the newer state.
        queue.persist(newer);
        queue.persist(older);

        let store = queue.store.as_ref().unwrap();
        let sockets: Vec<String> = store.load().unwrap().into_iter().map(|e| e.socket_id).collect();
        assert_eq!(sockets, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        {
            let queue = JobQueue::with_store(3, SnapshotStore::open(&path).unwrap()).unwrap();
            queue.try_push(fixtures::entry("first")).unwrap();
            queue.try_push(fixtures::entry("second")).unwrap();
            let popped = queue.pop_timeout(Duration::from_millis(10)).await.unwrap();
            assert_eq!(popped.socket_id, "first");
        }
        let queue = JobQueue::with_store(3, SnapshotStore::open(&path).unwrap()).unwrap();
        assert_eq!(queue.len(), 1);
        let entry = queue.pop_timeout(Duration::from_millis(10)).await.unwrap();
        assert_eq!(entry.socket_id, "second");
    }
}
