//! Per-task traffic accounting
//!
//! Relay sessions add copied plaintext bytes to a [`TrafficCounter`]; the
//! metering collaborator drains all counters through the owning
//! [`TrafficRegistry`] and reports them upstream.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Result, TaskId};

/// Direction of a byte count relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client towards destination
    Upload,
    /// Destination towards client
    Download,
}

/// Byte deltas accumulated since the previous drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrafficDelta {
    pub upload: u64,
    pub download: u64,
}

impl TrafficDelta {
    pub fn is_zero(&self) -> bool {
        self.upload == 0 && self.download == 0
    }

    pub fn total(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }
}

/// Non-zero deltas keyed by task id, in ascending id order
pub type TrafficSnapshot = BTreeMap<TaskId, TrafficDelta>;

/// Upload/download byte counters of one relay session.
///
/// Only ever mutated through atomic adds; the two counters advance
/// independently.
#[derive(Debug, Default)]
pub struct TrafficCounter {
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_upload(&self, bytes: u64) {
        self.upload.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Upload => self.add_upload(bytes),
            Direction::Download => self.add_download(bytes),
        }
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    /// Read both counters and reset them to zero.
    pub fn take(&self) -> TrafficDelta {
        TrafficDelta {
            upload: self.upload.swap(0, Ordering::Relaxed),
            download: self.download.swap(0, Ordering::Relaxed),
        }
    }

    /// Add back a delta previously returned by [`take`](Self::take).
    pub fn restore(&self, delta: TrafficDelta) {
        self.add_upload(delta.upload);
        self.add_download(delta.download);
    }
}

/// Upstream destination for traffic snapshots (controller API, billing, logs).
pub trait TrafficSink: Send + Sync {
    fn report(&self, snapshot: &TrafficSnapshot) -> impl Future<Output = Result<()>> + Send;
}

/// Registry of the traffic counters of every running task.
///
/// Owned by the task runner and handed to each session when it is built.
#[derive(Debug, Default)]
pub struct TrafficRegistry {
    counters: RwLock<HashMap<TaskId, Arc<TrafficCounter>>>,
}

impl TrafficRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter for a task, creating it on first use.
    pub fn counter(&self, id: TaskId) -> Arc<TrafficCounter> {
        if let Some(counter) = self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            return counter.clone();
        }

        self.counters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_default()
            .clone()
    }

    /// Number of registered counters
    pub fn len(&self) -> usize {
        self.counters.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current non-zero values without resetting them.
    pub fn peek(&self) -> TrafficSnapshot {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, counter)| {
                (
                    *id,
                    TrafficDelta {
                        upload: counter.upload(),
                        download: counter.download(),
                    },
                )
            })
            .filter(|(_, delta)| !delta.is_zero())
            .collect()
    }

    /// Drain every non-zero counter, resetting it to zero.
    pub fn snapshot_and_reset(&self) -> TrafficSnapshot {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, counter)| (*id, counter.take()))
            .filter(|(_, delta)| !delta.is_zero())
            .collect()
    }

    /// Put a drained snapshot back, on top of whatever accrued since.
    pub fn restore(&self, snapshot: &TrafficSnapshot) {
        for (id, delta) in snapshot {
            self.counter(*id).restore(*delta);
        }
    }

    /// Drain all counters into `sink`.
    ///
    /// When the sink fails the drained amounts are restored, so a failed
    /// upstream report never loses traffic from accounting.
    pub async fn report_with<S: TrafficSink>(&self, sink: &S) -> Result<TrafficSnapshot> {
        let snapshot = self.snapshot_and_reset();
        if snapshot.is_empty() {
            return Ok(snapshot);
        }

        match sink.report(&snapshot).await {
            Ok(()) => {
                debug!(tasks = snapshot.len(), "traffic snapshot reported");
                Ok(snapshot)
            }
            Err(e) => {
                warn!(error = %e, tasks = snapshot.len(), "traffic report failed, restoring counters");
                self.restore(&snapshot);
                Err(e)
            }
        }
    }
}
