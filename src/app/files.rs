//! Local file selection queue
//!
//! Files picked for sending become [`FileEntry`] records in the
//! [`FileQueue`]. The queue belongs to the device, not to any connection: a
//! batch send snapshots the pending entries at call time, and only the
//! transfer coordinator mutates status and progress afterwards. Entries for
//! files received from peers are recorded here too, already complete.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

/// Lifecycle of a queued file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Selected, not yet sent.
    Pending,
    /// Currently streaming to a peer.
    Sending,
    /// Sent successfully.
    Completed,
    /// Arrived from a peer.
    Received,
    /// A send attempt failed.
    Error,
}

impl FileStatus {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Received => "received",
            Self::Error => "error",
        }
    }

    /// Terminal states are never picked up by a later batch.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Received | Self::Error)
    }
}

/// One queued file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub id: u64,
    pub name: String,
    pub size_bytes: u64,
    pub mime: String,
    pub status: FileStatus,
    /// Whole percent, 0 through 100.
    pub progress_percent: u8,
    /// Current measured speed in bytes per second.
    pub speed_bps: f64,
}

/// Ordered queue of selected and received files, shared through the
/// session it belongs to.
#[derive(Debug, Default)]
pub struct FileQueue {
    entries: RwLock<Vec<FileEntry>>,
    next_id: AtomicU64,
}

impl FileQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a picked file for sending and returns its id.
    pub fn add(&self, name: impl Into<String>, size_bytes: u64, mime: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = FileEntry {
            id,
            name: name.into(),
            size_bytes,
            mime: mime.into(),
            status: FileStatus::Pending,
            progress_percent: 0,
            speed_bps: 0.0,
        };
        debug!(file = id, name = %entry.name, size = size_bytes, "File queued");
        self.entries.write().push(entry);
        id
    }

    /// Records a file that arrived from a peer, already complete.
    pub fn add_received(
        &self,
        name: impl Into<String>,
        size_bytes: u64,
        mime: impl Into<String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = FileEntry {
            id,
            name: name.into(),
            size_bytes,
            mime: mime.into(),
            status: FileStatus::Received,
            progress_percent: 100,
            speed_bps: 0.0,
        };
        debug!(file = id, name = %entry.name, "Received file recorded");
        self.entries.write().push(entry);
        id
    }

    /// Ids of entries still waiting to be sent, in selection order.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<u64> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.status == FileStatus::Pending)
            .map(|e| e.id)
            .collect()
    }

    /// Snapshot of a single entry.
    #[must_use]
    pub fn entry(&self, id: u64) -> Option<FileEntry> {
        self.entries.read().iter().find(|e| e.id == id).cloned()
    }

    /// Snapshot of the whole queue in selection order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FileEntry> {
        self.entries.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes one entry regardless of state (the user deselected it).
    pub fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Drops every terminal entry, keeping pending and in-flight ones.
    pub fn clear_finished(&self) {
        self.entries.write().retain(|e| !e.status.is_terminal());
    }

    /// Mutates one entry in place. Transfer-coordinator use only; absent ids
    /// are ignored.
    pub(crate) fn update(&self, id: u64, apply: impl FnOnce(&mut FileEntry)) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            apply(entry);
        }
    }
}
