//! Fan-out of library state changes to whoever is listening.
//!
//! Every service holds a clone of the same [`EventBus`]. Emitting never
//! blocks and never fails; when nobody is subscribed the event is dropped.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LibraryEvent {
    // scan lifecycle
    ScanStarted { directory: PathBuf, total: usize },
    ScanProgress { processed: usize, total: usize },
    ScanCompleted { processed: usize, total: usize },
    ScanAborted { processed: usize, total: usize },
    ScanError { directory: PathBuf, message: String },

    // catalog
    ImageIndexed { id: String, path: PathBuf },
    ImageUpdated { id: String },
    ImageRemoved { id: String },
    IndexLoaded { images: usize },

    // lifecycle
    FileArchived { from: PathBuf, to: PathBuf },
    FileRestored { from: PathBuf, to: PathBuf },
    FileDeleted { path: PathBuf, permanent: bool },
    BulkProgress { operation: BulkOperation, processed: usize, total: usize },
    BulkCompleted { operation: BulkOperation, succeeded: usize, failed: usize },

    // thumbnails
    ThumbnailGenerated { source: PathBuf, thumbnail: PathBuf },
    ThumbnailError { source: PathBuf, message: String },
    ThumbnailRemoved { source: PathBuf },
    CacheCleared { removed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BulkOperation {
    Archive,
    Restore,
    Delete,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LibraryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LibraryEvent) {
        // Err only means there are no receivers right now.
        let _ = self.tx.send(event);
    }
}

/// Drains whatever is currently buffered on a receiver.
#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<LibraryEvent>) -> Vec<LibraryEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}
