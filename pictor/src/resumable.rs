//! Resumable-download store.
//!
//! When a download fails or is cancelled mid-flight and the response carried
//! a validator, the accumulated bytes are parked here keyed by URL. The next
//! load of the same URL turns them into a conditional range request; the
//! entry is cleared when the server refuses resumption or when a final image
//! is delivered.

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

/// A partial download eligible for resumption.
#[derive(Debug, Clone)]
pub struct ResumableData {
    /// Resource version the bytes belong to (`ETag` / `Last-Modified`).
    pub validator: String,
    /// Accumulated response bytes.
    pub data: Bytes,
    /// True once a server has honored a range request built from this entry.
    pub server_confirmed: bool,
}

impl ResumableData {
    /// Byte offset the next request should resume from.
    pub fn offset(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Process-wide map of partial downloads, keyed by request URL.
///
/// Shared across sessions; `DashMap` keeps registration lock-free so loaders
/// off the pipeline context never contend with it.
#[derive(Default)]
pub struct ResumableDataStore {
    entries: DashMap<String, ResumableData>,
}

impl ResumableDataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide store shared by every pipeline.
    pub fn shared() -> &'static ResumableDataStore {
        static SHARED: std::sync::OnceLock<ResumableDataStore> = std::sync::OnceLock::new();
        SHARED.get_or_init(ResumableDataStore::new)
    }

    /// Saves a partial download. Empty buffers are not worth a range request
    /// and are ignored.
    pub fn save(&self, url: &str, entry: ResumableData) {
        if entry.data.is_empty() {
            return;
        }
        debug!(url, bytes = entry.data.len(), "Saved resumable data");
        self.entries.insert(url.to_owned(), entry);
    }

    /// Removes and returns the entry for `url`, if one exists.
    pub fn take(&self, url: &str) -> Option<ResumableData> {
        self.entries.remove(url).map(|(_, entry)| entry)
    }

    /// Discards the entry for `url`.
    pub fn remove(&self, url: &str) {
        self.entries.remove(url);
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
