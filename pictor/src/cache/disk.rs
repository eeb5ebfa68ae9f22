//! File-per-entry disk cache for raw downloaded bytes.
//!
//! Entries are stored under a single directory, named by a hash of the URL
//! key. An in-memory index built by scanning the directory at startup tracks
//! sizes and access times; least-recently-used entries are evicted when the
//! count or size limit is exceeded. Reads and writes run on the blocking
//! thread pool so lookups never stall the async runtime.

use super::DataCache;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Limits for the disk cache.
#[derive(Debug, Clone, Copy)]
pub struct DiskCacheConfig {
    /// Maximum number of cached entries.
    pub count_limit: usize,
    /// Maximum total size in bytes.
    pub size_limit_bytes: u64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            count_limit: 1000,
            size_limit_bytes: 100 * 1024 * 1024,
        }
    }
}

struct IndexEntry {
    path: PathBuf,
    size: u64,
    last_used: SystemTime,
}

struct Index {
    entries: HashMap<String, IndexEntry>,
    total_size: u64,
}

/// Raw-bytes disk cache keyed by URL string.
pub struct DiskDataCache {
    root: PathBuf,
    config: DiskCacheConfig,
    index: Arc<Mutex<Index>>,
}

impl DiskDataCache {
    /// Opens (or creates) a cache rooted at `root`.
    ///
    /// Scans the directory to rebuild the index, then evicts down to the
    /// configured limits.
    pub fn new(root: impl Into<PathBuf>, config: DiskCacheConfig) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let cache = Self {
            root,
            config,
            index: Arc::new(Mutex::new(Index {
                entries: HashMap::new(),
                total_size: 0,
            })),
        };
        cache.scan();
        cache.evict_if_needed();
        Ok(cache)
    }

    /// Opens a cache with the default limits.
    pub fn with_defaults(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        Self::new(root, DiskCacheConfig::default())
    }

    /// Returns the number of indexed entries.
    pub fn entry_count(&self) -> usize {
        self.index.lock().entries.len()
    }

    /// Returns the indexed total size in bytes.
    pub fn total_size(&self) -> u64 {
        self.index.lock().total_size
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(filename_for_key(key))
    }

    fn scan(&self) {
        let mut index = self.index.lock();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Disk cache scan failed");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            index.total_size += meta.len();
            index.entries.insert(
                name,
                IndexEntry {
                    path,
                    size: meta.len(),
                    last_used: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
            );
        }
        debug!(
            entries = index.entries.len(),
            bytes = index.total_size,
            "Disk cache index rebuilt"
        );
    }

    fn evict_if_needed(&self) {
        let mut index = self.index.lock();
        while index.entries.len() > self.config.count_limit
            || index.total_size > self.config.size_limit_bytes
        {
            let oldest = index
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(name, _)| name.clone());
            let Some(name) = oldest else { break };
            if let Some(entry) = index.entries.remove(&name) {
                index.total_size = index.total_size.saturating_sub(entry.size);
                if let Err(e) = fs::remove_file(&entry.path) {
                    warn!(path = %entry.path.display(), error = %e, "Disk cache eviction failed");
                }
            }
        }
    }
}

impl DataCache for DiskDataCache {
    fn lookup(&self, key: &str) -> BoxFuture<'static, Option<Bytes>> {
        let name = filename_for_key(key);
        let index = Arc::clone(&self.index);
        Box::pin(async move {
            let path = {
                let mut index = index.lock();
                let entry = index.entries.get_mut(&name)?;
                entry.last_used = SystemTime::now();
                entry.path.clone()
            };
            let read = tokio::task::spawn_blocking(move || fs::read(&path)).await;
            match read {
                Ok(Ok(data)) => Some(Bytes::from(data)),
                Ok(Err(e)) => {
                    // Stale index entry; drop it so the next lookup misses fast.
                    warn!(error = %e, "Disk cache read failed");
                    let mut index = index.lock();
                    if let Some(entry) = index.entries.remove(&name) {
                        index.total_size = index.total_size.saturating_sub(entry.size);
                    }
                    None
                }
                Err(_) => None,
            }
        })
    }

    fn store(&self, key: &str, data: Bytes) {
        let path = self.entry_path(key);
        let name = filename_for_key(key);
        let index = Arc::clone(&self.index);
        let config = self.config;
        tokio::task::spawn_blocking(move || {
            if let Err(e) = fs::write(&path, &data) {
                warn!(path = %path.display(), error = %e, "Disk cache write failed");
                return;
            }
            let mut index = index.lock();
            if let Some(previous) = index.entries.remove(&name) {
                index.total_size = index.total_size.saturating_sub(previous.size);
            }
            index.total_size += data.len() as u64;
            index.entries.insert(
                name,
                IndexEntry {
                    path,
                    size: data.len() as u64,
                    last_used: SystemTime::now(),
                },
            );
            // Inline eviction keeps the lock local; the loop is bounded by
            // the entry count.
            while index.entries.len() > config.count_limit
                || index.total_size > config.size_limit_bytes
            {
                let oldest = index
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(name, _)| name.clone());
                let Some(victim) = oldest else { break };
                if let Some(entry) = index.entries.remove(&victim) {
                    index.total_size = index.total_size.saturating_sub(entry.size);
                    let _ = fs::remove_file(&entry.path);
                }
            }
        });
    }
}

/// Stable filename for a URL key.
fn filename_for_key(key: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
