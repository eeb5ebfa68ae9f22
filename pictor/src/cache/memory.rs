//! In-memory response cache with LRU eviction.

use super::ImageCache;
use crate::image::ImageResponse;
use crate::request::{CacheKey, ImageRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Default capacity: 256 MiB of decoded pixels.
pub const DEFAULT_SIZE_LIMIT_BYTES: usize = 256 * 1024 * 1024;

/// Default entry count limit.
pub const DEFAULT_COUNT_LIMIT: usize = 2000;

struct CacheEntry {
    response: ImageResponse,
    cost: usize,
    last_accessed: Instant,
}

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    total_cost: usize,
}

/// Decoded-image cache keyed by (URL, processor identity).
///
/// Cost accounting approximates each entry as its RGBA byte footprint.
/// Least-recently-used entries are evicted when either the size or the count
/// limit would be exceeded.
pub struct MemoryImageCache {
    state: Mutex<CacheState>,
    size_limit: usize,
    count_limit: usize,
}

impl MemoryImageCache {
    /// Creates a cache with explicit limits.
    pub fn new(size_limit: usize, count_limit: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_cost: 0,
            }),
            size_limit,
            count_limit,
        }
    }

    /// Creates a cache with the default limits.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_SIZE_LIMIT_BYTES, DEFAULT_COUNT_LIMIT)
    }

    /// Returns the number of cached responses.
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns the current cost in bytes.
    pub fn total_cost(&self) -> usize {
        self.state.lock().total_cost
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_cost = 0;
    }

    fn evict_for(state: &mut CacheState, incoming_cost: usize, size_limit: usize, count_limit: usize) {
        while !state.entries.is_empty()
            && (state.total_cost + incoming_cost > size_limit
                || state.entries.len() + 1 > count_limit)
        {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else { break };
            if let Some(entry) = state.entries.remove(&key) {
                state.total_cost = state.total_cost.saturating_sub(entry.cost);
                debug!(cost = entry.cost, "Evicted memory cache entry");
            }
        }
    }

    fn cost_of(response: &ImageResponse) -> usize {
        let image = response.image();
        (image.width() as usize) * (image.height() as usize) * 4
    }
}

impl ImageCache for MemoryImageCache {
    fn get(&self, request: &ImageRequest) -> Option<ImageResponse> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&request.cache_key())?;
        entry.last_accessed = Instant::now();
        Some(entry.response.clone())
    }

    fn put(&self, request: &ImageRequest, response: ImageResponse) {
        let cost = Self::cost_of(&response);
        let mut state = self.state.lock();

        if let Some(previous) = state.entries.remove(&request.cache_key()) {
            state.total_cost = state.total_cost.saturating_sub(previous.cost);
        }
        Self::evict_for(&mut state, cost, self.size_limit, self.count_limit);

        state.total_cost += cost;
        state.entries.insert(
            request.cache_key(),
            CacheEntry {
                response,
                cost,
                last_accessed: Instant::now(),
            },
        );
    }
}
