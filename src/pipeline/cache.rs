//! Bounded memo of letterboxed canvases keyed by page content.
//!
//! Eviction is deliberately crude: when the cache is full and a new key
//! arrives, every entry is dropped and the new one is inserted. Batches are
//! processed in page order, so an LRU would evict exactly the entries a
//! full-clear does while costing bookkeeping on every hit.

use crate::pipeline::letterbox::LetterboxParams;
use image::RgbImage;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

/// Default number of canvases retained.
pub const DEFAULT_CACHE_CAPACITY: usize = 8;

/// Content fingerprint of a raw page: xxh3-64 over its dimensions and pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

/// Fingerprint a raw page.
pub fn fingerprint(image: &RgbImage) -> Fingerprint {
    let mut hasher = Xxh3::new();
    hasher.update(&image.width().to_le_bytes());
    hasher.update(&image.height().to_le_bytes());
    hasher.update(image.as_raw());
    Fingerprint(hasher.digest())
}

/// A letterboxed canvas plus the geometry needed to invert it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub canvas: Arc<RgbImage>,
    pub params: LetterboxParams,
}

/// Hit/miss/clear counters, logged at debug level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub clears: u64,
}

/// Bounded, full-clear preprocessing cache.
#[derive(Debug)]
pub struct PreprocessCache {
    entries: HashMap<Fingerprint, CacheEntry>,
    capacity: usize,
    stats: CacheStats,
}

impl Default for PreprocessCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl PreprocessCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, key: &Fingerprint) -> Option<CacheEntry> {
        match self.entries.get(key) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert an entry. A new key arriving at a full cache clears it first.
    pub fn put(&mut self, key: Fingerprint, entry: CacheEntry) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            debug!(
                "Preprocess cache full ({} entries), clearing",
                self.entries.len()
            );
            self.clear();
        }
        self.entries.insert(key, entry);
    }

    /// Return the cached entry for `key`, or build, insert, and return it.
    pub fn get_or_insert_with<E, F>(&mut self, key: Fingerprint, build: F) -> Result<CacheEntry, E>
    where
        F: FnOnce() -> Result<CacheEntry, E>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let entry = build()?;
        self.put(key, entry.clone());
        Ok(entry)
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.stats.clears += 1;
        }
        self.entries.clear();
        debug!(
            hits = self.stats.hits,
            misses = self.stats.misses,
            clears = self.stats.clears,
            "Preprocess cache cleared"
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn entry() -> CacheEntry {
        CacheEntry {
            canvas: Arc::new(RgbImage::new(4, 4)),
            params: LetterboxParams {
                scale: 1.0,
                x_offset: 0,
                y_offset: 0,
            },
        }
    }

    #[test]
    fn fingerprint_depends_on_pixels_and_shape() {
        let a = RgbImage::from_pixel(4, 2, Rgb([1, 2, 3]));
        let b = RgbImage::from_pixel(2, 4, Rgb([1, 2, 3]));
        let mut c = a.clone();
        c.put_pixel(0, 0, Rgb([9, 9, 9]));
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn overflowing_put_clears_everything_first() {
        let mut cache = PreprocessCache::new(3);
        for k in 0..3 {
            cache.put(Fingerprint(k), entry());
        }
        assert_eq!(cache.len(), 3);

        cache.put(Fingerprint(99), entry());
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&Fingerprint(0)).is_none());
        assert!(cache.get(&Fingerprint(99)).is_some());
        assert_eq!(cache.stats().clears, 1);
    }

    #[test]
    fn overwriting_existing_key_does_not_clear() {
        let mut cache = PreprocessCache::new(2);
        cache.put(Fingerprint(1), entry());
        cache.put(Fingerprint(2), entry());
        cache.put(Fingerprint(2), entry());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn capacity_has_floor_of_one() {
        let cache = PreprocessCache::new(0);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn get_or_insert_with_builds_once() {
        let mut cache = PreprocessCache::default();
        let mut builds = 0;
        for _ in 0..3 {
            let got: Result<_, ()> = cache.get_or_insert_with(Fingerprint(7), || {
                builds += 1;
                Ok(entry())
            });
            assert!(got.is_ok());
        }
        assert_eq!(builds, 1);
        assert_eq!(cache.stats().hits, 2);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn failed_build_is_not_cached() {
        let mut cache = PreprocessCache::default();
        let got: Result<CacheEntry, &str> = cache.get_or_insert_with(Fingerprint(1), || Err("boom"));
        assert_eq!(got.unwrap_err(), "boom");
        assert!(cache.is_empty());
    }
}
