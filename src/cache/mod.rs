//! In-memory, cost-weighted cache of fetched bytes, decoded frames and
//! thumbnails, keyed by resource and validated by modification stamp.
//!
//! - Every mutation runs an eviction pass against the configured budget
//! - Pinned keys are never evicted and may push the total over budget
//! - Age counts distinct resources touched since an entry was last used

pub mod cost;
pub mod entry;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use image::ImageFormat;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::decode::DecodedFrame;
use crate::resource::{ModificationStamp, ResourceKey, Size};

pub use cost::{AgeWeightedCost, EvictionPolicy, SizeOnlyCost};
pub use entry::{CacheEntry, Pixmap, MIN_ENTRY_SIZE};

/// Decoded frames as handed out by the cache.
#[derive(Debug, Clone)]
pub struct CachedFrames {
    pub frames: Vec<DecodedFrame>,
    pub format: Option<ImageFormat>,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: usize,
    pub pinned_entries: usize,
}

struct CacheState {
    entries: HashMap<ResourceKey, CacheEntry>,
    /// Pin holders per key.
    pinned: HashMap<ResourceKey, usize>,
    max_size: usize,
    thumbnail_size: Option<u32>,
    policy: Box<dyn EvictionPolicy>,
}

impl CacheState {
    /// Entry for `(key, stamp)`, replacing one recorded under another stamp.
    fn get_or_create(&mut self, key: &ResourceKey, stamp: ModificationStamp) -> &mut CacheEntry {
        let stale = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.stamp != stamp);
        if stale {
            debug!(%key, "Discarding stale cache entry");
            self.entries.remove(key);
        }
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(stamp, key.is_local()))
    }

    fn total_size(&self) -> usize {
        self.entries.values().map(CacheEntry::size).sum()
    }

    fn check_max_size(&mut self) {
        loop {
            let mut total = 0usize;
            let mut candidate: Option<(&ResourceKey, u64)> = None;
            for (key, entry) in &self.entries {
                total += entry.size();
                if self.pinned.contains_key(key) {
                    continue;
                }
                let cost = self.policy.cost(entry);
                if candidate.map_or(true, |(_, best)| cost > best) {
                    candidate = Some((key, cost));
                }
            }

            let Some((key, cost)) = candidate else {
                break;
            };
            if total <= self.max_size {
                break;
            }

            let key = key.clone();
            let remove = match self.entries.get_mut(&key) {
                Some(entry) => !entry.reduce_size() || entry.is_empty(),
                None => break,
            };
            if remove {
                trace!(%key, cost, total, "Evicted cache entry");
                self.entries.remove(&key);
            } else {
                trace!(%key, cost, total, "Reduced cache entry");
            }
        }
    }
}

/// Shared handle to the content cache. Clones refer to the same storage.
#[derive(Clone)]
pub struct ContentCache {
    state: Arc<Mutex<CacheState>>,
}

impl ContentCache {
    /// Cache bounded to `max_size` bytes, scored by [`AgeWeightedCost`].
    pub fn new(max_size: usize) -> Self {
        Self::with_policy(max_size, Box::new(AgeWeightedCost::default()))
    }

    /// Cache with a custom eviction scoring.
    pub fn with_policy(max_size: usize, policy: Box<dyn EvictionPolicy>) -> Self {
        debug!(max_size, "Initialized content cache");
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                pinned: HashMap::new(),
                max_size,
                thumbnail_size: None,
                policy,
            })),
        }
    }

    /// Change the byte budget, evicting right away if it shrank.
    pub fn set_max_size(&self, max_size: usize) {
        let mut state = self.state.lock();
        state.max_size = max_size;
        state.check_max_size();
    }

    /// Byte budget eviction works towards.
    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    /// Store the encoded bytes of `key`. A different `stamp` replaces the
    /// whole entry.
    pub fn add_file(&self, key: &ResourceKey, bytes: Bytes, stamp: ModificationStamp) {
        let mut state = self.state.lock();
        let entry = state.get_or_create(key, stamp);
        entry.raw = Some(bytes);
        entry.age = 0;
        state.check_max_size();
    }

    /// Store decoded frames and their source format, same stamp rules as
    /// [`add_file`](Self::add_file).
    pub fn add_frames(
        &self,
        key: &ResourceKey,
        frames: Vec<DecodedFrame>,
        format: ImageFormat,
        stamp: ModificationStamp,
    ) {
        let mut state = self.state.lock();
        let entry = state.get_or_create(key, stamp);
        entry.frames = frames;
        entry.format = Some(format);
        entry.age = 0;
        state.check_max_size();
    }

    /// Store a thumbnail at the configured size, with the dimensions of the
    /// image it was made from.
    pub fn add_thumbnail(
        &self,
        key: &ResourceKey,
        thumbnail: Pixmap,
        source_size: Size,
        stamp: ModificationStamp,
    ) {
        let mut state = self.state.lock();
        let entry = state.get_or_create(key, stamp);
        entry.thumbnail = Some(thumbnail);
        entry.thumbnail_source_size = source_size;
        entry.age = 0;
        state.check_max_size();
    }

    /// Raw bytes; counts as a use of the entry.
    pub fn file(&self, key: &ResourceKey) -> Option<Bytes> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key)?;
        let raw = entry.raw.clone()?;
        entry.age = 0;
        Some(raw)
    }

    /// Decoded frames; counts as a use of the entry.
    pub fn frames(&self, key: &ResourceKey) -> Option<CachedFrames> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key)?;
        if entry.frames.is_empty() {
            return None;
        }
        entry.age = 0;
        Some(CachedFrames {
            frames: entry.frames.clone(),
            format: entry.format,
        })
    }

    /// Thumbnail and the size of the image it was made from. Does not
    /// refresh the entry's age.
    pub fn thumbnail(&self, key: &ResourceKey) -> Option<(Pixmap, Size)> {
        let state = self.state.lock();
        let entry = state.entries.get(key)?;
        let thumb = entry.thumbnail.clone()?;
        Some((thumb, entry.thumbnail_source_size))
    }

    /// Modification stamp the cached payloads belong to.
    pub fn timestamp(&self, key: &ResourceKey) -> Option<ModificationStamp> {
        self.state.lock().entries.get(key).map(|e| e.stamp)
    }

    /// Whether any payload is cached for `key`.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Forget everything about `key`, e.g. after the file was overwritten.
    pub fn invalidate(&self, key: &ResourceKey) {
        if self.state.lock().entries.remove(key).is_some() {
            debug!(%key, "Invalidated cache entry");
        }
    }

    /// Pin or unpin `key`. Pins are counted, so the key stays protected
    /// until every pin is released; the last unpin runs an eviction pass.
    pub fn set_priority_key(&self, key: &ResourceKey, pinned: bool) {
        let mut state = self.state.lock();
        if pinned {
            *state.pinned.entry(key.clone()).or_insert(0) += 1;
            return;
        }
        let released = match state.pinned.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if released {
            state.pinned.remove(key);
            state.check_max_size();
        }
    }

    pub fn is_pinned(&self, key: &ResourceKey) -> bool {
        self.state.lock().pinned.contains_key(key)
    }

    /// Age every entry by one tick. Called once per newly touched resource.
    pub fn update_age(&self) {
        let mut state = self.state.lock();
        for entry in state.entries.values_mut() {
            entry.age = entry.age.saturating_add(1);
        }
    }

    /// Purge all thumbnails when the configured thumbnail size changes.
    pub fn check_thumbnail_size(&self, size: u32) {
        let mut state = self.state.lock();
        if state.thumbnail_size == Some(size) {
            return;
        }
        if state.thumbnail_size.is_some() {
            debug!(size, "Thumbnail size changed, purging thumbnails");
            for entry in state.entries.values_mut() {
                entry.thumbnail = None;
                entry.thumbnail_source_size = Size::default();
            }
            state.entries.retain(|_, entry| !entry.is_empty());
        }
        state.thumbnail_size = Some(size);
    }

    /// Drop every entry, pinned or not.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Snapshot of an entry, mostly for diagnostics.
    pub fn entry(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Accounted size of all entries, floors included.
    pub fn total_size(&self) -> usize {
        self.state.lock().total_size()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            total_size: state.total_size(),
            pinned_entries: state
                .entries
                .keys()
                .filter(|k| state.pinned.contains_key(*k))
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use std::path::Path;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::from_path(&Path::new("/pics").join(name)).unwrap()
    }

    fn remote(name: &str) -> ResourceKey {
        ResourceKey::parse(&format!("http://host/{}", name)).unwrap()
    }

    fn frames(w: u32, h: u32) -> Vec<DecodedFrame> {
        vec![DecodedFrame::still(RgbaImage::new(w, h))]
    }

    #[test]
    fn test_frames_round_trip_until_invalidated() {
        let cache = ContentCache::new(usize::MAX);
        let k = key("a.png");
        cache.add_frames(&k, frames(4, 4), ImageFormat::Png, ModificationStamp(10));

        let cached = cache.frames(&k).unwrap();
        assert_eq!(cached.frames.len(), 1);
        assert_eq!(cached.format, Some(ImageFormat::Png));
        assert_eq!(cache.timestamp(&k), Some(ModificationStamp(10)));

        cache.invalidate(&k);
        assert!(cache.frames(&k).is_none());
        assert!(cache.timestamp(&k).is_none());
    }

    #[test]
    fn test_new_stamp_discards_old_payload() {
        let cache = ContentCache::new(usize::MAX);
        let k = key("a.png");
        cache.add_frames(&k, frames(4, 4), ImageFormat::Png, ModificationStamp(10));
        cache.add_file(&k, Bytes::from_static(b"new"), ModificationStamp(11));

        assert!(cache.frames(&k).is_none());
        assert_eq!(cache.file(&k).unwrap(), Bytes::from_static(b"new"));
        assert_eq!(cache.timestamp(&k), Some(ModificationStamp(11)));
    }

    #[test]
    fn test_reads_reset_age_except_thumbnail() {
        let cache = ContentCache::new(usize::MAX);
        let a = key("a.png");
        let b = key("b.png");
        cache.add_file(&a, Bytes::from_static(b"aaaa"), ModificationStamp(1));
        cache.add_thumbnail(&b, Arc::new(RgbaImage::new(2, 2)), Size::new(8, 8), ModificationStamp(1));
        cache.update_age();
        cache.update_age();

        assert!(cache.file(&a).is_some());
        assert!(cache.thumbnail(&b).is_some());
        assert_eq!(cache.entry(&a).unwrap().age(), 0);
        assert_eq!(cache.entry(&b).unwrap().age(), 2);
    }

    #[test]
    fn test_evicts_to_budget() {
        let cache = ContentCache::new(50_000);
        for i in 0..10 {
            let k = remote(&format!("{}.png", i));
            cache.add_frames(&k, frames(50, 50), ImageFormat::Png, ModificationStamp(1));
            cache.update_age();
        }
        assert!(cache.total_size() <= 50_000);
        // The most recent entry survives.
        assert!(cache.frames(&remote("9.png")).is_some());
        assert!(cache.frames(&remote("0.png")).is_none());
    }

    #[test]
    fn test_pinned_entries_survive_and_may_exceed_budget() {
        let cache = ContentCache::new(1_000);
        let pinned = remote("pinned.png");
        cache.set_priority_key(&pinned, true);
        cache.add_frames(&pinned, frames(40, 40), ImageFormat::Png, ModificationStamp(1));
        cache.add_frames(&remote("other.png"), frames(40, 40), ImageFormat::Png, ModificationStamp(1));

        assert!(cache.frames(&pinned).is_some());
        assert!(!cache.contains(&remote("other.png")));
        assert!(cache.total_size() > cache.max_size());
        assert_eq!(cache.stats().pinned_entries, 1);
    }

    #[test]
    fn test_unpinning_triggers_eviction() {
        let cache = ContentCache::new(1_000);
        let k = remote("big.png");
        cache.set_priority_key(&k, true);
        cache.add_frames(&k, frames(40, 40), ImageFormat::Png, ModificationStamp(1));
        assert!(cache.contains(&k));

        cache.set_priority_key(&k, false);
        assert!(!cache.contains(&k));
        assert_eq!(cache.total_size(), 0);
    }

    #[test]
    fn test_pins_are_counted() {
        let cache = ContentCache::new(1_000);
        let k = remote("shared.png");
        cache.set_priority_key(&k, true);
        cache.set_priority_key(&k, true);
        cache.add_frames(&k, frames(40, 40), ImageFormat::Png, ModificationStamp(1));

        cache.set_priority_key(&k, false);
        assert!(cache.is_pinned(&k));
        assert!(cache.contains(&k));

        cache.set_priority_key(&k, false);
        assert!(!cache.is_pinned(&k));
        assert!(!cache.contains(&k));

        // Unpinning a key that was never pinned is a no-op.
        cache.set_priority_key(&k, false);
        assert!(!cache.is_pinned(&k));
    }

    #[test]
    fn test_local_file_bytes_dropped_before_frames() {
        let k = key("photo.jpg");
        let cache = ContentCache::new(usize::MAX);
        cache.add_file(&k, Bytes::from(vec![0u8; 20_000]), ModificationStamp(1));
        cache.add_frames(&k, frames(100, 100), ImageFormat::Jpeg, ModificationStamp(1));

        // Squeeze just below the current footprint.
        cache.set_max_size(cache.total_size() - 1);
        let entry = cache.entry(&k).unwrap();
        assert!(!entry.has_file());
        assert!(entry.has_frames());
    }

    #[test]
    fn test_thumbnail_size_change_purges_thumbnails() {
        let cache = ContentCache::new(usize::MAX);
        let a = key("a.png");
        let b = key("b.png");
        cache.check_thumbnail_size(128);
        cache.add_thumbnail(&a, Arc::new(RgbaImage::new(2, 2)), Size::new(8, 8), ModificationStamp(1));
        cache.add_thumbnail(&b, Arc::new(RgbaImage::new(2, 2)), Size::new(8, 8), ModificationStamp(1));
        cache.add_file(&b, Bytes::from_static(b"b"), ModificationStamp(1));

        cache.check_thumbnail_size(128);
        assert!(cache.thumbnail(&a).is_some());

        cache.check_thumbnail_size(256);
        assert!(cache.thumbnail(&a).is_none());
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
    }
}
