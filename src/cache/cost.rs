//! Eviction scoring. The entry with the highest cost is reduced first.

use super::entry::CacheEntry;

/// Scores cache entries for eviction. Higher means "give this up sooner".
pub trait EvictionPolicy: Send + Sync {
    fn cost(&self, entry: &CacheEntry) -> u64;
}

/// Size scaled by how cheap the payload is to get back and how long ago it
/// was touched.
///
/// - Raw bytes of a local file are re-read from disk in no time, so they
///   carry `local_raw_penalty` (`local_jpeg_raw_penalty` for JPEG, whose
///   bytes are kept around for lossless edits).
/// - A thumbnail-bearing entry also carries `thumbnail_penalty`:
///   thumbnails are numerous and quick to regenerate.
/// - Entries touched within the last `recent_divisors.len()` ticks are
///   scaled by `recent_numerator / recent_divisors[age]`; older entries are
///   multiplied by how far past that window they are.
#[derive(Debug, Clone)]
pub struct AgeWeightedCost {
    pub local_raw_penalty: u64,
    pub local_jpeg_raw_penalty: u64,
    pub thumbnail_penalty: u64,
    pub recent_numerator: u64,
    pub recent_divisors: Vec<u64>,
}

impl Default for AgeWeightedCost {
    fn default() -> Self {
        Self {
            local_raw_penalty: 100,
            local_jpeg_raw_penalty: 10,
            thumbnail_penalty: 100,
            recent_numerator: 10,
            recent_divisors: vec![50, 30, 20, 16, 12, 10],
        }
    }
}

impl EvictionPolicy for AgeWeightedCost {
    fn cost(&self, entry: &CacheEntry) -> u64 {
        let mut cost = entry.size() as u64;

        if entry.is_fast_url() && entry.has_file() {
            let penalty = if entry.is_jpeg() {
                self.local_jpeg_raw_penalty
            } else {
                self.local_raw_penalty
            };
            cost = cost.saturating_mul(penalty);
        }
        if entry.has_thumbnail() {
            cost = cost.saturating_mul(self.thumbnail_penalty);
        }

        let age = entry.age() as usize;
        let window = self.recent_divisors.len();
        match self.recent_divisors.get(age) {
            Some(&divisor) => cost.saturating_mul(self.recent_numerator) / divisor.max(1),
            None => cost.saturating_mul((age + 1 - window) as u64),
        }
    }
}

/// Plain size-times-age scoring, handy when the payload kind should not matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeOnlyCost;

impl EvictionPolicy for SizeOnlyCost {
    fn cost(&self, entry: &CacheEntry) -> u64 {
        (entry.size() as u64).saturating_mul(entry.age() as u64 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ModificationStamp;
    use bytes::Bytes;
    use image::{ImageFormat, RgbaImage};
    use std::sync::Arc;

    fn raw_entry(fast: bool, age: u32, len: usize) -> CacheEntry {
        let mut e = CacheEntry::new(ModificationStamp(0), fast);
        e.raw = Some(Bytes::from(vec![0u8; len]));
        e.format = Some(ImageFormat::Png);
        e.age = age;
        e
    }

    #[test]
    fn test_recent_entries_are_protected() {
        let policy = AgeWeightedCost::default();
        let fresh = policy.cost(&raw_entry(false, 0, 1000));
        let mid = policy.cost(&raw_entry(false, 5, 1000));
        let old = policy.cost(&raw_entry(false, 8, 1000));
        assert_eq!(fresh, 1000 * 10 / 50);
        assert_eq!(mid, 1000 * 10 / 10);
        // age 6 is the first age past the window and scales by 1.
        assert_eq!(policy.cost(&raw_entry(false, 6, 1000)), 1000);
        assert_eq!(old, 1000 * 3);
        assert!(fresh < mid && mid <= old);
    }

    #[test]
    fn test_local_raw_bytes_cost_more() {
        let policy = AgeWeightedCost::default();
        let local = policy.cost(&raw_entry(true, 7, 1000));
        let remote = policy.cost(&raw_entry(false, 7, 1000));
        assert_eq!(local, remote * 100);

        let mut jpeg = raw_entry(true, 7, 1000);
        jpeg.format = Some(ImageFormat::Jpeg);
        assert_eq!(policy.cost(&jpeg), remote * 10);
    }

    #[test]
    fn test_thumbnail_penalty_stacks_with_local_bytes() {
        let policy = AgeWeightedCost::default();
        let bare = policy.cost(&raw_entry(true, 6, 1000));
        assert_eq!(bare, 1000 * 100);

        let mut with_thumb = raw_entry(true, 6, 1000);
        with_thumb.thumbnail = Some(Arc::new(RgbaImage::new(10, 10)));
        // 1000 bytes + 400 thumbnail bytes, times both penalties
        assert_eq!(policy.cost(&with_thumb), 1400 * 100 * 100);
    }
}
