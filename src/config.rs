//! Tunable parameters for the acquisition core.
//!
//! Values come from [`CoreConfig::default`] and may be overridden through
//! `PIXCACHE_*` environment variables.

use std::path::PathBuf;

use directories::BaseDirs;
use tracing::warn;

const DEFAULT_CACHE_MB: usize = 256;
const DEFAULT_THUMB_SIZE: u32 = 128;
const DEFAULT_DECODE_WORKERS: usize = 2;
const MAX_DECODE_WORKERS: usize = 8;

/// Options recognized by the core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Budget for [`crate::cache::ContentCache`], in bytes.
    pub max_cache_size_bytes: usize,
    /// Longest side of generated thumbnails, in pixels.
    pub thumbnail_pixel_size: u32,
    /// Apply EXIF orientation to decoded JPEG images and thumbnails.
    pub auto_rotate_images: bool,
    /// Persist generated thumbnails under `thumbnail_root`.
    pub store_thumbnails_on_disk: bool,
    /// Root of the per-user thumbnail directory (`normal/`, `large/` live below it).
    pub thumbnail_root: Option<PathBuf>,
    /// Threads in the decode pool used for the threaded decode path.
    pub decode_workers: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: DEFAULT_CACHE_MB * 1024 * 1024,
            thumbnail_pixel_size: DEFAULT_THUMB_SIZE,
            auto_rotate_images: true,
            store_thumbnails_on_disk: true,
            thumbnail_root: default_thumbnail_root(),
            decode_workers: DEFAULT_DECODE_WORKERS,
        }
    }
}

impl CoreConfig {
    /// Defaults overridden by any `PIXCACHE_*` variables that parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(mb) = env_parse::<usize>("PIXCACHE_CACHE_MB").filter(|v| *v > 0) {
            config.max_cache_size_bytes = mb * 1024 * 1024;
        }
        if let Some(size) = env_parse::<u32>("PIXCACHE_THUMB_SIZE").filter(|v| *v > 0) {
            config.thumbnail_pixel_size = size;
        }
        if let Some(flag) = env_flag("PIXCACHE_AUTO_ROTATE") {
            config.auto_rotate_images = flag;
        }
        if let Some(flag) = env_flag("PIXCACHE_DISK_THUMBS") {
            config.store_thumbnails_on_disk = flag;
        }
        if let Some(workers) = env_parse::<usize>("PIXCACHE_DECODE_WORKERS") {
            config.decode_workers = workers.clamp(1, MAX_DECODE_WORKERS);
        }

        config
    }

    /// Builder-style override used mostly by tests and embedders.
    pub fn with_thumbnail_root(mut self, root: PathBuf) -> Self {
        self.thumbnail_root = Some(root);
        self
    }
}

fn default_thumbnail_root() -> Option<PathBuf> {
    match BaseDirs::new() {
        Some(dirs) => Some(dirs.cache_dir().join("thumbnails")),
        None => {
            warn!("No home directory, on-disk thumbnails disabled");
            None
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.max_cache_size_bytes, 256 * 1024 * 1024);
        assert_eq!(config.thumbnail_pixel_size, 128);
        assert!(config.auto_rotate_images);
        assert!(config.store_thumbnails_on_disk);
    }

    #[test]
    fn test_with_thumbnail_root() {
        let config = CoreConfig::default().with_thumbnail_root(PathBuf::from("/tmp/t"));
        assert_eq!(config.thumbnail_root, Some(PathBuf::from("/tmp/t")));
    }
}
