use std::sync::Arc;

use bytes::Bytes;
use image::{ImageFormat, RgbaImage};

use crate::decode::DecodedFrame;
use crate::resource::{ModificationStamp, Size};

/// Small raster used for thumbnails.
pub type Pixmap = Arc<RgbaImage>;

/// Floor applied to every entry so many tiny entries still cost something.
pub const MIN_ENTRY_SIZE: usize = 100;

/// Payload stored for one resource. Owned by [`super::ContentCache`].
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(crate) raw: Option<Bytes>,
    pub(crate) frames: Vec<DecodedFrame>,
    pub(crate) format: Option<ImageFormat>,
    pub(crate) thumbnail: Option<Pixmap>,
    pub(crate) thumbnail_source_size: Size,
    pub(crate) stamp: ModificationStamp,
    /// Distinct resources touched since this entry was last read or written.
    pub(crate) age: u32,
    /// Local file, cheap to read again.
    pub(crate) fast_url: bool,
}

impl CacheEntry {
    pub(crate) fn new(stamp: ModificationStamp, fast_url: bool) -> Self {
        Self {
            raw: None,
            frames: Vec::new(),
            format: None,
            thumbnail: None,
            thumbnail_source_size: Size::default(),
            stamp,
            age: 0,
            fast_url,
        }
    }

    /// Modification stamp all payloads belong to.
    pub fn stamp(&self) -> ModificationStamp {
        self.stamp
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    /// Whether the resource is a local file.
    pub fn is_fast_url(&self) -> bool {
        self.fast_url
    }

    /// Format of the decoded frames, once known.
    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn has_file(&self) -> bool {
        self.raw.is_some()
    }

    pub fn has_frames(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn has_thumbnail(&self) -> bool {
        self.thumbnail.is_some()
    }

    pub fn is_jpeg(&self) -> bool {
        self.format == Some(ImageFormat::Jpeg)
    }

    /// Bytes held by the encoded payload.
    pub fn file_size(&self) -> usize {
        self.raw.as_ref().map_or(0, Bytes::len)
    }

    /// Bytes held by decoded frames.
    pub fn frames_size(&self) -> usize {
        self.frames.iter().map(DecodedFrame::byte_size).sum()
    }

    /// Bytes held by the thumbnail.
    pub fn thumbnail_size(&self) -> usize {
        self.thumbnail
            .as_ref()
            .map_or(0, |t| t.width() as usize * t.height() as usize * 4)
    }

    /// Accounted size, never below [`MIN_ENTRY_SIZE`].
    pub fn size(&self) -> usize {
        (self.file_size() + self.frames_size() + self.thumbnail_size()).max(MIN_ENTRY_SIZE)
    }

    /// No payload left; the cache drops such entries.
    pub fn is_empty(&self) -> bool {
        self.raw.is_none() && self.frames.is_empty() && self.thumbnail.is_none()
    }

    /// Drop the payload that is cheapest to regenerate. Returns false when
    /// nothing can be dropped short of removing the whole entry.
    pub fn reduce_size(&mut self) -> bool {
        if self.raw.is_some() && self.fast_url && !self.frames.is_empty() {
            self.raw = None;
            return true;
        }
        if self.thumbnail.is_some() {
            self.thumbnail = None;
            return true;
        }
        if self.raw.is_some() && !self.frames.is_empty() {
            // Slow source. JPEG bytes are kept for lossless edits; otherwise
            // keep the bytes unless they outweigh the decoded image.
            if self.is_jpeg() || self.file_size() > self.frames_size() {
                self.frames.clear();
            } else {
                self.raw = None;
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: u32, h: u32) -> DecodedFrame {
        DecodedFrame::still(RgbaImage::new(w, h))
    }

    fn entry(fast: bool, format: ImageFormat) -> CacheEntry {
        let mut e = CacheEntry::new(ModificationStamp(1), fast);
        e.format = Some(format);
        e
    }

    #[test]
    fn test_size_floor() {
        let e = CacheEntry::new(ModificationStamp(1), true);
        assert_eq!(e.size(), MIN_ENTRY_SIZE);
        assert!(e.is_empty());
    }

    #[test]
    fn test_local_jpeg_drops_bytes_before_frames() {
        let mut e = entry(true, ImageFormat::Jpeg);
        e.raw = Some(Bytes::from(vec![0u8; 5_000]));
        e.frames = vec![frame(100, 100)];

        assert!(e.reduce_size());
        assert!(!e.has_file());
        assert!(e.has_frames());
    }

    #[test]
    fn test_reduce_order_is_monotonic() {
        let mut e = entry(true, ImageFormat::Png);
        e.raw = Some(Bytes::from(vec![0u8; 1_000]));
        e.frames = vec![frame(50, 50)];
        e.thumbnail = Some(Arc::new(RgbaImage::new(8, 8)));

        let mut sizes = vec![e.size()];
        while e.reduce_size() {
            sizes.push(e.size());
        }
        // bytes, then thumbnail; frames alone cannot be partially reduced
        assert_eq!(sizes.len(), 3);
        assert!(sizes.windows(2).all(|w| w[1] < w[0]));
        assert!(e.has_frames() && !e.has_file() && !e.has_thumbnail());
    }

    #[test]
    fn test_remote_jpeg_drops_frames() {
        let mut e = entry(false, ImageFormat::Jpeg);
        e.raw = Some(Bytes::from(vec![0u8; 100_000]));
        e.frames = vec![frame(10, 10)];

        assert!(e.reduce_size());
        assert!(e.has_file());
        assert!(!e.has_frames());
    }

    #[test]
    fn test_remote_png_with_oversized_bytes_drops_frames() {
        // 100 000 bytes against a 400-byte decode.
        let mut e = entry(false, ImageFormat::Png);
        e.raw = Some(Bytes::from(vec![0u8; 100_000]));
        e.frames = vec![frame(10, 10)];
        assert!(e.reduce_size());
        assert!(e.has_file());
        assert!(!e.has_frames());
    }

    #[test]
    fn test_remote_png_with_compact_bytes_drops_bytes() {
        let mut e = entry(false, ImageFormat::Png);
        e.raw = Some(Bytes::from(vec![0u8; 30_000]));
        e.frames = vec![frame(100, 100)];
        assert!(e.reduce_size());
        assert!(!e.has_file());
        assert!(e.has_frames());
    }

    #[test]
    fn test_lone_payload_cannot_reduce() {
        let mut e = entry(false, ImageFormat::Png);
        e.raw = Some(Bytes::from_static(b"abc"));
        assert!(!e.reduce_size());
        assert!(e.has_file());
    }
}
