//! On-disk thumbnail store shared with other desktop applications.
//!
//! - Layout: `<root>/normal/` (128 px) and `<root>/large/` (256 px)
//! - Filename: MD5 of the normalized resource URI, as lowercase hex, plus `.png`
//! - Metadata: PNG text chunks (`Thumb::URI`, `Thumb::MTime`, ...)
//!
//! A stored thumbnail is only valid while its URI and MTime match the
//! original resource.

use std::fs;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{ImageFormat, RgbaImage};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::resource::{ModificationStamp, ResourceKey, Size};

const KEY_URI: &str = "Thumb::URI";
const KEY_MTIME: &str = "Thumb::MTime";
const KEY_SIZE: &str = "Thumb::Size";
const KEY_MIMETYPE: &str = "Thumb::Mimetype";
const KEY_WIDTH: &str = "Thumb::Image::Width";
const KEY_HEIGHT: &str = "Thumb::Image::Height";
const KEY_SOFTWARE: &str = "Software";

const SOFTWARE: &str = concat!("pixcache ", env!("CARGO_PKG_VERSION"));

/// Size class of a stored thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThumbnailSize {
    Normal,
    Large,
}

impl ThumbnailSize {
    pub const ALL: [ThumbnailSize; 2] = [ThumbnailSize::Normal, ThumbnailSize::Large];

    /// Smallest class that holds thumbnails of `pixel_size`.
    pub fn for_pixel_size(pixel_size: u32) -> Self {
        if pixel_size <= ThumbnailSize::Normal.pixel_size() {
            ThumbnailSize::Normal
        } else {
            ThumbnailSize::Large
        }
    }

    /// Longest side of thumbnails in this class.
    pub fn pixel_size(self) -> u32 {
        match self {
            ThumbnailSize::Normal => 128,
            ThumbnailSize::Large => 256,
        }
    }

    /// Subdirectory of the thumbnail root holding this class.
    pub fn dir_name(self) -> &'static str {
        match self {
            ThumbnailSize::Normal => "normal",
            ThumbnailSize::Large => "large",
        }
    }
}

/// Facts about the original resource recorded next to its thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailMeta {
    pub uri: String,
    pub mtime: ModificationStamp,
    pub file_size: u64,
    pub mimetype: Option<String>,
    /// Dimensions of the original image.
    pub image_size: Size,
}

impl ThumbnailMeta {
    /// Metadata identifying the original of a thumbnail.
    pub fn new(key: &ResourceKey, mtime: ModificationStamp, file_size: u64) -> Self {
        Self {
            uri: key.thumbnail_uri(),
            mtime,
            file_size,
            mimetype: None,
            image_size: Size::default(),
        }
    }

    /// Record the original's MIME type.
    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.mimetype = Some(format.to_mime_type().to_string());
        self
    }

    /// Record the original's dimensions.
    pub fn with_image_size(mut self, size: Size) -> Self {
        self.image_size = size;
        self
    }
}

/// Thumbnail read back from disk.
#[derive(Debug, Clone)]
pub struct StoredThumbnail {
    pub image: RgbaImage,
    /// Original image dimensions, when the writer recorded them.
    pub source_size: Size,
}

impl StoredThumbnail {
    /// Whether the image is big enough to show at `pixel_size`. A smaller
    /// image only qualifies when the original itself was that small.
    pub fn covers(&self, pixel_size: u32) -> bool {
        let long_side = self.image.width().max(self.image.height());
        let wanted = match self.source_size.max_side() {
            0 => pixel_size,
            source => source.min(pixel_size),
        };
        long_side >= wanted
    }
}

/// Thumbnail directory rooted at e.g. `$XDG_CACHE_HOME/thumbnails`.
#[derive(Debug, Clone)]
pub struct ThumbnailStore {
    root: PathBuf,
}

impl ThumbnailStore {
    /// Store rooted at `root`; directories are created on first write.
    pub fn new(root: PathBuf) -> Self {
        debug!(?root, "Initialized thumbnail store");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name for `key`, independent of size class.
    pub fn file_name(key: &ResourceKey) -> String {
        format!("{:x}.png", md5::compute(key.thumbnail_uri().as_bytes()))
    }

    /// Where the thumbnail of `key` lives for `size`.
    pub fn path(&self, key: &ResourceKey, size: ThumbnailSize) -> PathBuf {
        self.root.join(size.dir_name()).join(Self::file_name(key))
    }

    /// Load the thumbnail of `key` if one exists for modification time `mtime`.
    /// Stale or foreign files count as missing.
    pub fn load(
        &self,
        key: &ResourceKey,
        size: ThumbnailSize,
        mtime: ModificationStamp,
    ) -> Result<Option<StoredThumbnail>> {
        let path = self.path(key, size);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read thumbnail: {:?}", path)),
        };

        let text = read_text_chunks(&data).with_context(|| format!("Bad thumbnail: {:?}", path))?;
        let lookup = |k: &str| text.iter().find(|(name, _)| name == k).map(|(_, v)| v.as_str());

        if lookup(KEY_URI) != Some(key.thumbnail_uri().as_str()) {
            trace!(?path, "Thumbnail URI mismatch");
            return Ok(None);
        }
        let stored_mtime = lookup(KEY_MTIME).and_then(|v| v.trim().parse::<i64>().ok());
        if stored_mtime != Some(mtime.secs()) {
            trace!(?path, ?stored_mtime, "Thumbnail is stale");
            return Ok(None);
        }

        let image = image::load_from_memory_with_format(&data, ImageFormat::Png)
            .with_context(|| format!("Failed to decode thumbnail: {:?}", path))?
            .to_rgba8();
        let source_size = Size::new(
            lookup(KEY_WIDTH).and_then(|v| v.parse().ok()).unwrap_or(0),
            lookup(KEY_HEIGHT).and_then(|v| v.parse().ok()).unwrap_or(0),
        );

        trace!(?path, "Loaded thumbnail from disk");
        Ok(Some(StoredThumbnail { image, source_size }))
    }

    /// Write `image` for `key`. The file appears atomically.
    pub fn store(
        &self,
        key: &ResourceKey,
        size: ThumbnailSize,
        image: &RgbaImage,
        meta: &ThumbnailMeta,
    ) -> Result<PathBuf> {
        let dir = self.root.join(size.dir_name());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create thumbnail directory: {:?}", dir))?;

        let mut tmp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
        let mut out = BufWriter::new(tmp.as_file_mut());
        write_png(&mut out, image, meta)?;
        out.flush().context("Failed to flush thumbnail")?;
        drop(out);

        let path = self.path(key, size);
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to save thumbnail: {:?}", path))?;

        debug!(?path, "Saved thumbnail");
        Ok(path)
    }

    /// Delete every size class of `key`'s thumbnail. Returns whether
    /// anything was removed.
    pub fn remove(&self, key: &ResourceKey) -> Result<bool> {
        let mut removed = false;
        for size in ThumbnailSize::ALL {
            let path = self.path(key, size);
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to remove {:?}", path)),
            }
        }
        Ok(removed)
    }
}

fn write_png<W: Write>(writer: W, image: &RgbaImage, meta: &ThumbnailMeta) -> Result<()> {
    let mut encoder = png::Encoder::new(writer, image.width(), image.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);

    let mut text = vec![
        (KEY_URI, meta.uri.clone()),
        (KEY_MTIME, meta.mtime.secs().to_string()),
        (KEY_SIZE, meta.file_size.to_string()),
        (KEY_SOFTWARE, SOFTWARE.to_string()),
    ];
    if let Some(mime) = &meta.mimetype {
        text.push((KEY_MIMETYPE, mime.clone()));
    }
    if !meta.image_size.is_empty() {
        text.push((KEY_WIDTH, meta.image_size.width.to_string()));
        text.push((KEY_HEIGHT, meta.image_size.height.to_string()));
    }
    for (keyword, value) in text {
        encoder
            .add_text_chunk(keyword.to_string(), value)
            .context("Failed to add thumbnail metadata")?;
    }

    let mut writer = encoder.write_header().context("Failed to write PNG header")?;
    writer
        .write_image_data(image.as_raw())
        .context("Failed to write thumbnail pixels")?;
    writer.finish().context("Failed to finish thumbnail")?;
    Ok(())
}

fn read_text_chunks(data: &[u8]) -> Result<Vec<(String, String)>> {
    let reader = png::Decoder::new(Cursor::new(data))
        .read_info()
        .context("Not a PNG file")?;
    let info = reader.info();
    let chunks: Vec<(String, String)> = info
        .uncompressed_latin1_text
        .iter()
        .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
        .collect();
    if chunks.is_empty() {
        bail!("PNG carries no thumbnail metadata");
    }
    Ok(chunks)
}
