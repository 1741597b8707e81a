//! Thumbnail generation using the image crate.
//!
//! JPEG files carrying a large enough EXIF preview skip the full decode.
//! Everything else is decoded and scaled down to fit the requested box.

use std::io::Cursor;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat, ImageReader, Rgba, RgbaImage};
use once_cell::sync::Lazy;
use tracing::{debug, trace};

use super::ThumbnailError;
use crate::cache::Pixmap;
use crate::decode::{CancelFlag, CancellableReader, DecodeError};
use crate::orientation::{embedded_thumbnail, exif_orientation, Orientation};
use crate::resource::Size;

/// Side of the placeholder shown for items that could not be thumbnailed.
const BROKEN_SIZE: u32 = 48;

static BROKEN: Lazy<Pixmap> = Lazy::new(|| Arc::new(draw_broken(BROKEN_SIZE)));

/// Generated thumbnail with the dimensions of the image it came from.
#[derive(Debug, Clone)]
pub struct GeneratedThumbnail {
    pub image: RgbaImage,
    /// Original size, after orientation.
    pub source_size: Size,
    pub format: ImageFormat,
    /// Produced from the EXIF preview rather than the full image.
    pub from_embedded: bool,
}

/// Stateless thumbnail producer. Runs on the thumbnail worker.
pub struct ThumbnailGenerator;

impl ThumbnailGenerator {
    /// Thumbnail of encoded `bytes` fitting in a `pixel_size` square.
    pub fn generate(
        bytes: &[u8],
        pixel_size: u32,
        auto_rotate: bool,
        cancel: &CancelFlag,
    ) -> Result<GeneratedThumbnail, ThumbnailError> {
        let format = image::guess_format(bytes).map_err(|_| DecodeError::Unsupported)?;
        let orientation = match (auto_rotate, format) {
            (true, ImageFormat::Jpeg) => exif_orientation(bytes).unwrap_or(Orientation::IDENTITY),
            _ => Orientation::IDENTITY,
        };

        if format == ImageFormat::Jpeg {
            if let Some(thumb) = Self::from_embedded(bytes, pixel_size, orientation) {
                return Ok(thumb);
            }
        }

        let mut reader = ImageReader::new(CancellableReader::new(Cursor::new(bytes), cancel.clone()));
        reader.set_format(format);
        let img = reader.decode().map_err(|e| {
            if cancel.is_cancelled() {
                DecodeError::Cancelled
            } else {
                DecodeError::Corrupt(e.to_string())
            }
        })?;

        let (src_width, src_height) = img.dimensions();
        let (width, height) = Self::calculate_dimensions(src_width, src_height, pixel_size);
        trace!(src_width, src_height, width, height, "Scaling thumbnail");
        let scaled = if (width, height) == (src_width, src_height) {
            img
        } else {
            img.resize_exact(width, height, FilterType::Triangle)
        };
        let image = orientation.apply(scaled).to_rgba8();

        Ok(GeneratedThumbnail {
            image,
            source_size: oriented_size(src_width, src_height, orientation),
            format,
            from_embedded: false,
        })
    }

    /// Use the EXIF preview when it is at least `pixel_size` on its long side.
    fn from_embedded(
        bytes: &[u8],
        pixel_size: u32,
        orientation: Orientation,
    ) -> Option<GeneratedThumbnail> {
        let preview = embedded_thumbnail(bytes)?;
        let img = image::load_from_memory_with_format(&preview, ImageFormat::Jpeg).ok()?;
        let (width, height) = img.dimensions();
        if width.max(height) < pixel_size {
            trace!(width, height, pixel_size, "Embedded thumbnail too small");
            return None;
        }

        let mut source = ImageReader::new(Cursor::new(bytes));
        source.set_format(ImageFormat::Jpeg);
        let (src_width, src_height) = source.into_dimensions().ok()?;

        let (w, h) = Self::calculate_dimensions(width, height, pixel_size);
        let scaled = if (w, h) == (width, height) {
            img
        } else {
            img.resize_exact(w, h, FilterType::Triangle)
        };
        debug!(width, height, "Using embedded thumbnail");
        Some(GeneratedThumbnail {
            image: orientation.apply(scaled).to_rgba8(),
            source_size: oriented_size(src_width, src_height, orientation),
            format: ImageFormat::Jpeg,
            from_embedded: true,
        })
    }

    /// Fit `src` in a `box_size` square, preserving aspect ratio. Never upscales.
    pub fn calculate_dimensions(src_width: u32, src_height: u32, box_size: u32) -> (u32, u32) {
        if src_width == 0 || src_height == 0 {
            return (box_size.max(1), box_size.max(1));
        }
        let longest = src_width.max(src_height);
        if longest <= box_size {
            return (src_width, src_height);
        }
        let scale = box_size as f64 / longest as f64;
        let width = (src_width as f64 * scale).round() as u32;
        let height = (src_height as f64 * scale).round() as u32;
        (width.max(1), height.max(1))
    }

    /// Shrink an already small image (e.g. one loaded from disk) to `pixel_size`.
    pub fn fit(image: RgbaImage, pixel_size: u32) -> RgbaImage {
        let (width, height) = Self::calculate_dimensions(image.width(), image.height(), pixel_size);
        if (width, height) == image.dimensions() {
            image
        } else {
            image::imageops::resize(&image, width, height, FilterType::Triangle)
        }
    }

    /// Placeholder for items whose thumbnail could not be produced.
    pub fn broken() -> Pixmap {
        Arc::clone(&BROKEN)
    }
}

fn oriented_size(width: u32, height: u32, orientation: Orientation) -> Size {
    if orientation.swaps_axes() {
        Size::new(height, width)
    } else {
        Size::new(width, height)
    }
}

/// Grey tile with a red cross.
fn draw_broken(size: u32) -> RgbaImage {
    let mut img = RgbaImage::from_pixel(size, size, Rgba([200, 200, 200, 255]));
    let margin = size / 4;
    for i in margin..size - margin {
        for t in 0..2 {
            let j = (i + t).min(size - 1);
            img.put_pixel(i, j, Rgba([200, 30, 30, 255]));
            img.put_pixel(size - 1 - i, j, Rgba([200, 30, 30, 255]));
        }
    }
    img
}
