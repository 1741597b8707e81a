//! EXIF helpers: orientation lookup and embedded JPEG thumbnail extraction.

use std::io::Cursor;

use image::DynamicImage;
use tracing::trace;

/// EXIF orientation tag value, 1..=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orientation(u16);

impl Orientation {
    pub const IDENTITY: Orientation = Orientation(1);

    /// Orientation for a raw tag value, `None` when out of range.
    pub fn from_exif(value: u16) -> Option<Self> {
        (1..=8).contains(&value).then_some(Self(value))
    }

    pub fn value(self) -> u16 {
        self.0
    }

    /// Whether applying this orientation swaps width and height.
    pub fn swaps_axes(self) -> bool {
        matches!(self.0, 5..=8)
    }

    /// Transform stored pixels into display orientation.
    pub fn apply(self, img: DynamicImage) -> DynamicImage {
        match self.0 {
            2 => img.fliph(),
            3 => img.rotate180(),
            4 => img.flipv(),
            5 => img.rotate90().fliph(),
            6 => img.rotate90(),
            7 => img.rotate270().fliph(),
            8 => img.rotate270(),
            _ => img,
        }
    }
}

fn read_exif(bytes: &[u8]) -> Option<exif::Exif> {
    let mut cursor = Cursor::new(bytes);
    exif::Reader::new().read_from_container(&mut cursor).ok()
}

/// Orientation stored in the primary image directory, if any.
pub fn exif_orientation(bytes: &[u8]) -> Option<Orientation> {
    let exif = read_exif(bytes)?;
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .and_then(|v| Orientation::from_exif(v as u16))
}

/// Encoded bytes of the JPEG thumbnail embedded in the EXIF block.
pub fn embedded_thumbnail(bytes: &[u8]) -> Option<Vec<u8>> {
    let exif = read_exif(bytes)?;
    let offset = exif
        .get_field(exif::Tag::JPEGInterchangeFormat, exif::In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    let len = exif
        .get_field(exif::Tag::JPEGInterchangeFormatLength, exif::In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    trace!(offset, len, "Found embedded EXIF thumbnail");

    // Offsets are relative to the TIFF header, which is what `buf()` holds.
    let end = offset.checked_add(len)?;
    exif.buf().get(offset..end).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    #[test]
    fn test_from_exif_range() {
        assert!(Orientation::from_exif(0).is_none());
        assert!(Orientation::from_exif(9).is_none());
        assert_eq!(Orientation::from_exif(6).unwrap().value(), 6);
    }

    #[test]
    fn test_rotate_swaps_dimensions() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(4, 2));
        let rotated = Orientation::from_exif(6).unwrap().apply(img);
        assert_eq!(rotated.dimensions(), (2, 4));
        assert!(Orientation::from_exif(6).unwrap().swaps_axes());
        assert!(!Orientation::from_exif(3).unwrap().swaps_axes());
    }

    #[test]
    fn test_flip_moves_pixels() {
        let mut buf = RgbaImage::new(2, 1);
        buf.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        let flipped = Orientation::from_exif(2)
            .unwrap()
            .apply(DynamicImage::ImageRgba8(buf))
            .to_rgba8();
        assert_eq!(flipped.get_pixel(1, 0), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_no_exif_in_garbage() {
        assert!(exif_orientation(b"definitely not a jpeg").is_none());
        assert!(embedded_thumbnail(b"definitely not a jpeg").is_none());
    }
}
