//! Format decoding behind a narrow "bytes in, frames out" contract.
//!
//! The loader only talks to [`ImageDecoder`]. [`StandardDecoder`] backs it
//! with the `image` crate; embedders may plug in their own.

use std::io::{self, BufRead, Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, ImageFormat, ImageReader, RgbaImage};
use thiserror::Error;
use tracing::{debug, trace};

use crate::orientation::exif_orientation;
use crate::resource::{Rect, Size};

const BYTES_PER_PIXEL: usize = 4;

/// Why a buffer could not be turned into frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unrecognized image data")]
    Unsupported,
    #[error("corrupt image data: {0}")]
    Corrupt(String),
    #[error("image has no frames")]
    NoFrames,
    #[error("decode cancelled")]
    Cancelled,
}

/// One raster frame. More than one frame means animation.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub image: Arc<RgbaImage>,
    /// How long the frame stays on screen; zero for still images.
    pub delay: Duration,
}

impl DecodedFrame {
    /// Frame of a still image, without delay.
    pub fn still(image: RgbaImage) -> Self {
        Self {
            image: Arc::new(image),
            delay: Duration::ZERO,
        }
    }

    /// Pixel dimensions of the frame.
    pub fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }

    /// Memory used by the pixels.
    pub fn byte_size(&self) -> usize {
        self.image.width() as usize * self.image.height() as usize * BYTES_PER_PIXEL
    }
}

/// Every frame of a decoded resource.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub frames: Vec<DecodedFrame>,
    pub format: ImageFormat,
}

impl DecodedImage {
    /// Size of the first frame.
    pub fn size(&self) -> Size {
        self.frames.first().map(DecodedFrame::size).unwrap_or_default()
    }

    pub fn is_animated(&self) -> bool {
        self.frames.len() > 1
    }
}

/// What the first bytes of a resource say about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Raster(ImageFormat),
    NonImage,
}

/// Knobs applied while decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Apply EXIF orientation to JPEG data.
    pub auto_rotate: bool,
}

/// Cooperative cancellation shared between a task and a decode worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this flag to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Reader that reports end-of-stream once its flag is cancelled, so a codec
/// stops at its next read instead of finishing the whole image.
pub struct CancellableReader<R> {
    inner: R,
    cancel: CancelFlag,
}

impl<R> CancellableReader<R> {
    pub fn new(inner: R, cancel: CancelFlag) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Ok(0);
        }
        self.inner.read(buf)
    }
}

impl<R: BufRead> BufRead for CancellableReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.cancel.is_cancelled() {
            return Ok(&[]);
        }
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

impl<R: Seek> Seek for CancellableReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Result of feeding one chunk to an [`IncrementalDecoder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalProgress {
    /// Full image size, reported as soon as the header has been parsed.
    pub size: Option<Size>,
    /// Pixels that became available with this chunk.
    pub updated: Option<Rect>,
    /// The decoder cannot go on progressively; finish on the threaded path.
    pub needs_threaded: bool,
    /// All frames are decoded; call [`IncrementalDecoder::finish`].
    pub complete: bool,
}

/// Progressive decoder fed with bytes as they arrive.
pub trait IncrementalDecoder: Send {
    fn feed(&mut self, chunk: &[u8]) -> Result<IncrementalProgress, DecodeError>;

    /// Canvas with everything decoded so far.
    fn partial(&self) -> Option<Arc<RgbaImage>>;

    fn finish(&mut self) -> Result<DecodedImage, DecodeError>;
}

/// Decoding backend used by loaders.
pub trait ImageDecoder: Send + Sync {
    fn sniff(&self, head: &[u8]) -> ContentKind;

    /// Decode a complete buffer. Runs on a worker thread.
    fn decode(
        &self,
        bytes: &[u8],
        options: DecodeOptions,
        cancel: &CancelFlag,
    ) -> Result<DecodedImage, DecodeError>;

    /// Progressive decoder for `format`, if this backend has one. Sizes it
    /// reports early honour `options`, like the final decode does.
    fn incremental(
        &self,
        format: ImageFormat,
        options: DecodeOptions,
    ) -> Option<Box<dyn IncrementalDecoder>>;
}

/// Decoder backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDecoder;

impl StandardDecoder {
    fn decode_gif(bytes: &[u8], cancel: &CancelFlag) -> Result<Vec<DecodedFrame>, DecodeError> {
        let reader = CancellableReader::new(Cursor::new(bytes), cancel.clone());
        let decoder = GifDecoder::new(reader).map_err(|e| corrupt_or_cancelled(e, cancel))?;

        let mut frames = Vec::new();
        for frame in decoder.into_frames() {
            let frame = frame.map_err(|e| corrupt_or_cancelled(e, cancel))?;
            let (numer, denom) = frame.delay().numer_denom_ms();
            let delay_ms = if denom == 0 { 0 } else { numer / denom };
            frames.push(DecodedFrame {
                image: Arc::new(frame.into_buffer()),
                delay: Duration::from_millis(delay_ms as u64),
            });
        }
        if cancel.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }
        if frames.is_empty() {
            return Err(DecodeError::NoFrames);
        }
        Ok(frames)
    }

    fn decode_still(
        bytes: &[u8],
        format: ImageFormat,
        cancel: &CancelFlag,
    ) -> Result<DynamicImage, DecodeError> {
        let mut reader = ImageReader::new(CancellableReader::new(Cursor::new(bytes), cancel.clone()));
        reader.set_format(format);
        reader.decode().map_err(|e| corrupt_or_cancelled(e, cancel))
    }
}

impl ImageDecoder for StandardDecoder {
    fn sniff(&self, head: &[u8]) -> ContentKind {
        match image::guess_format(head) {
            Ok(format) => ContentKind::Raster(format),
            Err(_) => ContentKind::NonImage,
        }
    }

    fn decode(
        &self,
        bytes: &[u8],
        options: DecodeOptions,
        cancel: &CancelFlag,
    ) -> Result<DecodedImage, DecodeError> {
        let format = image::guess_format(bytes).map_err(|_| DecodeError::Unsupported)?;
        trace!(?format, len = bytes.len(), "Threaded decode");

        if format == ImageFormat::Gif {
            let frames = Self::decode_gif(bytes, cancel)?;
            return Ok(DecodedImage { frames, format });
        }

        let mut img = Self::decode_still(bytes, format, cancel)?;
        if options.auto_rotate && format == ImageFormat::Jpeg {
            if let Some(orientation) = exif_orientation(bytes) {
                debug!(orientation = orientation.value(), "Applying EXIF orientation");
                img = orientation.apply(img);
            }
        }

        Ok(DecodedImage {
            frames: vec![DecodedFrame::still(img.to_rgba8())],
            format,
        })
    }

    fn incremental(
        &self,
        format: ImageFormat,
        options: DecodeOptions,
    ) -> Option<Box<dyn IncrementalDecoder>> {
        Some(Box::new(HeaderScan::new(format, options.auto_rotate)))
    }
}

fn corrupt_or_cancelled(err: image::ImageError, cancel: &CancelFlag) -> DecodeError {
    if cancel.is_cancelled() {
        DecodeError::Cancelled
    } else {
        DecodeError::Corrupt(err.to_string())
    }
}

/// Progressive front-end for formats the `image` crate only decodes whole:
/// announces the size once the header is in, then asks for the threaded path.
struct HeaderScan {
    format: ImageFormat,
    auto_rotate: bool,
    buffer: Vec<u8>,
}

impl HeaderScan {
    fn new(format: ImageFormat, auto_rotate: bool) -> Self {
        Self {
            format,
            auto_rotate,
            buffer: Vec::new(),
        }
    }

    /// Header size as the decoded image will have it.
    fn oriented(&self, width: u32, height: u32) -> Size {
        // APP1 precedes the frame header, so the EXIF block is buffered by now.
        let swap = self.auto_rotate
            && self.format == ImageFormat::Jpeg
            && exif_orientation(&self.buffer).is_some_and(|o| o.swaps_axes());
        if swap {
            Size::new(height, width)
        } else {
            Size::new(width, height)
        }
    }
}

impl IncrementalDecoder for HeaderScan {
    fn feed(&mut self, chunk: &[u8]) -> Result<IncrementalProgress, DecodeError> {
        self.buffer.extend_from_slice(chunk);
        let mut reader = ImageReader::new(Cursor::new(&self.buffer[..]));
        reader.set_format(self.format);
        match reader.into_dimensions() {
            Ok((width, height)) => Ok(IncrementalProgress {
                size: Some(self.oriented(width, height)),
                needs_threaded: true,
                ..Default::default()
            }),
            // Header not complete yet.
            Err(_) => Ok(IncrementalProgress::default()),
        }
    }

    fn partial(&self) -> Option<Arc<RgbaImage>> {
        None
    }

    fn finish(&mut self) -> Result<DecodedImage, DecodeError> {
        Err(DecodeError::Unsupported)
    }
}
