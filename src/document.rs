//! The image currently shown to the user, as a tagged state machine driven by
//! loader events.

use std::sync::Arc;

use bytes::Bytes;
use image::ImageFormat;
use tracing::debug;

use crate::app::AppContext;
use crate::busy_level::BusyLevel;
use crate::cache::ContentCache;
use crate::decode::{ContentKind, DecodedFrame};
use crate::loader::{LoadStatus, LoaderEvent, LoaderHandle};
use crate::resource::{ResourceKey, Size};

/// Where the viewed document is in its life.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentState {
    Empty,
    Loading {
        format: Option<ImageFormat>,
        size: Option<Size>,
    },
    LoadedStatic {
        size: Size,
        format: ImageFormat,
    },
    LoadedAnimated {
        size: Size,
        frame_count: usize,
    },
    /// JPEG with its encoded bytes kept for lossless edits.
    LoadedJpeg {
        size: Size,
    },
    NonImage,
    Failed(String),
}

/// What a successful load produced, consulted when the load finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub size: Size,
    pub format: Option<ImageFormat>,
    pub frame_count: usize,
    pub has_raw: bool,
}

impl DocumentState {
    /// Frames are available.
    pub fn is_loaded(&self) -> bool {
        matches!(
            self,
            DocumentState::LoadedStatic { .. }
                | DocumentState::LoadedAnimated { .. }
                | DocumentState::LoadedJpeg { .. }
        )
    }

    /// No further loader event changes this state.
    pub fn is_terminal(&self) -> bool {
        self.is_loaded() || matches!(self, DocumentState::NonImage | DocumentState::Failed(_))
    }

    /// State after `event`. Terminal states absorb everything.
    pub fn next(&self, event: &LoaderEvent, summary: Option<&LoadSummary>) -> DocumentState {
        use DocumentState::*;

        if self.is_terminal() {
            return self.clone();
        }
        let (format, size) = match self {
            Loading { format, size } => (*format, *size),
            _ => (None, None),
        };

        match event {
            LoaderEvent::KindDetermined(ContentKind::NonImage) => NonImage,
            LoaderEvent::KindDetermined(ContentKind::Raster(f)) => Loading {
                format: Some(*f),
                size,
            },
            LoaderEvent::SizeDetermined(s) => Loading {
                format,
                size: Some(*s),
            },
            LoaderEvent::ImageChanged(_) => Loading { format, size },
            LoaderEvent::Finished(LoadStatus::NotAnImage) => NonImage,
            LoaderEvent::Finished(LoadStatus::Failed(message)) => Failed(message.clone()),
            LoaderEvent::Finished(LoadStatus::Loaded) => match summary {
                None => Failed("load finished without frames".into()),
                Some(s) if s.frame_count == 0 => Failed("load finished without frames".into()),
                Some(s) if s.frame_count > 1 => LoadedAnimated {
                    size: s.size,
                    frame_count: s.frame_count,
                },
                Some(s) if s.format == Some(ImageFormat::Jpeg) && s.has_raw => {
                    LoadedJpeg { size: s.size }
                }
                Some(s) => LoadedStatic {
                    size: s.size,
                    format: s.format.or(format).unwrap_or(ImageFormat::Png),
                },
            },
        }
    }
}

/// A loader observer that tracks the document's state. Pins the resource in
/// the cache while open.
pub struct Document {
    loader: LoaderHandle,
    cache: ContentCache,
    state: DocumentState,
}

impl Document {
    /// Start loading `key` at [`BusyLevel::Loading`] and pin it in the cache.
    pub fn open(ctx: &Arc<AppContext>, key: &ResourceKey) -> Self {
        ctx.cache().set_priority_key(key, true);
        Self {
            loader: ctx.loader(key, BusyLevel::Loading),
            cache: ctx.cache().clone(),
            state: DocumentState::Empty,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        self.loader.key()
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    /// Underlying loader subscription.
    pub fn loader(&self) -> &LoaderHandle {
        &self.loader
    }

    /// Apply the next loader event. `None` once the load is over.
    pub async fn advance(&mut self) -> Option<&DocumentState> {
        if self.state.is_terminal() {
            return None;
        }
        let event = self.loader.next_event().await?;
        let summary = matches!(event, LoaderEvent::Finished(LoadStatus::Loaded)).then(|| LoadSummary {
            size: self.loader.size().unwrap_or_default(),
            format: self.loader.format(),
            frame_count: self.loader.frames().len(),
            has_raw: self.loader.raw_data().is_some(),
        });
        let next = self.state.next(&event, summary.as_ref());
        if next != self.state {
            debug!(key = %self.key(), state = ?next, "Document state changed");
        }
        self.state = next;
        Some(&self.state)
    }

    /// Run the load to a terminal state.
    pub async fn wait_loaded(&mut self) -> &DocumentState {
        while self.advance().await.is_some() {}
        if !self.state.is_terminal() {
            self.state = DocumentState::Failed("loader dropped".into());
        }
        &self.state
    }

    /// Decoded frames, empty until loaded.
    pub fn frames(&self) -> Vec<DecodedFrame> {
        if self.state.is_loaded() {
            self.loader.frames()
        } else {
            Vec::new()
        }
    }

    /// Encoded bytes, only kept for JPEG documents.
    pub fn raw_data(&self) -> Option<Bytes> {
        match self.state {
            DocumentState::LoadedJpeg { .. } => self.loader.raw_data(),
            _ => None,
        }
    }

    /// Image size once announced.
    pub fn size(&self) -> Option<Size> {
        match &self.state {
            DocumentState::Loading { size, .. } => *size,
            DocumentState::LoadedStatic { size, .. }
            | DocumentState::LoadedAnimated { size, .. }
            | DocumentState::LoadedJpeg { size } => Some(*size),
            _ => None,
        }
    }

    /// Drop the cached copy after the file was overwritten.
    pub fn invalidate(&self) {
        self.cache.invalidate(self.key());
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        self.cache.set_priority_key(self.loader.key(), false);
    }
}
