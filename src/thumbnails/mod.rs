//! Thumbnail pipeline.
//!
//! This module provides:
//! - `ThumbnailJob` - Batch job producing thumbnails in viewport order
//! - `WorkList` - Processing order around the focused item
//! - `ThumbnailGenerator` - Embedded-preview extraction and downscaling
//! - `ThumbnailStore` - Shared on-disk thumbnail directory

pub mod cache;
pub mod generator;
pub mod job;
pub mod queue;

use async_trait::async_trait;
use image::RgbaImage;
use thiserror::Error;

use crate::decode::DecodeError;
use crate::resource::ResourceKey;
use crate::source::SourceError;
use crate::worker::WorkerError;

pub use cache::{ThumbnailMeta, ThumbnailSize, ThumbnailStore};
pub use generator::{GeneratedThumbnail, ThumbnailGenerator};
pub use job::{ThumbnailEvent, ThumbnailJob, ThumbnailResult};
pub use queue::{PriorityWindow, WorkList};

/// Why an item got the broken placeholder.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("no preview available for {0}")]
    NoPreview(String),
}

/// Produces previews for resources that are not raster images (videos,
/// documents). Implemented outside the core.
#[async_trait]
pub trait PreviewProvider: Send + Sync {
    /// Preview fitting in a `pixel_size` square, or `None` if the resource
    /// has no visual representation.
    async fn preview(
        &self,
        key: &ResourceKey,
        pixel_size: u32,
    ) -> Result<Option<RgbaImage>, ThumbnailError>;
}
