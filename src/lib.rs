//! Image acquisition and caching core for an image viewer.
//!
//! - `loader` - Shared asynchronous loaders with progressive decoding
//! - `cache` - Cost-weighted cache of bytes, frames and thumbnails
//! - `thumbnails` - Viewport-ordered thumbnail jobs with a disk store
//! - `busy_level` - Cooperative priorities that pause background work
//! - `document` - State of the image being viewed

pub mod app;
pub mod busy_level;
pub mod cache;
pub mod config;
pub mod decode;
pub mod document;
pub mod loader;
pub mod orientation;
pub mod resource;
pub mod source;
pub mod thumbnails;
pub mod worker;

#[cfg(test)]
mod testing;

pub use app::{AppContext, AppContextBuilder};
pub use busy_level::{BusyLevel, BusyLevelGuard, BusyLevelManager};
pub use cache::ContentCache;
pub use config::CoreConfig;
pub use document::{Document, DocumentState};
pub use loader::{LoadStatus, LoaderEvent, LoaderHandle};
pub use resource::{ModificationStamp, Rect, ResourceKey, Size};
