use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::busy_level::{BusyLevel, BusyLevelManager};
use crate::cache::{ContentCache, EvictionPolicy};
use crate::config::CoreConfig;
use crate::decode::{DecodeOptions, ImageDecoder, StandardDecoder};
use crate::document::Document;
use crate::loader::{self, LoaderHandle, LoaderRegistry};
use crate::resource::ResourceKey;
use crate::source::{LocalSource, ResourceSource};
use crate::thumbnails::{PreviewProvider, ThumbnailJob, ThumbnailStore};
use crate::worker::WorkerPool;

/// Services shared by loaders, documents and thumbnail jobs. One per
/// application; tests build a fresh one each.
pub struct AppContext {
    config: RwLock<CoreConfig>,
    cache: ContentCache,
    busy: Arc<BusyLevelManager>,
    registry: LoaderRegistry,
    source: Arc<dyn ResourceSource>,
    decoder: Arc<dyn ImageDecoder>,
    decode_pool: WorkerPool,
    thumbnail_pool: WorkerPool,
    thumbnail_store: RwLock<Option<ThumbnailStore>>,
    previewer: Option<Arc<dyn PreviewProvider>>,
}

impl AppContext {
    /// Context over the local filesystem with the default decoder.
    pub fn new(config: CoreConfig) -> Arc<Self> {
        AppContextBuilder::new(config).build()
    }

    /// Context configured from `PIXCACHE_*` environment variables.
    pub fn from_env() -> Arc<Self> {
        Self::new(CoreConfig::from_env())
    }

    /// Snapshot of the options currently in effect.
    pub fn config(&self) -> CoreConfig {
        self.config.read().clone()
    }

    /// Swap in new options, resizing the cache and dropping thumbnails of a
    /// different size.
    pub fn apply_config(&self, config: CoreConfig) {
        self.cache.set_max_size(config.max_cache_size_bytes);
        self.cache.check_thumbnail_size(config.thumbnail_pixel_size);
        *self.thumbnail_store.write() = thumbnail_store_for(&config);
        debug!(?config, "Applied configuration");
        *self.config.write() = config;
    }

    /// Decode options derived from the current configuration.
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            auto_rotate: self.config.read().auto_rotate_images,
        }
    }

    /// Process-wide content cache.
    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Busy-level arbitration shared by loaders and thumbnail jobs.
    pub fn busy(&self) -> &Arc<BusyLevelManager> {
        &self.busy
    }

    /// Loaders currently in flight.
    pub fn registry(&self) -> &LoaderRegistry {
        &self.registry
    }

    /// Where resources are stated and fetched from.
    pub fn source(&self) -> &Arc<dyn ResourceSource> {
        &self.source
    }

    /// Backend used for sniffing and decoding.
    pub fn decoder(&self) -> &Arc<dyn ImageDecoder> {
        &self.decoder
    }

    /// Threads running the loaders' threaded decode path.
    pub fn decode_pool(&self) -> &WorkerPool {
        &self.decode_pool
    }

    /// Single thread generating and persisting thumbnails.
    pub fn thumbnail_pool(&self) -> &WorkerPool {
        &self.thumbnail_pool
    }

    /// On-disk store, when persisting thumbnails is enabled.
    pub fn thumbnail_store(&self) -> Option<ThumbnailStore> {
        self.thumbnail_store.read().clone()
    }

    /// Preview source for resources that are not raster images.
    pub fn previewer(&self) -> Option<&Arc<dyn PreviewProvider>> {
        self.previewer.as_ref()
    }

    /// Shared loader for `key`; joins the one in flight if any.
    pub fn loader(self: &Arc<Self>, key: &ResourceKey, priority: BusyLevel) -> LoaderHandle {
        loader::open(self, key, priority)
    }

    /// Open `key` as the document being viewed.
    pub fn open_document(self: &Arc<Self>, key: &ResourceKey) -> Document {
        Document::open(self, key)
    }

    /// Start thumbnailing `items`, focused on the first one.
    pub fn thumbnail_job(self: &Arc<Self>, items: Vec<ResourceKey>) -> ThumbnailJob {
        ThumbnailJob::spawn(Arc::clone(self), items)
    }
}

fn thumbnail_store_for(config: &CoreConfig) -> Option<ThumbnailStore> {
    if !config.store_thumbnails_on_disk {
        return None;
    }
    config.thumbnail_root.clone().map(ThumbnailStore::new)
}

/// Assembles an [`AppContext`], letting embedders and tests swap the
/// collaborators.
pub struct AppContextBuilder {
    config: CoreConfig,
    source: Option<Arc<dyn ResourceSource>>,
    decoder: Option<Arc<dyn ImageDecoder>>,
    previewer: Option<Arc<dyn PreviewProvider>>,
    eviction: Option<Box<dyn EvictionPolicy>>,
}

impl AppContextBuilder {
    /// Builder with the default collaborators.
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            source: None,
            decoder: None,
            previewer: None,
            eviction: None,
        }
    }

    /// Replace the local filesystem source.
    pub fn source(mut self, source: Arc<dyn ResourceSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the `image`-based decoder.
    pub fn decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Set the preview source for non-image resources.
    pub fn previewer(mut self, previewer: Arc<dyn PreviewProvider>) -> Self {
        self.previewer = Some(previewer);
        self
    }

    /// Replace the default cache scoring.
    pub fn eviction_policy(mut self, policy: Box<dyn EvictionPolicy>) -> Self {
        self.eviction = Some(policy);
        self
    }

    /// Create the context and start its worker pools.
    pub fn build(self) -> Arc<AppContext> {
        let config = self.config;
        let cache = match self.eviction {
            Some(policy) => ContentCache::with_policy(config.max_cache_size_bytes, policy),
            None => ContentCache::new(config.max_cache_size_bytes),
        };
        cache.check_thumbnail_size(config.thumbnail_pixel_size);

        info!(
            cache_mb = config.max_cache_size_bytes / (1024 * 1024),
            thumbnail_size = config.thumbnail_pixel_size,
            decode_workers = config.decode_workers,
            "Creating application context"
        );

        Arc::new(AppContext {
            cache,
            busy: BusyLevelManager::new(),
            registry: LoaderRegistry::new(),
            source: self.source.unwrap_or_else(|| Arc::new(LocalSource)),
            decoder: self.decoder.unwrap_or_else(|| Arc::new(StandardDecoder)),
            decode_pool: WorkerPool::new("decode", config.decode_workers),
            thumbnail_pool: WorkerPool::new("thumbnail", 1),
            thumbnail_store: RwLock::new(thumbnail_store_for(&config)),
            previewer: self.previewer,
            config: RwLock::new(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SizeOnlyCost;
    use crate::decode::tests::encode_solid;
    use crate::loader::LoadStatus;
    use image::ImageFormat;
    use tempfile::tempdir;

    #[test]
    fn test_disk_store_follows_config() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::new(CoreConfig::default().with_thumbnail_root(dir.path().to_path_buf()));
        assert_eq!(ctx.thumbnail_store().unwrap().root(), dir.path());

        ctx.apply_config(CoreConfig {
            store_thumbnails_on_disk: false,
            ..ctx.config()
        });
        assert!(ctx.thumbnail_store().is_none());
    }

    #[test]
    fn test_apply_config_resizes_cache() {
        let ctx = AppContextBuilder::new(CoreConfig::default())
            .eviction_policy(Box::new(SizeOnlyCost))
            .build();
        ctx.apply_config(CoreConfig {
            max_cache_size_bytes: 1024,
            auto_rotate_images: false,
            ..ctx.config()
        });
        assert_eq!(ctx.cache().max_size(), 1024);
        assert!(!ctx.decode_options().auto_rotate);
        assert_eq!(ctx.thumbnail_pool().worker_count(), 1);
    }

    #[tokio::test]
    async fn test_loads_local_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("local.gif");
        std::fs::write(&path, encode_solid(10, 20, ImageFormat::Gif)).unwrap();
        let key = ResourceKey::from_path(&path).unwrap();

        let ctx = AppContext::new(CoreConfig {
            store_thumbnails_on_disk: false,
            ..CoreConfig::default()
        });
        let handle = ctx.loader(&key, BusyLevel::Loading);
        assert_eq!(handle.wait_finished().await, LoadStatus::Loaded);
        assert_eq!(handle.format(), Some(ImageFormat::Gif));
        assert_eq!(handle.frames()[0].size(), crate::resource::Size::new(10, 20));
        assert!(ctx.cache().entry(&key).unwrap().is_fast_url());
    }
}
