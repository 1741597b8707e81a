//! Batch thumbnail job.
//!
//! One tokio task walks the [`WorkList`] and handles one item at a time:
//! stat, memory cache, disk store, then generation on the thumbnail worker.
//! Control messages (new items, removals, a new viewport) are applied while
//! an item is in flight; removing the in-flight item drops its pending
//! stat or fetch on the spot.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::generator::ThumbnailGenerator;
use super::queue::{PriorityWindow, WorkList};
use super::{ThumbnailError, ThumbnailMeta, ThumbnailSize};
use crate::app::AppContext;
use crate::busy_level::BusyLevel;
use crate::cache::Pixmap;
use crate::decode::{CancelFlag, ContentKind};
use crate::resource::{ModificationStamp, ResourceKey, Size};
use crate::source;

/// Thumbnail produced for one item.
#[derive(Debug, Clone)]
pub struct ThumbnailResult {
    pub key: ResourceKey,
    pub pixmap: Pixmap,
    /// Size of the original image; empty for placeholders.
    pub source_size: Size,
    /// `pixmap` is the broken-image placeholder.
    pub broken: bool,
}

/// Notification from a running job.
#[derive(Debug, Clone)]
pub enum ThumbnailEvent {
    Loaded(ThumbnailResult),
    /// Every item has been handled. Last event of the job.
    Finished,
}

enum Control {
    Append(ResourceKey),
    Remove(ResourceKey),
    Window(PriorityWindow),
    Stop,
}

/// Handle to a running thumbnail job. Dropping it stops the job.
pub struct ThumbnailJob {
    control: flume::Sender<Control>,
    events: async_channel::Receiver<ThumbnailEvent>,
    task: JoinHandle<()>,
}

impl ThumbnailJob {
    pub(crate) fn spawn(ctx: Arc<AppContext>, items: Vec<ResourceKey>) -> Self {
        let (control_tx, control_rx) = flume::unbounded();
        let (event_tx, event_rx) = async_channel::unbounded();
        let runner = JobRunner {
            ctx,
            work: WorkList::new(items),
            control: control_rx,
            events: event_tx,
        };
        Self {
            control: control_tx,
            events: event_rx,
            task: tokio::spawn(runner.run()),
        }
    }

    /// A new item showed up, e.g. the directory listing grew.
    pub fn append_item(&self, key: ResourceKey) {
        let _ = self.control.send(Control::Append(key));
    }

    /// Forget `key`. If it is being processed, its pending work is dropped.
    pub fn item_removed(&self, key: &ResourceKey) {
        let _ = self.control.send(Control::Remove(key.clone()));
    }

    /// Reorder the remaining work around a new focus and visible range.
    pub fn set_priority_items(&self, window: PriorityWindow) {
        let _ = self.control.send(Control::Window(window));
    }

    /// Stop without a `Finished` event; the event stream just ends.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Next notification, `None` once the job is gone or stopped.
    pub async fn next_event(&self) -> Option<ThumbnailEvent> {
        self.events.recv().await.ok()
    }

    /// Next notification if one is queued, without waiting.
    pub fn try_next_event(&self) -> Option<ThumbnailEvent> {
        self.events.try_recv().ok()
    }

    /// Collect results until the job finishes or stops.
    pub async fn wait_all(&self) -> Vec<ThumbnailResult> {
        let mut results = Vec::new();
        while let Some(event) = self.next_event().await {
            match event {
                ThumbnailEvent::Loaded(result) => results.push(result),
                ThumbnailEvent::Finished => break,
            }
        }
        results
    }

    /// Whether the job task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ThumbnailJob {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct JobRunner {
    ctx: Arc<AppContext>,
    work: WorkList,
    control: flume::Receiver<Control>,
    events: async_channel::Sender<ThumbnailEvent>,
}

impl JobRunner {
    async fn run(mut self) {
        let _busy = self.ctx.busy().register(BusyLevel::Thumbnails);
        self.ctx
            .cache()
            .check_thumbnail_size(self.ctx.config().thumbnail_pixel_size);
        debug!(items = self.work.len(), "Thumbnail job started");

        loop {
            if !self.drain_control() {
                debug!("Thumbnail job stopped");
                return;
            }
            let Some(key) = self.work.take_next() else {
                break;
            };

            let item = process_item(Arc::clone(&self.ctx), key.clone());
            tokio::pin!(item);
            let result = loop {
                tokio::select! {
                    result = &mut item => break Some(result),
                    msg = self.control.recv_async() => match msg {
                        Ok(Control::Remove(removed)) if removed == key => {
                            debug!(%key, "In-flight item removed");
                            self.work.remove(&removed);
                            break None;
                        }
                        Ok(Control::Stop) | Err(_) => {
                            debug!(%key, "Thumbnail job stopped");
                            return;
                        }
                        Ok(msg) => self.apply(msg),
                    }
                }
            };

            if let Some(result) = result {
                if self.events.send(ThumbnailEvent::Loaded(result)).await.is_err() {
                    return;
                }
            }
        }

        debug!("Thumbnail job finished");
        let _ = self.events.send(ThumbnailEvent::Finished).await;
    }

    /// Apply pending control messages. Returns false on stop.
    fn drain_control(&mut self) -> bool {
        while let Ok(msg) = self.control.try_recv() {
            if matches!(msg, Control::Stop) {
                return false;
            }
            self.apply(msg);
        }
        true
    }

    fn apply(&mut self, msg: Control) {
        match msg {
            Control::Append(key) => self.work.append(key),
            Control::Remove(key) => {
                self.work.remove(&key);
            }
            Control::Window(window) => self.work.set_window(window),
            Control::Stop => {}
        }
    }
}

/// Cancels the generator when the in-flight item is dropped.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn process_item(ctx: Arc<AppContext>, key: ResourceKey) -> ThumbnailResult {
    match thumbnail_for(&ctx, &key).await {
        Ok((pixmap, source_size)) => ThumbnailResult {
            key,
            pixmap,
            source_size,
            broken: false,
        },
        Err(e) => {
            debug!(%key, error = %e, "Using broken thumbnail");
            ThumbnailResult {
                key,
                pixmap: ThumbnailGenerator::broken(),
                source_size: Size::default(),
                broken: true,
            }
        }
    }
}

async fn thumbnail_for(
    ctx: &Arc<AppContext>,
    key: &ResourceKey,
) -> Result<(Pixmap, Size), ThumbnailError> {
    let config = ctx.config();
    let pixel_size = config.thumbnail_pixel_size;
    let cache = ctx.cache();

    ctx.busy().wait_until_allowed(BusyLevel::Thumbnails).await;
    let stat = match ctx.source().fast_stat(key) {
        Some(stat) => stat?,
        None => ctx.source().stat(key).await?,
    };
    let stamp = stat.modified;

    if cache.timestamp(key) == Some(stamp) {
        if let Some((pixmap, source_size)) = cache.thumbnail(key) {
            trace!(%key, "Memory thumbnail hit");
            return Ok((pixmap, source_size));
        }
    }

    let size_class = ThumbnailSize::for_pixel_size(pixel_size);
    let store = ctx.thumbnail_store();
    if let Some(store) = store.clone() {
        let k = key.clone();
        match ctx
            .thumbnail_pool()
            .run(move || store.load(&k, size_class, stamp))
            .await?
        {
            Ok(Some(stored)) if stored.covers(pixel_size) => {
                trace!(%key, "Disk thumbnail hit");
                let pixmap = Arc::new(ThumbnailGenerator::fit(stored.image, pixel_size));
                cache.add_thumbnail(key, Arc::clone(&pixmap), stored.source_size, stamp);
                return Ok((pixmap, stored.source_size));
            }
            Ok(Some(_)) => trace!(%key, "Stored thumbnail too small, regenerating"),
            Ok(None) => {}
            Err(e) => debug!(%key, error = ?e, "Ignoring unreadable thumbnail"),
        }
    }

    if stat.is_dir {
        return preview(ctx, key, pixel_size, stamp).await;
    }

    ctx.busy().wait_until_allowed(BusyLevel::Thumbnails).await;
    let bytes = source::read_all(ctx.source().fetch(key).await?).await?;
    let format = match ctx.decoder().sniff(&bytes) {
        ContentKind::Raster(format) => format,
        ContentKind::NonImage => return preview(ctx, key, pixel_size, stamp).await,
    };

    let cancel = CancelFlag::new();
    let _cancel_on_drop = CancelOnDrop(cancel.clone());
    let auto_rotate = config.auto_rotate_images;
    let generated = ctx
        .thumbnail_pool()
        .run(move || ThumbnailGenerator::generate(&bytes, pixel_size, auto_rotate, &cancel))
        .await??;

    let source_size = generated.source_size;
    let pixmap = Arc::new(generated.image);
    cache.add_thumbnail(key, Arc::clone(&pixmap), source_size, stamp);

    if let Some(store) = store.filter(|_| config.store_thumbnails_on_disk) {
        let meta = ThumbnailMeta::new(key, stamp, stat.size)
            .with_format(format)
            .with_image_size(source_size);
        let k = key.clone();
        let image = Arc::clone(&pixmap);
        match ctx
            .thumbnail_pool()
            .run(move || store.store(&k, size_class, &image, &meta))
            .await
        {
            Ok(Ok(path)) => trace!(?path, "Thumbnail persisted"),
            Ok(Err(e)) => warn!(%key, error = ?e, "Failed to save thumbnail"),
            Err(e) => warn!(%key, error = ?e, "Failed to save thumbnail"),
        }
    }

    Ok((pixmap, source_size))
}

async fn preview(
    ctx: &Arc<AppContext>,
    key: &ResourceKey,
    pixel_size: u32,
    stamp: ModificationStamp,
) -> Result<(Pixmap, Size), ThumbnailError> {
    let previewer = ctx
        .previewer()
        .ok_or_else(|| ThumbnailError::NoPreview(key.to_string()))?;
    let image = previewer
        .preview(key, pixel_size)
        .await?
        .ok_or_else(|| ThumbnailError::NoPreview(key.to_string()))?;

    let source_size = Size::new(image.width(), image.height());
    let pixmap = Arc::new(ThumbnailGenerator::fit(image, pixel_size));
    ctx.cache()
        .add_thumbnail(key, Arc::clone(&pixmap), source_size, stamp);
    Ok((pixmap, source_size))
}
