//! Asynchronous image loading shared between observers.
//!
//! A loader turns a [`ResourceKey`] into decoded frames: stat, streamed
//! fetch, incremental or threaded decode, then the result lands in the
//! [`ContentCache`](crate::cache::ContentCache). Concurrent requests for one
//! key share a single loader through the [`LoaderRegistry`]; every observer
//! receives the same event sequence, late observers get it replayed.

pub mod state;
mod task;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_channel::{Receiver, Sender};
use bytes::Bytes;
use image::ImageFormat;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::app::AppContext;
use crate::busy_level::{BusyLevel, BusyLevelGuard, BusyLevelManager};
use crate::cache::Pixmap;
use crate::decode::{CancelFlag, ContentKind, DecodedFrame};
use crate::resource::{ModificationStamp, Rect, ResourceKey, Size};

pub use state::{DecodeState, GetState};
pub use task::LoaderError;

/// Notification fanned out to every observer of a loader.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    /// The first bytes were sniffed.
    KindDetermined(ContentKind),
    SizeDetermined(Size),
    /// New pixels are available in this rectangle.
    ImageChanged(Rect),
    /// Always the last event of a load.
    Finished(LoadStatus),
}

/// How a load ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded,
    /// The resource is not a raster image; hand it to a generic file path.
    NotAnImage,
    Failed(String),
}

impl LoadStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadStatus::Loaded)
    }
}

/// Identity of one subscription to a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Observer {
    priority: BusyLevel,
    tx: Sender<LoaderEvent>,
}

/// What a load has produced so far.
#[derive(Debug, Default, Clone)]
pub(crate) struct LoadProgress {
    pub(crate) get_state: GetState,
    pub(crate) decode_state: DecodeState,
    pub(crate) size: Option<Size>,
    pub(crate) format: Option<ImageFormat>,
    pub(crate) frames: Vec<DecodedFrame>,
    pub(crate) raw: Option<Bytes>,
    pub(crate) stamp: Option<ModificationStamp>,
    pub(crate) partial: Option<Pixmap>,
    pub(crate) status: Option<LoadStatus>,
}

struct LoaderInner {
    observers: HashMap<ObserverId, Observer>,
    history: Vec<LoaderEvent>,
    progress: LoadProgress,
    busy_guard: Option<BusyLevelGuard>,
    task: Option<JoinHandle<()>>,
}

impl LoaderInner {
    fn priority(&self) -> BusyLevel {
        self.observers
            .values()
            .map(|o| o.priority)
            .max()
            .unwrap_or(BusyLevel::None)
    }

    fn sync_busy_level(&self) {
        if let Some(guard) = &self.busy_guard {
            guard.set(self.priority());
        }
    }
}

pub(crate) struct LoaderShared {
    key: ResourceKey,
    inner: Mutex<LoaderInner>,
    cancel: CancelFlag,
    priority_changed: Notify,
    next_observer: AtomicU64,
}

impl LoaderShared {
    fn new(key: ResourceKey, busy_guard: BusyLevelGuard) -> Self {
        Self {
            key,
            inner: Mutex::new(LoaderInner {
                observers: HashMap::new(),
                history: Vec::new(),
                progress: LoadProgress::default(),
                busy_guard: Some(busy_guard),
                task: None,
            }),
            cancel: CancelFlag::new(),
            priority_changed: Notify::new(),
            next_observer: AtomicU64::new(1),
        }
    }

    pub(crate) fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub(crate) fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub(crate) fn priority_changed(&self) -> &Notify {
        &self.priority_changed
    }

    /// Aggregate priority: the most important observer wins.
    pub(crate) fn priority(&self) -> BusyLevel {
        self.inner.lock().priority()
    }

    fn add_observer(&self, priority: BusyLevel) -> (ObserverId, Receiver<LoaderEvent>) {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = async_channel::unbounded();

        let mut inner = self.inner.lock();
        for event in &inner.history {
            // Fresh unbounded channel, cannot be full or closed.
            let _ = tx.try_send(event.clone());
        }
        inner.observers.insert(id, Observer { priority, tx });
        inner.sync_busy_level();
        drop(inner);

        self.priority_changed.notify_one();
        (id, rx)
    }

    fn set_observer_priority(&self, id: ObserverId, priority: BusyLevel) {
        let mut inner = self.inner.lock();
        if let Some(observer) = inner.observers.get_mut(&id) {
            observer.priority = priority;
        }
        inner.sync_busy_level();
        drop(inner);
        self.priority_changed.notify_one();
    }

    pub(crate) fn emit(&self, event: LoaderEvent) {
        let mut inner = self.inner.lock();
        trace!(key = %self.key, ?event, "Loader event");
        for observer in inner.observers.values() {
            let _ = observer.tx.try_send(event.clone());
        }
        inner.history.push(event);
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut LoadProgress) -> R) -> R {
        f(&mut self.inner.lock().progress)
    }

    pub(crate) fn progress(&self) -> LoadProgress {
        self.inner.lock().progress.clone()
    }

    fn set_task(&self, task: JoinHandle<()>) {
        self.inner.lock().task = Some(task);
    }

    /// Record the terminal status and tell everyone. A failed load leaves
    /// nothing behind.
    pub(crate) fn finish(&self, status: LoadStatus) {
        let guard = {
            let mut inner = self.inner.lock();
            if !status.is_loaded() {
                inner.progress.frames.clear();
                inner.progress.raw = None;
                inner.progress.partial = None;
            }
            inner.progress.status = Some(status.clone());
            inner.busy_guard.take()
        };
        drop(guard);
        debug!(key = %self.key, ?status, "Loader finished");
        self.emit(LoaderEvent::Finished(status));
    }
}

/// Live loaders by key. Entries are weak; observers own the loader.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: Arc<Mutex<HashMap<ResourceKey, Weak<LoaderShared>>>>,
}

impl LoaderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the loader in flight for `key`, or create one. The flag tells
    /// whether the caller must start it.
    fn acquire(
        &self,
        key: &ResourceKey,
        priority: BusyLevel,
        busy: &Arc<BusyLevelManager>,
    ) -> (LoaderHandle, bool) {
        let mut loaders = self.loaders.lock();

        let (shared, created) = match loaders.get(key).and_then(Weak::upgrade) {
            Some(shared) => {
                trace!(%key, "Joining existing loader");
                (shared, false)
            }
            None => {
                let shared = Arc::new(LoaderShared::new(key.clone(), busy.register(priority)));
                loaders.insert(key.clone(), Arc::downgrade(&shared));
                debug!(%key, ?priority, "Created loader");
                (shared, true)
            }
        };

        let (id, events) = shared.add_observer(priority);
        let handle = LoaderHandle {
            shared,
            id,
            events,
            registry: self.clone(),
        };
        (handle, created)
    }

    fn release(&self, shared: &Arc<LoaderShared>, id: ObserverId) {
        let mut loaders = self.loaders.lock();
        let leftovers = {
            let mut inner = shared.inner.lock();
            inner.observers.remove(&id);
            if inner.observers.is_empty() {
                Some((inner.task.take(), inner.busy_guard.take()))
            } else {
                inner.sync_busy_level();
                None
            }
        };

        let Some((task, guard)) = leftovers else {
            shared.priority_changed.notify_one();
            return;
        };

        let registered = loaders
            .get(&shared.key)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(shared)));
        if registered {
            loaders.remove(&shared.key);
        }
        drop(loaders);

        shared.cancel.cancel();
        if let Some(task) = task {
            task.abort();
        }
        drop(guard);
        debug!(key = %shared.key, "Released last observer, loader dropped");
    }

    /// Number of live loaders.
    pub fn len(&self) -> usize {
        self.loaders
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a loader for `key` is alive.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.loaders
            .lock()
            .get(key)
            .is_some_and(|w| w.strong_count() > 0)
    }
}

/// Get a loader for `key`, starting one if none is in flight. Must be called
/// from within a tokio runtime.
pub fn open(ctx: &Arc<AppContext>, key: &ResourceKey, priority: BusyLevel) -> LoaderHandle {
    let (handle, created) = ctx.registry().acquire(key, priority, ctx.busy());
    if created {
        let shared = Arc::clone(&handle.shared);
        let task = tokio::spawn(task::run(Arc::clone(ctx), Arc::clone(&shared)));
        shared.set_task(task);
    }
    handle
}

/// One observer's subscription to a shared loader. Dropping it unsubscribes;
/// the loader stops when its last observer goes away.
pub struct LoaderHandle {
    shared: Arc<LoaderShared>,
    id: ObserverId,
    events: Receiver<LoaderEvent>,
    registry: LoaderRegistry,
}

impl LoaderHandle {
    pub fn key(&self) -> &ResourceKey {
        &self.shared.key
    }

    pub fn observer_id(&self) -> ObserverId {
        self.id
    }

    /// Next notification, `None` once the loader is gone.
    pub async fn next_event(&self) -> Option<LoaderEvent> {
        self.events.recv().await.ok()
    }

    /// Next notification if one is queued, without waiting.
    pub fn try_next_event(&self) -> Option<LoaderEvent> {
        self.events.try_recv().ok()
    }

    /// Drain notifications until the terminal one.
    pub async fn wait_finished(&self) -> LoadStatus {
        while let Some(event) = self.next_event().await {
            if let LoaderEvent::Finished(status) = event {
                return status;
            }
        }
        self.status()
            .unwrap_or_else(|| LoadStatus::Failed("loader dropped".into()))
    }

    /// Change this observer's priority. The loader runs at the maximum over
    /// its observers.
    pub fn set_priority(&self, priority: BusyLevel) {
        self.shared.set_observer_priority(self.id, priority);
    }

    /// Priority of the whole loader, the max over its observers.
    pub fn priority(&self) -> BusyLevel {
        self.shared.priority()
    }

    /// Progress of the stat and fetch half.
    pub fn get_state(&self) -> GetState {
        self.shared.update(|p| p.get_state)
    }

    /// Progress of the decode half.
    pub fn decode_state(&self) -> DecodeState {
        self.shared.update(|p| p.decode_state)
    }

    /// Terminal status, `None` while loading.
    pub fn status(&self) -> Option<LoadStatus> {
        self.shared.update(|p| p.status.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_some()
    }

    /// Decoded frames, empty until the load succeeds.
    pub fn frames(&self) -> Vec<DecodedFrame> {
        self.shared.update(|p| p.frames.clone())
    }

    /// Format sniffed from the first bytes.
    pub fn format(&self) -> Option<ImageFormat> {
        self.shared.update(|p| p.format)
    }

    /// Encoded bytes, kept for lossless operations on JPEG.
    pub fn raw_data(&self) -> Option<Bytes> {
        self.shared.update(|p| p.raw.clone())
    }

    /// Image size once the header has been read.
    pub fn size(&self) -> Option<Size> {
        self.shared.update(|p| p.size)
    }

    /// Modification stamp reported by stat.
    pub fn timestamp(&self) -> Option<ModificationStamp> {
        self.shared.update(|p| p.stamp)
    }

    /// Canvas of a progressive decode in progress.
    pub fn partial_image(&self) -> Option<Pixmap> {
        self.shared.update(|p| p.partial.clone())
    }

    /// Unsubscribe now rather than at drop.
    pub fn release(self) {}
}

impl Drop for LoaderHandle {
    fn drop(&mut self) {
        self.registry.release(&self.shared, self.id);
    }
}
