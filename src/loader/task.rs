use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::state::{DecodeState, GetState, UpdateCoalescer};
use super::{LoadStatus, LoaderEvent, LoaderShared};
use crate::app::AppContext;
use crate::busy_level::BusyLevel;
use crate::cache::CachedFrames;
use crate::decode::{ContentKind, DecodeError, DecodedImage, IncrementalDecoder};
use crate::resource::{ModificationStamp, Rect, Size};
use crate::source::SourceError;
use crate::worker::WorkerError;

/// Bytes handed to an incremental decoder between yields.
const DECODE_CHUNK_SIZE: usize = 4096;

/// Minimum spacing of `ImageChanged` notifications while decoding progressively.
const IMAGE_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Formats are sniffed once this many bytes are in, or at end of stream.
const SNIFF_LEN: usize = 32;

/// Upper bound on the fetch buffer reserved up front from the stat size.
/// Larger resources grow the buffer as chunks arrive.
const MAX_PREALLOC: usize = 64 * 1024 * 1024;

/// Failure of a single load.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

enum Incremental {
    Continue,
    Complete,
    Fallback,
}

/// Bytes to reserve for a resource whose stat reported `reported` bytes.
fn initial_capacity(reported: u64) -> usize {
    usize::try_from(reported).map_or(MAX_PREALLOC, |len| len.min(MAX_PREALLOC))
}

/// Drive one load to completion and publish the terminal status.
pub(super) async fn run(ctx: Arc<AppContext>, shared: Arc<LoaderShared>) {
    let task = LoadTask {
        busy_rx: ctx.busy().subscribe(),
        ctx,
        shared: Arc::clone(&shared),
        coalescer: UpdateCoalescer::new(IMAGE_UPDATE_INTERVAL),
        size_announced: false,
    };
    let status = task.run().await;
    shared.finish(status);
}

struct LoadTask {
    ctx: Arc<AppContext>,
    shared: Arc<LoaderShared>,
    busy_rx: watch::Receiver<BusyLevel>,
    coalescer: UpdateCoalescer,
    size_announced: bool,
}

impl LoadTask {
    async fn run(mut self) -> LoadStatus {
        match self.load().await {
            Ok(status) => status,
            Err(e) => {
                warn!(key = %self.shared.key(), error = %e, "Failed to load image");
                LoadStatus::Failed(e.to_string())
            }
        }
    }

    async fn load(&mut self) -> Result<LoadStatus, LoaderError> {
        let key = self.shared.key().clone();
        let cache = self.ctx.cache().clone();
        let decoder = Arc::clone(self.ctx.decoder());

        cache.update_age();
        let cached_stamp = cache.timestamp(&key);

        self.wait_for_turn().await;
        self.set_get_state(GetState::Stating);
        let stat = self.ctx.source().stat(&key).await?;
        if stat.is_dir {
            self.shared.emit(LoaderEvent::KindDetermined(ContentKind::NonImage));
            return Ok(LoadStatus::NotAnImage);
        }
        let stamp = stat.modified;
        self.shared.update(|p| p.stamp = Some(stamp));

        if cached_stamp == Some(stamp) {
            if let Some(CachedFrames {
                frames,
                format: Some(format),
            }) = cache.frames(&key)
            {
                debug!(%key, "Using cached frames");
                self.set_get_state(GetState::Done);
                self.shared
                    .emit(LoaderEvent::KindDetermined(ContentKind::Raster(format)));
                let raw = cache.file(&key);
                let image = DecodedImage { frames, format };
                return Ok(self.complete(image, raw, stamp, true));
            }
            if let Some(raw) = cache.file(&key) {
                debug!(%key, "Decoding cached bytes");
                self.set_get_state(GetState::Done);
                let kind = decoder.sniff(&raw);
                self.shared.emit(LoaderEvent::KindDetermined(kind));
                if kind == ContentKind::NonImage {
                    return Ok(LoadStatus::NotAnImage);
                }
                let image = self.threaded_decode(raw.clone()).await?;
                return Ok(self.complete(image, Some(raw), stamp, true));
            }
        }

        self.set_get_state(GetState::PendingGet);
        self.wait_for_turn().await;
        self.set_get_state(GetState::Getting);
        let mut stream = self.ctx.source().fetch(&key).await?;

        let mut buffer: Vec<u8> = Vec::with_capacity(initial_capacity(stat.size));
        let mut sniffed = false;
        let mut incremental: Option<Box<dyn IncrementalDecoder>> = None;
        let mut decoded: Option<DecodedImage> = None;
        let mut fed = 0;

        loop {
            let chunk = stream.next_chunk().await?;
            let at_end = chunk.is_none();
            if let Some(chunk) = chunk {
                buffer.extend_from_slice(&chunk);
            }

            if !sniffed && (buffer.len() >= SNIFF_LEN || (at_end && !buffer.is_empty())) {
                sniffed = true;
                let kind = decoder.sniff(&buffer);
                self.shared.emit(LoaderEvent::KindDetermined(kind));
                let ContentKind::Raster(format) = kind else {
                    debug!(%key, "Not an image, aborting fetch");
                    return Ok(LoadStatus::NotAnImage);
                };
                self.shared.update(|p| p.format = Some(format));
                incremental = decoder.incremental(format, self.ctx.decode_options());
                self.set_decode_state(if incremental.is_some() {
                    DecodeState::IncrementalDecoding
                } else {
                    DecodeState::PendingThreadedDecoding
                });
            }

            if let Some(mut dec) = incremental.take() {
                match self.feed_incremental(dec.as_mut(), &buffer[fed..]).await {
                    Ok(Incremental::Continue) => incremental = Some(dec),
                    Ok(Incremental::Complete) => match dec.finish() {
                        Ok(image) => {
                            self.set_decode_state(DecodeState::IncrementalDecodingDone);
                            decoded = Some(image);
                        }
                        Err(e) => {
                            debug!(%key, error = %e, "Incremental finish failed, switching to threaded decode");
                            self.set_decode_state(DecodeState::PendingThreadedDecoding);
                        }
                    },
                    Ok(Incremental::Fallback) => {
                        trace!(%key, "Switching to threaded decode");
                        self.set_decode_state(DecodeState::PendingThreadedDecoding);
                    }
                    Err(e) => {
                        debug!(%key, error = %e, "Incremental decode failed, switching to threaded decode");
                        self.set_decode_state(DecodeState::PendingThreadedDecoding);
                    }
                }
                fed = buffer.len();
            }

            if at_end {
                break;
            }
        }
        drop(stream);
        self.set_get_state(GetState::Done);

        if buffer.is_empty() {
            return Err(DecodeError::NoFrames.into());
        }
        let raw = Bytes::from(buffer);
        cache.add_file(&key, raw.clone(), stamp);

        let (image, threaded) = match decoded {
            Some(image) => (image, false),
            None => (self.threaded_decode(raw.clone()).await?, true),
        };
        Ok(self.complete(image, Some(raw), stamp, threaded))
    }

    async fn feed_incremental(
        &mut self,
        decoder: &mut dyn IncrementalDecoder,
        data: &[u8],
    ) -> Result<Incremental, DecodeError> {
        for piece in data.chunks(DECODE_CHUNK_SIZE) {
            self.wait_for_turn().await;
            let progress = decoder.feed(piece)?;

            if let Some(size) = progress.size {
                self.announce_size(size);
            }
            if let Some(rect) = progress.updated {
                let partial = decoder.partial();
                self.shared.update(|p| p.partial = partial);
                if let Some(rect) = self.coalescer.add(rect, Instant::now()) {
                    self.shared.emit(LoaderEvent::ImageChanged(rect));
                }
            }
            if progress.needs_threaded {
                return Ok(Incremental::Fallback);
            }
            if progress.complete {
                return Ok(Incremental::Complete);
            }
            tokio::task::yield_now().await;
        }
        Ok(Incremental::Continue)
    }

    async fn threaded_decode(&mut self, raw: Bytes) -> Result<DecodedImage, LoaderError> {
        self.set_decode_state(DecodeState::PendingThreadedDecoding);
        self.wait_for_turn().await;
        self.set_decode_state(DecodeState::ThreadedDecoding);

        let decoder = Arc::clone(self.ctx.decoder());
        let options = self.ctx.decode_options();
        let cancel = self.shared.cancel_flag().clone();
        let image = self
            .ctx
            .decode_pool()
            .run(move || decoder.decode(&raw, options, &cancel))
            .await??;
        Ok(image)
    }

    /// Publish decoded frames and store them in the cache. `full_update`
    /// reports the whole canvas, for decodes that produced no partial updates.
    fn complete(
        &mut self,
        image: DecodedImage,
        raw: Option<Bytes>,
        stamp: ModificationStamp,
        full_update: bool,
    ) -> LoadStatus {
        let size = image.size();
        self.announce_size(size);

        if let Some(rect) = self.coalescer.flush() {
            self.shared.emit(LoaderEvent::ImageChanged(rect));
        }

        let cache = self.ctx.cache();
        if cache.frames(self.shared.key()).is_none() {
            cache.add_frames(self.shared.key(), image.frames.clone(), image.format, stamp);
        }

        self.shared.update(|p| {
            p.format = Some(image.format);
            p.frames = image.frames;
            p.raw = raw;
            p.partial = None;
            p.decode_state = DecodeState::Cached;
        });
        if full_update {
            self.shared
                .emit(LoaderEvent::ImageChanged(Rect::new(0, 0, size.width, size.height)));
        }
        self.set_decode_state(DecodeState::Done);
        LoadStatus::Loaded
    }

    fn announce_size(&mut self, size: Size) {
        if self.size_announced {
            return;
        }
        self.size_announced = true;
        self.shared.update(|p| p.size = Some(size));
        self.shared.emit(LoaderEvent::SizeDetermined(size));
    }

    fn set_get_state(&self, state: GetState) {
        self.shared.update(|p| p.get_state = state);
    }

    fn set_decode_state(&self, state: DecodeState) {
        self.shared.update(|p| p.decode_state = state);
    }

    /// Park until nothing more important than this loader is going on.
    async fn wait_for_turn(&mut self) {
        loop {
            let own = self.shared.priority();
            if *self.busy_rx.borrow_and_update() <= own {
                return;
            }
            trace!(key = %self.shared.key(), ?own, "Loader suspended");
            tokio::select! {
                changed = self.busy_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.shared.priority_changed().notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_capacity_is_capped() {
        assert_eq!(initial_capacity(0), 0);
        assert_eq!(initial_capacity(4096), 4096);
        assert_eq!(initial_capacity(1 << 40), MAX_PREALLOC);
        assert_eq!(initial_capacity(u64::MAX), MAX_PREALLOC);
    }
}
