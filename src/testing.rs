//! In-memory collaborators for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, ImageReader, RgbaImage};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::decode::{
    CancelFlag, ContentKind, DecodeError, DecodeOptions, DecodedImage, ImageDecoder,
    IncrementalDecoder, IncrementalProgress, StandardDecoder,
};
use crate::resource::{ModificationStamp, Rect, ResourceKey, Size};
use crate::source::{ChunkStream, ResourceSource, ResourceStat, SourceError};

struct MemoryResource {
    data: Bytes,
    stamp: ModificationStamp,
    gate: Option<Arc<Semaphore>>,
    /// Length claimed by stat, when it should not match the data.
    reported_size: Option<u64>,
}

/// Resource source serving byte buffers from memory and counting calls.
#[derive(Clone, Default)]
pub struct MemorySource {
    resources: Arc<Mutex<HashMap<ResourceKey, MemoryResource>>>,
    stats: Arc<Mutex<HashMap<ResourceKey, usize>>>,
    fetches: Arc<Mutex<HashMap<ResourceKey, usize>>>,
    total_stats: Arc<AtomicUsize>,
    fast_stats: Arc<AtomicUsize>,
    chunk_size: usize,
    fast: bool,
}

impl MemorySource {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            ..Default::default()
        }
    }

    /// Answer [`ResourceSource::fast_stat`], like a local filesystem would.
    pub fn with_fast_stat(mut self) -> Self {
        self.fast = true;
        self
    }

    pub fn insert(&self, key: &ResourceKey, data: impl Into<Bytes>, stamp: i64) {
        self.resources.lock().insert(
            key.clone(),
            MemoryResource {
                data: data.into(),
                stamp: ModificationStamp(stamp),
                gate: None,
                reported_size: None,
            },
        );
    }

    /// Make stat report `size` for `key` regardless of its actual length.
    pub fn report_size(&self, key: &ResourceKey, size: u64) {
        if let Some(res) = self.resources.lock().get_mut(key) {
            res.reported_size = Some(size);
        }
    }

    /// Hold the first chunk of `key` until a permit is added to the returned semaphore.
    pub fn gate(&self, key: &ResourceKey) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        if let Some(res) = self.resources.lock().get_mut(key) {
            res.gate = Some(Arc::clone(&gate));
        }
        gate
    }

    pub fn stat_count(&self, key: &ResourceKey) -> usize {
        self.stats.lock().get(key).copied().unwrap_or(0)
    }

    pub fn fetch_count(&self, key: &ResourceKey) -> usize {
        self.fetches.lock().get(key).copied().unwrap_or(0)
    }

    /// Asynchronous stats across all keys; fast stats are not counted.
    pub fn total_stats(&self) -> usize {
        self.total_stats.load(Ordering::SeqCst)
    }

    pub fn fast_stats(&self) -> usize {
        self.fast_stats.load(Ordering::SeqCst)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().values().sum()
    }

    fn lookup_stat(&self, key: &ResourceKey) -> Result<ResourceStat, SourceError> {
        let resources = self.resources.lock();
        let res = resources
            .get(key)
            .ok_or_else(|| SourceError::NotFound(key.to_string()))?;
        Ok(ResourceStat {
            modified: res.stamp,
            size: res.reported_size.unwrap_or(res.data.len() as u64),
            is_dir: false,
        })
    }
}

#[async_trait]
impl ResourceSource for MemorySource {
    async fn stat(&self, key: &ResourceKey) -> Result<ResourceStat, SourceError> {
        *self.stats.lock().entry(key.clone()).or_default() += 1;
        self.total_stats.fetch_add(1, Ordering::SeqCst);
        self.lookup_stat(key)
    }

    async fn fetch(&self, key: &ResourceKey) -> Result<Box<dyn ChunkStream>, SourceError> {
        *self.fetches.lock().entry(key.clone()).or_default() += 1;
        let (data, gate) = {
            let resources = self.resources.lock();
            let res = resources
                .get(key)
                .ok_or_else(|| SourceError::NotFound(key.to_string()))?;
            (res.data.clone(), res.gate.clone())
        };
        Ok(Box::new(MemoryChunks {
            data,
            offset: 0,
            chunk_size: self.chunk_size,
            gate,
        }))
    }

    fn fast_stat(&self, key: &ResourceKey) -> Option<Result<ResourceStat, SourceError>> {
        if !self.fast {
            return None;
        }
        self.fast_stats.fetch_add(1, Ordering::SeqCst);
        Some(self.lookup_stat(key))
    }
}

struct MemoryChunks {
    data: Bytes,
    offset: usize,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl ChunkStream for MemoryChunks {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        if let Some(gate) = self.gate.take() {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| SourceError::Io("gate closed".into()))?;
        }
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.offset = end;
        Ok(Some(chunk))
    }
}

/// Decoder whose incremental path reveals rows in proportion to the bytes
/// received, then hands the full buffer to [`StandardDecoder`].
#[derive(Default)]
pub struct RowRevealDecoder {
    pub total_len: usize,
}

impl ImageDecoder for RowRevealDecoder {
    fn sniff(&self, head: &[u8]) -> ContentKind {
        StandardDecoder.sniff(head)
    }

    fn decode(
        &self,
        bytes: &[u8],
        options: DecodeOptions,
        cancel: &CancelFlag,
    ) -> Result<DecodedImage, DecodeError> {
        StandardDecoder.decode(bytes, options, cancel)
    }

    fn incremental(
        &self,
        format: ImageFormat,
        _options: DecodeOptions,
    ) -> Option<Box<dyn IncrementalDecoder>> {
        Some(Box::new(RowReveal {
            format,
            total_len: self.total_len,
            buffer: Vec::new(),
            size: None,
            rows_done: 0,
        }))
    }
}

struct RowReveal {
    format: ImageFormat,
    total_len: usize,
    buffer: Vec<u8>,
    size: Option<Size>,
    rows_done: u32,
}

impl IncrementalDecoder for RowReveal {
    fn feed(&mut self, chunk: &[u8]) -> Result<IncrementalProgress, DecodeError> {
        self.buffer.extend_from_slice(chunk);
        let mut progress = IncrementalProgress::default();
        if self.size.is_none() {
            let mut reader = ImageReader::new(std::io::Cursor::new(&self.buffer[..]));
            reader.set_format(self.format);
            if let Ok((w, h)) = reader.into_dimensions() {
                self.size = Some(Size::new(w, h));
                progress.size = self.size;
            }
        }
        if let Some(size) = self.size {
            let rows = (size.height as u64 * self.buffer.len() as u64
                / self.total_len.max(1) as u64)
                .min(size.height as u64) as u32;
            if rows > self.rows_done {
                progress.updated = Some(Rect::new(0, self.rows_done, size.width, rows - self.rows_done));
                self.rows_done = rows;
            }
            progress.complete = self.buffer.len() >= self.total_len;
        }
        Ok(progress)
    }

    fn partial(&self) -> Option<Arc<RgbaImage>> {
        self.size
            .map(|s| Arc::new(RgbaImage::new(s.width, s.height)))
    }

    fn finish(&mut self) -> Result<DecodedImage, DecodeError> {
        StandardDecoder.decode(&self.buffer, DecodeOptions::default(), &CancelFlag::new())
    }
}
