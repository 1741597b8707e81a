use std::time::{Duration, Instant};

use crate::resource::Rect;

/// Progress of the stat/fetch half of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetState {
    #[default]
    PendingStat,
    Stating,
    PendingGet,
    Getting,
    Done,
}

/// Progress of the decode half of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    #[default]
    Waiting,
    PendingThreadedDecoding,
    IncrementalDecoding,
    IncrementalDecodingDone,
    ThreadedDecoding,
    Cached,
    Done,
}

/// Merges updated rectangles so observers hear about them at most once per
/// `interval`.
#[derive(Debug)]
pub(crate) struct UpdateCoalescer {
    interval: Duration,
    pending: Option<Rect>,
    last_emit: Option<Instant>,
}

impl UpdateCoalescer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            last_emit: None,
        }
    }

    /// Record `rect`; returns the merged rectangle when it is time to emit.
    pub(crate) fn add(&mut self, rect: Rect, now: Instant) -> Option<Rect> {
        let merged = match self.pending {
            Some(pending) => pending.union(&rect),
            None => rect,
        };
        self.pending = Some(merged);

        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.last_emit = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    /// Whatever is still pending, regardless of timing.
    pub(crate) fn flush(&mut self) -> Option<Rect> {
        self.pending.take()
    }
}
