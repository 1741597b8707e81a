//! Processing order of a thumbnail job.
//!
//! - The focused item goes first
//! - Then the visible window, alternating backward and forward from the focus
//! - Then everything off screen, expanding outward from the window
//!
//! Processed items keep their flag across reorders, so changing the window
//! never redoes finished work.

use std::collections::VecDeque;

use tracing::trace;

use crate::resource::ResourceKey;

/// Focus and visible range, as indices into the item list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityWindow {
    pub current: usize,
    pub first_visible: usize,
    pub last_visible: usize,
}

impl PriorityWindow {
    /// Window focused on `current`, showing `first_visible..=last_visible`.
    pub fn new(current: usize, first_visible: usize, last_visible: usize) -> Self {
        Self {
            current,
            first_visible,
            last_visible,
        }
    }

    /// Window clamped to `len` items with the focus inside the visible range.
    fn clamped(self, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let last = self.last_visible.min(len - 1);
        let first = self.first_visible.min(last);
        Some(Self {
            current: self.current.clamp(first, last),
            first_visible: first,
            last_visible: last,
        })
    }
}

/// Items of a thumbnail job in processing order.
#[derive(Debug, Default)]
pub struct WorkList {
    items: Vec<ResourceKey>,
    processed: Vec<bool>,
    window: Option<PriorityWindow>,
    queue: VecDeque<usize>,
}

impl WorkList {
    /// All `items` pending, focused on the first.
    pub fn new(items: Vec<ResourceKey>) -> Self {
        let mut list = Self {
            processed: vec![false; items.len()],
            items,
            window: None,
            queue: VecDeque::new(),
        };
        list.rebuild();
        list
    }

    /// Number of items, processed or not.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items still waiting.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Reorder the pending items around `window`.
    pub fn set_window(&mut self, window: PriorityWindow) {
        self.window = Some(window);
        self.rebuild();
    }

    /// Add `key`, or queue it again if it is already known.
    pub fn append(&mut self, key: ResourceKey) {
        match self.items.iter().position(|k| *k == key) {
            Some(index) => self.processed[index] = false,
            None => {
                self.items.push(key);
                self.processed.push(false);
            }
        }
        self.rebuild();
    }

    /// Forget `key`. Returns whether it was known.
    pub fn remove(&mut self, key: &ResourceKey) -> bool {
        let Some(index) = self.items.iter().position(|k| k == key) else {
            return false;
        };
        self.items.remove(index);
        self.processed.remove(index);
        if let Some(window) = &mut self.window {
            let shift = |i: &mut usize| {
                if *i > index {
                    *i -= 1;
                }
            };
            shift(&mut window.current);
            shift(&mut window.first_visible);
            shift(&mut window.last_visible);
        }
        self.rebuild();
        true
    }

    /// Take the next item and mark it processed.
    pub fn take_next(&mut self) -> Option<ResourceKey> {
        while let Some(index) = self.queue.pop_front() {
            if !self.processed[index] {
                self.processed[index] = true;
                return Some(self.items[index].clone());
            }
        }
        None
    }

    /// Indices in processing order.
    pub fn order(&self) -> Vec<usize> {
        self.queue.iter().copied().collect()
    }

    fn rebuild(&mut self) {
        self.queue.clear();
        let len = self.items.len();
        let window = self
            .window
            .and_then(|w| w.clamped(len))
            .or_else(|| PriorityWindow::new(0, 0, len.saturating_sub(1)).clamped(len));
        let Some(window) = window else {
            return;
        };

        let mut queued = vec![false; len];
        self.expand(
            window.current as isize,
            window.current as isize + 1,
            window.first_visible,
            window.last_visible,
            &mut queued,
        );
        self.expand(
            window.first_visible as isize - 1,
            window.last_visible as isize + 1,
            0,
            len - 1,
            &mut queued,
        );
        trace!(queued = self.queue.len(), ?window, "Rebuilt thumbnail order");
    }

    /// Alternate one step backward from `back` and one forward from
    /// `forward`, staying within `[low, high]`.
    fn expand(
        &mut self,
        mut back: isize,
        mut forward: isize,
        low: usize,
        high: usize,
        queued: &mut [bool],
    ) {
        let (low, high) = (low as isize, high as isize);
        while back >= low || forward <= high {
            if back >= low {
                self.enqueue(back as usize, queued);
                back -= 1;
            }
            if forward <= high {
                self.enqueue(forward as usize, queued);
                forward += 1;
            }
        }
    }

    fn enqueue(&mut self, index: usize, queued: &mut [bool]) {
        if !self.processed[index] && !queued[index] {
            queued[index] = true;
            self.queue.push_back(index);
        }
    }
}
