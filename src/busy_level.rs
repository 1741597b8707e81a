//! Process-wide arbitration of how important the current foreground work is.
//!
//! Every producer declares a [`BusyLevel`]; the manager publishes the maximum.
//! Background producers compare their own level against it before each unit
//! of work and park on [`BusyLevelManager::wait_until_allowed`] while
//! something more important runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Ordered priority tag. Later variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum BusyLevel {
    #[default]
    None,
    Thumbnails,
    Preloading,
    Loading,
    Smoothing,
    Painting,
    CheckingNewResource,
}

/// Identity of a component holding a busy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequesterId(u64);

struct Levels {
    by_requester: HashMap<RequesterId, BusyLevel>,
    current: BusyLevel,
}

/// Tracks the busy level declared by every requester and publishes the maximum.
pub struct BusyLevelManager {
    levels: Mutex<Levels>,
    next_id: AtomicU64,
    /// Watch channels only keep the latest value, so a burst of changes in
    /// one tick reaches subscribers as a single wake-up.
    notifier: watch::Sender<BusyLevel>,
}

impl BusyLevelManager {
    /// Manager with no requesters, at [`BusyLevel::None`].
    pub fn new() -> Arc<Self> {
        let (notifier, _) = watch::channel(BusyLevel::None);
        Arc::new(Self {
            levels: Mutex::new(Levels {
                by_requester: HashMap::new(),
                current: BusyLevel::None,
            }),
            next_id: AtomicU64::new(1),
            notifier,
        })
    }

    /// Fresh identity for [`set_busy_level`](Self::set_busy_level).
    pub fn new_requester(&self) -> RequesterId {
        RequesterId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Record `level` for `requester`; `BusyLevel::None` removes the entry.
    pub fn set_busy_level(&self, requester: RequesterId, level: BusyLevel) {
        let changed = {
            let mut levels = self.levels.lock();
            if level == BusyLevel::None {
                levels.by_requester.remove(&requester);
            } else {
                levels.by_requester.insert(requester, level);
            }
            let max = levels
                .by_requester
                .values()
                .copied()
                .max()
                .unwrap_or(BusyLevel::None);
            trace!(?requester, ?level, ?max, "Busy level set");
            if max != levels.current {
                levels.current = max;
                Some(max)
            } else {
                None
            }
        };

        if let Some(max) = changed {
            debug!(?max, "Busy level changed");
            self.notifier.send_replace(max);
        }
    }

    /// Current maximum over all requesters.
    pub fn busy_level(&self) -> BusyLevel {
        self.levels.lock().current
    }

    /// Receiver woken whenever the maximum changes.
    pub fn subscribe(&self) -> watch::Receiver<BusyLevel> {
        self.notifier.subscribe()
    }

    /// Register a new requester at `level`; the level is cleared when the
    /// returned guard drops.
    pub fn register(self: &Arc<Self>, level: BusyLevel) -> BusyLevelGuard {
        let guard = BusyLevelGuard {
            manager: Arc::clone(self),
            id: self.new_requester(),
        };
        guard.set(level);
        guard
    }

    /// Whether work at `own` priority may proceed right now.
    pub fn allows(&self, own: BusyLevel) -> bool {
        self.busy_level() <= own
    }

    /// Resolve once nothing strictly more important than `own` is active.
    pub async fn wait_until_allowed(&self, own: BusyLevel) {
        let mut rx = self.notifier.subscribe();
        loop {
            if *rx.borrow_and_update() <= own {
                return;
            }
            trace!(?own, "Suspended by busy level");
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Requester handle that clears its level when dropped, so a component that
/// disappears never leaves a stale high-priority lock behind.
pub struct BusyLevelGuard {
    manager: Arc<BusyLevelManager>,
    id: RequesterId,
}

impl BusyLevelGuard {
    /// Declare a new level for this requester.
    pub fn set(&self, level: BusyLevel) {
        self.manager.set_busy_level(self.id, level);
    }

    pub fn id(&self) -> RequesterId {
        self.id
    }
}

impl Drop for BusyLevelGuard {
    fn drop(&mut self) {
        self.manager.set_busy_level(self.id, BusyLevel::None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_max_over_requesters() {
        let manager = BusyLevelManager::new();
        let a = manager.new_requester();
        let b = manager.new_requester();

        manager.set_busy_level(a, BusyLevel::Loading);
        manager.set_busy_level(b, BusyLevel::Thumbnails);
        assert_eq!(manager.busy_level(), BusyLevel::Loading);

        manager.set_busy_level(a, BusyLevel::None);
        assert_eq!(manager.busy_level(), BusyLevel::Thumbnails);

        manager.set_busy_level(b, BusyLevel::None);
        assert_eq!(manager.busy_level(), BusyLevel::None);
    }

    #[test]
    fn test_overwrite_lowers_level() {
        let manager = BusyLevelManager::new();
        let a = manager.new_requester();
        manager.set_busy_level(a, BusyLevel::Painting);
        manager.set_busy_level(a, BusyLevel::Preloading);
        assert_eq!(manager.busy_level(), BusyLevel::Preloading);
    }

    #[test]
    fn test_guard_clears_on_drop() {
        let manager = BusyLevelManager::new();
        {
            let _guard = manager.register(BusyLevel::Smoothing);
            assert_eq!(manager.busy_level(), BusyLevel::Smoothing);
        }
        assert_eq!(manager.busy_level(), BusyLevel::None);
    }

    #[test]
    fn test_burst_is_coalesced() {
        let manager = BusyLevelManager::new();
        let mut rx = manager.subscribe();
        let a = manager.new_requester();
        manager.set_busy_level(a, BusyLevel::Loading);
        manager.set_busy_level(a, BusyLevel::Painting);
        manager.set_busy_level(a, BusyLevel::Thumbnails);

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), BusyLevel::Thumbnails);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_wait_resumes_when_level_drops() {
        let manager = BusyLevelManager::new();
        let guard = manager.register(BusyLevel::Loading);
        assert!(!manager.allows(BusyLevel::Thumbnails));

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait_until_allowed(BusyLevel::Thumbnails).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resume")
            .unwrap();
    }
}
