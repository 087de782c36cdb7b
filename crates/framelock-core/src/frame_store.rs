//! Ordered, bounded store of decoded frames waiting to be presented.
//!
//! Frames are keyed by [`FrameIndex`], so the decoder may deliver them in any
//! order and the scheduler still takes them by number. Removal only happens
//! explicitly: taken for presentation, evicted as stale, or cleared by a seek.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::video::{FrameIndex, VideoFrame};

/// How often blocked waiters re-check their cancellation predicate.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Outcome of [`FrameStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    /// A frame with this index is already buffered; the new one was dropped
    Duplicate,
    /// The frame was decoded before the last reset; it was dropped
    Stale,
}

/// Thread-safe frame index to frame map with a fixed capacity.
pub struct FrameStore {
    frames: Mutex<BTreeMap<FrameIndex, VideoFrame>>,
    capacity: usize,
    len: AtomicUsize,
    epoch: AtomicU64,
    /// Signalled on every insertion
    filled: Condvar,
    /// Signalled whenever frames leave the store
    drained: Condvar,
}

impl FrameStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
            len: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            filled: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered frames; an unsynchronized snapshot.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Current generation. Producers read it before decoding and pass it to
    /// [`insert`](Self::insert); a reset in between makes their frame stale.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Adds a frame. Duplicates and frames from an older epoch are dropped.
    ///
    /// If the store is over capacity afterwards, the lowest indices are
    /// evicted so `len() <= capacity()` holds once this returns.
    pub fn insert(&self, index: FrameIndex, frame: VideoFrame, epoch: u64) -> Insert {
        let mut frames = self.frames.lock();
        if epoch != self.epoch.load(Ordering::Acquire) {
            tracing::trace!("FrameStore: dropping frame {} from epoch {}", index, epoch);
            return Insert::Stale;
        }
        if frames.contains_key(&index) {
            tracing::trace!("FrameStore: duplicate frame {}, keeping the first", index);
            return Insert::Duplicate;
        }
        frames.insert(index, frame);
        let evicted = trim_front(&mut frames, self.capacity);
        if evicted > 0 {
            tracing::debug!("FrameStore: over capacity, evicted {} oldest frames", evicted);
            self.drained.notify_all();
        }
        self.len.store(frames.len(), Ordering::Release);
        self.filled.notify_all();
        Insert::Inserted
    }

    /// Removes and returns the frame at `index`.
    pub fn take_exact(&self, index: FrameIndex) -> Option<VideoFrame> {
        let mut frames = self.frames.lock();
        let frame = frames.remove(&index)?;
        self.len.store(frames.len(), Ordering::Release);
        self.drained.notify_all();
        Some(frame)
    }

    /// Disposes every frame with an index below `index`. Returns how many.
    pub fn evict_below(&self, index: FrameIndex) -> usize {
        let mut frames = self.frames.lock();
        let keep = frames.split_off(&index);
        let evicted = std::mem::replace(&mut *frames, keep);
        self.len.store(frames.len(), Ordering::Release);
        if !evicted.is_empty() {
            self.drained.notify_all();
        }
        evicted.len()
    }

    /// Disposes the lowest frames until the store is within capacity.
    pub fn evict_surplus(&self) -> usize {
        let mut frames = self.frames.lock();
        let evicted = trim_front(&mut frames, self.capacity);
        self.len.store(frames.len(), Ordering::Release);
        if evicted > 0 {
            self.drained.notify_all();
        }
        evicted
    }

    /// Clears the store and starts a new epoch.
    pub fn reset(&self) -> usize {
        let mut frames = self.frames.lock();
        let cleared = frames.len();
        frames.clear();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.len.store(0, Ordering::Release);
        self.drained.notify_all();
        self.filled.notify_all();
        cleared
    }

    pub fn contains(&self, index: FrameIndex) -> bool {
        self.frames.lock().contains_key(&index)
    }

    pub fn first_index(&self) -> Option<FrameIndex> {
        self.frames.lock().keys().next().copied()
    }

    pub fn last_index(&self) -> Option<FrameIndex> {
        self.frames.lock().keys().next_back().copied()
    }

    /// Blocks until `len() >= target` or `is_still_active()` returns false.
    /// Returns whether the target was reached.
    pub fn wait_until_filled(&self, target: usize, is_still_active: impl Fn() -> bool) -> bool {
        let target = target.min(self.capacity);
        let mut frames = self.frames.lock();
        loop {
            if frames.len() >= target {
                return true;
            }
            if !is_still_active() {
                return false;
            }
            self.filled.wait_for(&mut frames, WAIT_SLICE);
        }
    }

    /// Blocks until there is room for another frame, up to `timeout`.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let mut frames = self.frames.lock();
        if frames.len() < self.capacity {
            return true;
        }
        self.drained.wait_for(&mut frames, timeout);
        frames.len() < self.capacity
    }

    /// Wakes every waiter, e.g. on stop.
    pub fn wake_all(&self) {
        let _frames = self.frames.lock();
        self.filled.notify_all();
        self.drained.notify_all();
    }
}

fn trim_front(frames: &mut BTreeMap<FrameIndex, VideoFrame>, capacity: usize) -> usize {
    let mut evicted = 0;
    while frames.len() > capacity {
        if frames.pop_first().is_none() {
            break;
        }
        evicted += 1;
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{CpuFrame, FrameBuffer, FrameLedger, PixelFormat, Plane};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    fn frame(ledger: &FrameLedger) -> VideoFrame {
        let pixels = CpuFrame::new(
            PixelFormat::Rgba,
            1,
            1,
            vec![Plane {
                data: vec![0; 4],
                stride: 4,
            }],
        );
        VideoFrame::new(Some(0), FrameBuffer::Host(pixels), Some(ledger))
    }

    #[test]
    fn test_duplicate_index_keeps_first() {
        let ledger = FrameLedger::new();
        let store = FrameStore::new(4);
        assert_eq!(store.insert(3, frame(&ledger), 0), Insert::Inserted);
        assert_eq!(store.insert(3, frame(&ledger), 0), Insert::Duplicate);
        assert_eq!(store.len(), 1);
        assert_eq!(ledger.live(), 1);
    }

    #[test]
    fn test_stale_epoch_rejected_after_reset() {
        let ledger = FrameLedger::new();
        let store = FrameStore::new(4);
        let epoch = store.epoch();
        store.insert(0, frame(&ledger), epoch);
        assert_eq!(store.reset(), 1);
        assert_eq!(store.insert(1, frame(&ledger), epoch), Insert::Stale);
        assert!(store.is_empty());
        assert_eq!(store.insert(1, frame(&ledger), store.epoch()), Insert::Inserted);
        assert_eq!(ledger.live(), 1);
    }

    #[test]
    fn test_out_of_order_insert_and_take() {
        let ledger = FrameLedger::new();
        let store = FrameStore::new(8);
        for index in [5, 2, 7, 3] {
            store.insert(index, frame(&ledger), 0);
        }
        assert_eq!(store.first_index(), Some(2));
        assert_eq!(store.last_index(), Some(7));
        assert!(store.take_exact(4).is_none());
        assert!(store.take_exact(5).is_some());
        assert!(!store.contains(5));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let ledger = FrameLedger::new();
        let store = FrameStore::new(3);
        for index in 0..10 {
            store.insert(index, frame(&ledger), 0);
            assert!(store.len() <= store.capacity());
        }
        assert_eq!(store.first_index(), Some(7));
        assert_eq!(ledger.live(), 3);
    }

    #[test]
    fn test_evict_below_disposes_frames() {
        let ledger = FrameLedger::new();
        let store = FrameStore::new(10);
        for index in 0..6 {
            store.insert(index, frame(&ledger), 0);
        }
        assert_eq!(store.evict_below(4), 4);
        assert_eq!(store.first_index(), Some(4));
        assert_eq!(ledger.live(), 2);
        assert_eq!(store.evict_below(0), 0);
    }

    #[test]
    fn test_wait_until_filled_wakes_on_insert() {
        let ledger = FrameLedger::new();
        let store = Arc::new(FrameStore::new(10));
        let producer = {
            let store = Arc::clone(&store);
            let ledger = ledger.clone();
            thread::spawn(move || {
                for index in 0..5 {
                    thread::sleep(Duration::from_millis(2));
                    store.insert(index, frame(&ledger), 0);
                }
            })
        };
        assert!(store.wait_until_filled(5, || true));
        let Ok(()) = producer.join() else {
            panic!("producer panicked");
        };
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_wait_until_filled_gives_up_when_inactive() {
        let store = Arc::new(FrameStore::new(10));
        let active = Arc::new(AtomicBool::new(true));
        let stopper = {
            let active = Arc::clone(&active);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                active.store(false, Ordering::SeqCst);
            })
        };
        assert!(!store.wait_until_filled(5, || active.load(Ordering::SeqCst)));
        let Ok(()) = stopper.join() else {
            panic!("stopper panicked");
        };
    }

    #[test]
    fn test_wait_for_space() {
        let ledger = FrameLedger::new();
        let store = FrameStore::new(2);
        assert!(store.wait_for_space(Duration::ZERO));
        store.insert(0, frame(&ledger), 0);
        store.insert(1, frame(&ledger), 0);
        assert!(!store.wait_for_space(Duration::from_millis(5)));
        store.take_exact(0);
        assert!(store.wait_for_space(Duration::ZERO));
    }
}
