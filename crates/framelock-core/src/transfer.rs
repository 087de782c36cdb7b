//! Device to host frame transfer.
//!
//! Hardware decoders hand out frames that live in accelerator memory. Before a
//! frame can be presented it is downloaded and normalized into
//! [`PixelFormat::CANONICAL`]; the frame handle keeps its identity, only the
//! buffer behind it is replaced.
//!
//! Transfers are capped by a counting semaphore ([`TransferLimiter`]) that is
//! independent of the decoder and store locks. Shallow stores transfer on the
//! decode thread so the next frame is never device-resident; deep stores hand
//! the work to short-lived worker threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::convert;
use crate::video::{FrameBuffer, PixelFormat, VideoError, VideoFrame};

/// Counting semaphore for concurrent transfers.
pub struct TransferLimiter {
    in_flight: Mutex<usize>,
    released: Condvar,
    max: usize,
}

/// A held transfer slot; released on drop.
pub struct TransferPermit {
    limiter: Arc<TransferLimiter>,
}

impl TransferLimiter {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            in_flight: Mutex::new(0),
            released: Condvar::new(),
            max: max.max(1),
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    /// Blocks until a slot is free.
    pub fn acquire(self: &Arc<Self>) -> TransferPermit {
        let mut in_flight = self.in_flight.lock();
        while *in_flight >= self.max {
            self.released.wait(&mut in_flight);
        }
        *in_flight += 1;
        TransferPermit {
            limiter: Arc::clone(self),
        }
    }

    /// Blocks until no transfer is in flight, up to `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.in_flight.lock();
        while *in_flight > 0 {
            if self.released.wait_until(&mut in_flight, deadline).timed_out() {
                return *in_flight == 0;
            }
        }
        true
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<TransferPermit> {
        let mut in_flight = self.in_flight.lock();
        if *in_flight >= self.max {
            return None;
        }
        *in_flight += 1;
        Some(TransferPermit {
            limiter: Arc::clone(self),
        })
    }
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        let mut in_flight = self.limiter.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        self.limiter.released.notify_all();
    }
}

/// What [`TransferPipeline::admit`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Already host-resident in the canonical format
    Ready,
    /// Transferred on the calling thread
    Transferred,
    /// Handed to a worker thread
    Dispatched,
    /// Transfer failed; the frame is still device-resident
    Failed,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub synchronous: u64,
    pub dispatched: u64,
    pub failed: u64,
}

#[derive(Default)]
struct StatCounters {
    synchronous: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
}

/// Moves frames from device to host memory.
#[derive(Clone)]
pub struct TransferPipeline {
    limiter: Arc<TransferLimiter>,
    lookahead: usize,
    stats: Arc<StatCounters>,
}

impl TransferPipeline {
    /// `max_concurrent` caps simultaneous transfers; frames entering a store
    /// shallower than `lookahead` are transferred synchronously.
    pub fn new(max_concurrent: usize, lookahead: usize) -> Self {
        Self {
            limiter: TransferLimiter::new(max_concurrent),
            lookahead,
            stats: Arc::new(StatCounters::default()),
        }
    }

    pub fn limiter(&self) -> &Arc<TransferLimiter> {
        &self.limiter
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            synchronous: self.stats.synchronous.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Makes `frame` host-resident in the canonical format.
    ///
    /// Idempotent: a frame that is already host-resident and canonical is left
    /// untouched. On failure the frame keeps its device buffer.
    pub fn ensure_host_resident(&self, frame: &VideoFrame) -> Result<(), VideoError> {
        if is_canonical(&frame.cell().buffer.lock()) {
            return Ok(());
        }
        let _permit = self.limiter.acquire();
        let mut buffer = frame.cell().buffer.lock();
        transfer_buffer(&mut buffer)
    }

    /// Applies the look-ahead policy to a frame about to enter a store that
    /// currently holds `store_len` frames.
    pub fn admit(&self, frame: &VideoFrame, store_len: usize) -> Admission {
        if is_canonical(&frame.cell().buffer.lock()) {
            return Admission::Ready;
        }

        if store_len < self.lookahead {
            return self.transfer_now(frame);
        }

        let weak = frame.downgrade();
        let permit = self.limiter.acquire();
        let stats = Arc::clone(&self.stats);
        let spawned = thread::Builder::new()
            .name("frame-transfer".to_string())
            .spawn(move || {
                let _permit = permit;
                let Some(cell) = weak.upgrade() else {
                    tracing::trace!("Frame disposed before its transfer ran");
                    return;
                };
                let mut buffer = cell.buffer.lock();
                if let Err(err) = transfer_buffer(&mut buffer) {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Background frame transfer failed: {}", err);
                }
            });

        match spawned {
            Ok(_) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                Admission::Dispatched
            }
            Err(err) => {
                tracing::warn!("Failed to spawn transfer worker ({}), transferring inline", err);
                self.transfer_now(frame)
            }
        }
    }

    fn transfer_now(&self, frame: &VideoFrame) -> Admission {
        self.stats.synchronous.fetch_add(1, Ordering::Relaxed);
        match self.ensure_host_resident(frame) {
            Ok(()) => Admission::Transferred,
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Frame transfer failed, frame stays device-resident: {}", err);
                Admission::Failed
            }
        }
    }
}

fn is_canonical(buffer: &FrameBuffer) -> bool {
    matches!(buffer, FrameBuffer::Host(frame) if frame.format == PixelFormat::CANONICAL)
}

fn transfer_buffer(buffer: &mut FrameBuffer) -> Result<(), VideoError> {
    let host = match &*buffer {
        FrameBuffer::Host(frame) if frame.format == PixelFormat::CANONICAL => return Ok(()),
        FrameBuffer::Host(frame) => frame.clone(),
        FrameBuffer::Device(surface) => surface.download()?,
    };
    let canonical = convert::to_canonical(host)?;
    *buffer = FrameBuffer::Host(canonical);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{CpuFrame, DeviceSurface, FrameLedger, Plane};
    use std::sync::atomic::AtomicUsize;

    struct CountingSurface {
        fail: bool,
        downloads: Arc<AtomicUsize>,
    }

    impl DeviceSurface for CountingSurface {
        fn dimensions(&self) -> (u32, u32) {
            (2, 2)
        }

        fn download_format(&self) -> PixelFormat {
            PixelFormat::Nv12
        }

        fn download(&self) -> Result<CpuFrame, VideoError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(VideoError::TransferFailed("mapping failed".into()));
            }
            Ok(CpuFrame::new(
                PixelFormat::Nv12,
                2,
                2,
                vec![
                    Plane { data: vec![128; 4], stride: 2 },
                    Plane { data: vec![128; 2], stride: 2 },
                ],
            ))
        }
    }

    fn device_frame(fail: bool, downloads: &Arc<AtomicUsize>) -> VideoFrame {
        VideoFrame::new(
            Some(0),
            FrameBuffer::Device(Box::new(CountingSurface {
                fail,
                downloads: Arc::clone(downloads),
            })),
            None,
        )
    }

    fn host_pixels(frame: &VideoFrame) -> Option<CpuFrame> {
        frame.with_host_frame(|f| f.clone())
    }

    #[test]
    fn test_ensure_host_resident_is_idempotent() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let pipeline = TransferPipeline::new(4, 8);
        let frame = device_frame(false, &downloads);

        assert!(pipeline.ensure_host_resident(&frame).is_ok());
        let first = host_pixels(&frame);
        assert!(pipeline.ensure_host_resident(&frame).is_ok());
        let second = host_pixels(&frame);

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
        assert_eq!(frame.format(), PixelFormat::Rgba);
    }

    #[test]
    fn test_failed_transfer_leaves_frame_on_device() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let pipeline = TransferPipeline::new(4, 8);
        let frame = device_frame(true, &downloads);

        assert!(matches!(
            pipeline.ensure_host_resident(&frame),
            Err(VideoError::TransferFailed(_))
        ));
        assert!(!frame.is_host_resident());
        assert_eq!(pipeline.admit(&frame, 0), Admission::Failed);
        assert_eq!(pipeline.stats().failed, 1);
        assert_eq!(pipeline.limiter().in_flight(), 0);
    }

    #[test]
    fn test_shallow_store_transfers_synchronously() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let pipeline = TransferPipeline::new(4, 8);
        let frame = device_frame(false, &downloads);
        assert_eq!(pipeline.admit(&frame, 3), Admission::Transferred);
        assert!(frame.is_host_resident());
        assert_eq!(pipeline.admit(&frame, 3), Admission::Ready);
    }

    #[test]
    fn test_deep_store_dispatches() {
        let downloads = Arc::new(AtomicUsize::new(0));
        let pipeline = TransferPipeline::new(4, 8);
        let frame = device_frame(false, &downloads);
        assert_eq!(pipeline.admit(&frame, 20), Admission::Dispatched);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !frame.is_host_resident() {
            assert!(Instant::now() < deadline, "background transfer never finished");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pipeline.stats().dispatched, 1);
    }

    #[test]
    fn test_dispatched_transfer_of_dropped_frame_releases_buffer() {
        let ledger = FrameLedger::new();
        let downloads = Arc::new(AtomicUsize::new(0));
        let pipeline = TransferPipeline::new(1, 0);
        let blocker = pipeline.limiter().acquire();

        let frame = VideoFrame::new(
            None,
            FrameBuffer::Device(Box::new(CountingSurface {
                fail: false,
                downloads: Arc::clone(&downloads),
            })),
            Some(&ledger),
        );
        let admit = {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                let admission = pipeline.admit(&frame, 10);
                drop(frame);
                admission
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(blocker);
        let Ok(admission) = admit.join() else {
            panic!("admit thread panicked");
        };
        assert_eq!(admission, Admission::Dispatched);

        let deadline = Instant::now() + Duration::from_secs(5);
        while ledger.live() != 0 || pipeline.limiter().in_flight() != 0 {
            assert!(Instant::now() < deadline, "frame or permit leaked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_limiter_caps_concurrency() {
        let limiter = TransferLimiter::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _permit = limiter.acquire();
                    peak.fetch_max(limiter.in_flight(), Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                })
            })
            .collect();
        for handle in handles {
            let Ok(()) = handle.join() else {
                panic!("worker panicked");
            };
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.try_acquire().is_some());
    }
}
