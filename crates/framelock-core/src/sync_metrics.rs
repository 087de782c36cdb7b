//! A/V synchronization metrics and drift tracking.
//!
//! The scheduler records every presented frame together with the audio clock
//! it was paced against, plus every frame it skipped or dropped. Seeks and
//! buffering episodes are counted so a run can be judged after the fact.
//!
//! ```ignore
//! let metrics = SyncMetrics::new();
//! metrics.record_frame(video_position, audio_position);
//! let snapshot = metrics.snapshot();
//! println!("max drift behind: {}ms", snapshot.max_drift_behind_us / 1000);
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Threshold for acceptable A/V sync drift (±100ms).
pub const SYNC_DRIFT_THRESHOLD_MS: i64 = 100;

/// Threshold for warning-level drift (±150ms is noticeable but tolerable).
pub const SYNC_DRIFT_WARNING_MS: i64 = 150;

/// Threshold for severe drift (±200ms is clearly out of sync).
pub const SYNC_DRIFT_SEVERE_MS: i64 = 200;

/// Samples ignored for max-drift tracking after a seek.
pub const SEEK_GRACE_SAMPLES: u64 = 3;

/// Which path a completed seek took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekKind {
    /// Target was already buffered; the decoder was not touched
    Fast,
    /// Decoder repositioned and decoded forward to the target
    Slow,
}

/// Why a buffered frame was discarded without being presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Skipped to catch up with the audio clock
    Behind,
    /// Still device-resident at presentation time
    NotTransferred,
    /// Below the expected index after a self-heal
    Stale,
    /// Decoded but not convertible to a presentable frame
    Undecodable,
}

/// A/V synchronization metrics tracker.
///
/// Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct SyncMetrics {
    inner: Arc<SyncMetricsInner>,
}

struct SyncMetricsInner {
    enabled: AtomicBool,

    /// video position - audio position, positive = video ahead
    current_drift_us: AtomicI64,
    max_drift_ahead_us: AtomicI64,
    max_drift_behind_us: AtomicI64,
    /// Sum of absolute drift values for the average
    total_drift_us: AtomicU64,
    sample_count: AtomicU64,
    out_of_sync_count: AtomicU64,
    grace_samples: AtomicU64,

    skipped_behind: AtomicU64,
    dropped_untransferred: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_undecodable: AtomicU64,

    underrun_count: AtomicU64,
    self_heal_count: AtomicU64,

    fast_seeks: AtomicU64,
    slow_seeks: AtomicU64,
    failed_seeks: AtomicU64,
    last_seek_us: AtomicU64,

    fps_window: Mutex<FpsWindow>,
    current_fps_x100: AtomicU64,
}

struct FpsWindow {
    started: Option<Instant>,
    frames: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SyncMetricsInner {
                enabled: AtomicBool::new(true),
                current_drift_us: AtomicI64::new(0),
                max_drift_ahead_us: AtomicI64::new(0),
                max_drift_behind_us: AtomicI64::new(0),
                total_drift_us: AtomicU64::new(0),
                sample_count: AtomicU64::new(0),
                out_of_sync_count: AtomicU64::new(0),
                grace_samples: AtomicU64::new(0),
                skipped_behind: AtomicU64::new(0),
                dropped_untransferred: AtomicU64::new(0),
                dropped_stale: AtomicU64::new(0),
                dropped_undecodable: AtomicU64::new(0),
                underrun_count: AtomicU64::new(0),
                self_heal_count: AtomicU64::new(0),
                fast_seeks: AtomicU64::new(0),
                slow_seeks: AtomicU64::new(0),
                failed_seeks: AtomicU64::new(0),
                last_seek_us: AtomicU64::new(0),
                fps_window: Mutex::new(FpsWindow {
                    started: None,
                    frames: 0,
                }),
                current_fps_x100: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Records a presented frame. Returns the signed drift in microseconds.
    pub fn record_frame(&self, video_position: Duration, audio_position: Duration) -> i64 {
        if !self.is_enabled() {
            return 0;
        }

        let drift_us = video_position.as_micros() as i64 - audio_position.as_micros() as i64;

        let in_grace = self
            .inner
            .grace_samples
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok();

        if !in_grace {
            self.inner.current_drift_us.store(drift_us, Ordering::Relaxed);
            if drift_us > 0 {
                self.inner.max_drift_ahead_us.fetch_max(drift_us, Ordering::Relaxed);
            } else {
                self.inner.max_drift_behind_us.fetch_min(drift_us, Ordering::Relaxed);
            }
        }

        self.inner
            .total_drift_us
            .fetch_add(drift_us.unsigned_abs(), Ordering::Relaxed);
        self.inner.sample_count.fetch_add(1, Ordering::Relaxed);

        let drift_ms = drift_us.abs() / 1000;
        if !in_grace && drift_ms > SYNC_DRIFT_THRESHOLD_MS {
            self.inner.out_of_sync_count.fetch_add(1, Ordering::Relaxed);
            if drift_ms > SYNC_DRIFT_WARNING_MS {
                let direction = if drift_us > 0 { "ahead of" } else { "behind" };
                tracing::warn!(
                    "A/V sync: video {}ms {} audio (video={:?}, audio={:?})",
                    drift_ms,
                    direction,
                    video_position,
                    audio_position
                );
            }
        }

        self.update_fps();
        drift_us
    }

    fn update_fps(&self) {
        let now = Instant::now();
        let mut window = self.inner.fps_window.lock();
        let Some(started) = window.started else {
            window.started = Some(now);
            window.frames = 1;
            return;
        };
        window.frames += 1;
        let elapsed = now.duration_since(started);
        if elapsed >= Duration::from_millis(500) {
            let fps_x100 = (window.frames as f64 * 100.0 / elapsed.as_secs_f64()) as u64;
            self.inner.current_fps_x100.store(fps_x100, Ordering::Relaxed);
            window.started = Some(now);
            window.frames = 0;
        }
    }

    pub fn record_drop(&self, reason: DropReason, count: u64) {
        if !self.is_enabled() || count == 0 {
            return;
        }
        let counter = match reason {
            DropReason::Behind => &self.inner.skipped_behind,
            DropReason::NotTransferred => &self.inner.dropped_untransferred,
            DropReason::Stale => &self.inner.dropped_stale,
            DropReason::Undecodable => &self.inner.dropped_undecodable,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    /// Records entering the buffering state.
    pub fn record_underrun(&self) {
        if !self.is_enabled() {
            return;
        }
        let count = self.inner.underrun_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("Buffer underrun #{}", count);
    }

    pub fn record_self_heal(&self) {
        if self.is_enabled() {
            self.inner.self_heal_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a finished seek and arms the post-seek grace period.
    pub fn record_seek(&self, kind: Option<SeekKind>, elapsed: Duration) {
        if !self.is_enabled() {
            return;
        }
        let counter = match kind {
            Some(SeekKind::Fast) => &self.inner.fast_seeks,
            Some(SeekKind::Slow) => &self.inner.slow_seeks,
            None => &self.inner.failed_seeks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.inner
            .last_seek_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.inner
            .grace_samples
            .store(SEEK_GRACE_SAMPLES, Ordering::Relaxed);
    }

    pub fn current_fps(&self) -> f32 {
        self.inner.current_fps_x100.load(Ordering::Relaxed) as f32 / 100.0
    }

    pub fn is_in_sync(&self) -> bool {
        let drift_us = self.inner.current_drift_us.load(Ordering::Relaxed);
        drift_us.abs() <= SYNC_DRIFT_THRESHOLD_MS * 1000
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let sample_count = load(&self.inner.sample_count);
        let avg_drift_us = if sample_count > 0 {
            (load(&self.inner.total_drift_us) / sample_count) as i64
        } else {
            0
        };

        SyncMetricsSnapshot {
            current_drift_us: self.inner.current_drift_us.load(Ordering::Relaxed),
            max_drift_ahead_us: self.inner.max_drift_ahead_us.load(Ordering::Relaxed),
            max_drift_behind_us: self.inner.max_drift_behind_us.load(Ordering::Relaxed),
            avg_drift_us,
            frames_presented: sample_count,
            out_of_sync_count: load(&self.inner.out_of_sync_count),
            frames_skipped: load(&self.inner.skipped_behind),
            frames_untransferred: load(&self.inner.dropped_untransferred),
            frames_stale: load(&self.inner.dropped_stale),
            frames_undecodable: load(&self.inner.dropped_undecodable),
            underrun_count: load(&self.inner.underrun_count),
            self_heal_count: load(&self.inner.self_heal_count),
            fast_seeks: load(&self.inner.fast_seeks),
            slow_seeks: load(&self.inner.slow_seeks),
            failed_seeks: load(&self.inner.failed_seeks),
            last_seek_duration: Duration::from_micros(load(&self.inner.last_seek_us)),
            current_fps: self.current_fps(),
        }
    }

    /// Logs current sync status at debug level.
    pub fn log_status(&self) {
        let snap = self.snapshot();
        tracing::debug!(
            "A/V Sync: current={:+}ms, max_ahead={:+}ms, max_behind={:+}ms, avg={}ms, presented={}, skipped={}, out_of_sync={}",
            snap.current_drift_us / 1000,
            snap.max_drift_ahead_us / 1000,
            snap.max_drift_behind_us / 1000,
            snap.avg_drift_us / 1000,
            snap.frames_presented,
            snap.frames_skipped,
            snap.out_of_sync_count
        );
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of sync metrics at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMetricsSnapshot {
    /// Drift of the last presented frame (positive = video ahead of audio)
    pub current_drift_us: i64,
    pub max_drift_ahead_us: i64,
    /// Most negative drift seen (video behind audio)
    pub max_drift_behind_us: i64,
    /// Average absolute drift
    pub avg_drift_us: i64,
    pub frames_presented: u64,
    pub out_of_sync_count: u64,
    /// Frames skipped to catch up with audio
    pub frames_skipped: u64,
    /// Frames dropped because their transfer failed or was still pending
    pub frames_untransferred: u64,
    /// Frames evicted as stale by self-healing
    pub frames_stale: u64,
    /// Frames the decoder produced but that could not be converted
    pub frames_undecodable: u64,
    pub underrun_count: u64,
    pub self_heal_count: u64,
    pub fast_seeks: u64,
    pub slow_seeks: u64,
    pub failed_seeks: u64,
    pub last_seek_duration: Duration,
    pub current_fps: f32,
}

impl SyncMetricsSnapshot {
    pub fn max_abs_drift_ms(&self) -> i64 {
        self.max_drift_ahead_us.abs().max(self.max_drift_behind_us.abs()) / 1000
    }

    /// Human-readable quality rating based on the worst drift.
    pub fn quality(&self) -> &'static str {
        if self.frames_presented == 0 {
            return "no data";
        }
        match self.max_abs_drift_ms() {
            d if d <= SYNC_DRIFT_THRESHOLD_MS => "good",
            d if d <= SYNC_DRIFT_WARNING_MS => "fair",
            d if d <= SYNC_DRIFT_SEVERE_MS => "poor",
            _ => "bad",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_metrics_basic() {
        let metrics = SyncMetrics::new();
        let drift = metrics.record_frame(Duration::from_millis(1000), Duration::from_millis(990));
        assert_eq!(drift, 10_000);
        let snap = metrics.snapshot();
        assert_eq!(snap.frames_presented, 1);
        assert_eq!(snap.current_drift_us, 10_000);
        assert_eq!(snap.max_drift_ahead_us, 10_000);
        assert!(metrics.is_in_sync());
        assert_eq!(snap.quality(), "good");
    }

    #[test]
    fn test_sync_metrics_behind() {
        let metrics = SyncMetrics::new();
        metrics.record_frame(Duration::from_millis(500), Duration::from_millis(700));
        let snap = metrics.snapshot();
        assert_eq!(snap.max_drift_behind_us, -200_000);
        assert_eq!(snap.out_of_sync_count, 1);
        assert!(!metrics.is_in_sync());
        assert_eq!(snap.quality(), "poor");
    }

    #[test]
    fn test_seek_grace_period_hides_spikes() {
        let metrics = SyncMetrics::new();
        metrics.record_seek(Some(SeekKind::Slow), Duration::from_millis(12));
        for _ in 0..SEEK_GRACE_SAMPLES {
            metrics.record_frame(Duration::from_secs(5), Duration::ZERO);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.max_drift_ahead_us, 0);
        assert_eq!(snap.out_of_sync_count, 0);
        assert_eq!(snap.slow_seeks, 1);
        assert_eq!(snap.last_seek_duration, Duration::from_millis(12));

        metrics.record_frame(Duration::from_secs(5), Duration::ZERO);
        assert_eq!(metrics.snapshot().max_drift_ahead_us, 5_000_000);
    }

    #[test]
    fn test_drop_counters() {
        let metrics = SyncMetrics::new();
        metrics.record_drop(DropReason::Behind, 5);
        metrics.record_drop(DropReason::NotTransferred, 1);
        metrics.record_drop(DropReason::Stale, 0);
        metrics.record_drop(DropReason::Undecodable, 2);
        metrics.record_seek(None, Duration::ZERO);
        let snap = metrics.snapshot();
        assert_eq!(snap.frames_skipped, 5);
        assert_eq!(snap.frames_untransferred, 1);
        assert_eq!(snap.frames_stale, 0);
        assert_eq!(snap.frames_undecodable, 2);
        assert_eq!(snap.failed_seeks, 1);
    }

    #[test]
    fn test_disabled_metrics_record_nothing() {
        let metrics = SyncMetrics::new();
        metrics.set_enabled(false);
        metrics.record_frame(Duration::from_secs(1), Duration::ZERO);
        metrics.record_underrun();
        let snap = metrics.snapshot();
        assert_eq!(snap.frames_presented, 0);
        assert_eq!(snap.underrun_count, 0);
        assert_eq!(snap.quality(), "no data");
    }
}
