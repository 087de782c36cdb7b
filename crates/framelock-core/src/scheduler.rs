//! Presentation loop: paces video frames against the audio clock.
//!
//! Each iteration takes the next expected frame out of the store, presents it
//! and then derives the wait before the following frame from how far the
//! audio clock is ahead of or behind video:
//!
//! ```text
//!   ideal = floor(audio_seconds * fps)     diff = ideal - next
//!
//!   diff >= 3   skip 2, 5 or diff frames, then recompute diff
//!   diff <  0   delay = base + ahead_factor * (-diff * base - t)
//!   diff >  0   delay = max(base - t - diff * base, base / (diff + 2))
//!   diff == 0   delay = max(base - t, base / 2)
//! ```
//!
//! `base` is one frame period and `t` the audio clock's offset inside frame
//! `ideal`. The time spent presenting is subtracted from the delay.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::MediaBackend;
use crate::player::{present_frame, Shared};
use crate::state::PlaybackState;
use crate::sync_metrics::DropReason;
use crate::video::FrameIndex;

/// Shortest wait between two frames.
pub const MIN_FRAME_DELAY: Duration = Duration::from_millis(1);

/// Poll interval while paused, buffering or seeking.
const HOLD_POLL: Duration = Duration::from_millis(10);

/// Signals delivered to the scheduler thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerEvent {
    /// Re-evaluate state now (play, pause, seek, stop)
    Wake,
    /// The video reader hit end of stream
    VideoEnded,
    /// A reader hit a fatal decode error; playback is stopping
    Fatal,
}

/// Number of frames to drop when video is `diff` frames behind audio.
pub fn skip_count(diff: i64) -> i64 {
    if diff >= 10 {
        diff
    } else if diff >= 5 {
        diff.min(5)
    } else if diff >= 3 {
        diff.min(2)
    } else {
        0
    }
}

/// Wait before the next frame given the remaining frame difference.
pub fn frame_delay(diff: i64, time_in_frame: Duration, base: Duration, ahead_factor: f64) -> Duration {
    let base = base.as_secs_f64();
    let t = time_in_frame.as_secs_f64();
    let delay = if diff < 0 {
        base + ahead_factor * ((-diff) as f64 * base - t)
    } else if diff > 0 {
        (base - t - diff as f64 * base).max(base / (diff as f64 + 2.0))
    } else {
        (base - t).max(base / 2.0)
    };
    Duration::from_secs_f64(delay.max(0.0))
}

/// Drift correction for one presented frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    /// Buffered frames to drop without presenting
    pub skip: i64,
    /// Frame difference after skipping
    pub diff: i64,
    pub delay: Duration,
}

/// Computes the correction for the frame `next`, given the audio clock's
/// frame `ideal` and its offset `time_in_frame`.
pub fn correct(
    ideal: FrameIndex,
    time_in_frame: Duration,
    next: FrameIndex,
    base: Duration,
    ahead_factor: f64,
) -> Correction {
    let skip = skip_count(ideal - next);
    let diff = ideal - (next + skip);
    Correction {
        skip,
        diff,
        delay: frame_delay(diff, time_in_frame, base, ahead_factor),
    }
}

enum Step {
    /// Presented; wait this long before the next iteration
    Presented(Duration),
    /// The frame could not be presented and was dropped
    Dropped,
    /// The expected frame is not buffered
    Missing(FrameIndex),
    /// State changed under us
    Interrupted,
}

/// Scheduler thread body. Returns when playback ends or stops.
pub(crate) fn run<B: MediaBackend>(shared: Arc<Shared<B>>) {
    while shared.events_rx.try_recv().is_ok() {}

    let cap = shared.store.capacity();
    shared.store.wait_until_filled(cap, || {
        !shared.is_stopped() && !shared.video_ended.load(Ordering::Acquire)
    });
    if shared.is_stopped() {
        return;
    }
    // The preview frame counts towards the initial fill but is never shown
    // again.
    let start = shared.next_index.load(Ordering::Acquire);
    if_current(&shared, start, || shared.store.evict_below(start));
    tracing::info!(
        "Scheduler started at frame {} with {} frames buffered",
        start,
        shared.store.len()
    );

    let low_watermark = shared.config.low_watermark();
    let fill_threshold = shared.config.fill_threshold();
    let mut need_resume = true;
    let mut healed_at: Option<FrameIndex> = None;

    loop {
        if shared.is_stopped() {
            break;
        }
        while let Ok(event) = shared.events_rx.try_recv() {
            tracing::trace!("Scheduler event {:?}", event);
        }

        let state = shared.state.get();
        match state {
            PlaybackState::Stopped | PlaybackState::Ended => break,
            PlaybackState::Playing | PlaybackState::EndedStream => {}
            _ => {
                need_resume = true;
                shared.wait_event(HOLD_POLL);
                continue;
            }
        }

        let video_ended = shared.video_ended.load(Ordering::Acquire);

        if state == PlaybackState::Playing && !video_ended && shared.store.len() < low_watermark {
            if shared
                .state
                .transition_from(&[PlaybackState::Playing], PlaybackState::Buffering)
                .is_ok()
            {
                shared.metrics.record_underrun();
                shared.clock.pause();
                tracing::debug!(
                    "Buffering: {} frames < {}, refilling to {}",
                    shared.store.len(),
                    low_watermark,
                    fill_threshold
                );
                shared.store.wait_until_filled(fill_threshold, || {
                    !shared.is_stopped()
                        && !shared.video_ended.load(Ordering::Acquire)
                        && shared.state.get() == PlaybackState::Buffering
                });
                if shared
                    .state
                    .transition_from(&[PlaybackState::Buffering], PlaybackState::Playing)
                    .is_ok()
                {
                    tracing::debug!("Buffering finished with {} frames", shared.store.len());
                }
                need_resume = true;
            }
            continue;
        }

        let skip_sync = need_resume;
        if need_resume {
            shared.clock.resume();
            need_resume = false;
        }

        if video_ended && state == PlaybackState::Playing {
            let _ = shared
                .state
                .transition_from(&[PlaybackState::Playing], PlaybackState::EndedStream);
        }

        if video_ended && shared.store.is_empty() {
            // Ended and the stop flag change together, so a seek sees either
            // a live pipeline or one that is being released.
            let ended = {
                let _presenter = shared.lock_presenter();
                let ended = shared
                    .state
                    .transition_from(&[PlaybackState::EndedStream], PlaybackState::Ended)
                    .is_ok();
                if ended {
                    shared.stop.store(true, Ordering::Release);
                }
                ended
            };
            if ended {
                shared.clock.pause();
                shared.metrics.log_status();
                tracing::info!(
                    "Playback ended at frame {}",
                    shared.current_index.load(Ordering::Acquire)
                );
                shared.release_after_end();
                break;
            }
            continue;
        }

        match present_next(&shared, skip_sync) {
            Step::Presented(delay) => {
                healed_at = None;
                shared.wait_event(delay);
            }
            Step::Dropped | Step::Interrupted => {}
            Step::Missing(next) => {
                if self_heal(&shared, next, &mut healed_at) {
                    need_resume = true;
                }
            }
        }
    }
    tracing::debug!("Scheduler exiting in state {}", shared.state.get());
}

fn present_next<B: MediaBackend>(shared: &Shared<B>, skip_sync: bool) -> Step {
    // Held until the bookkeeping below is done so a seek cannot slip in
    // between presenting and advancing `next_index`.
    let mut presenter = shared.lock_presenter();
    if !matches!(
        shared.state.get(),
        PlaybackState::Playing | PlaybackState::EndedStream
    ) {
        return Step::Interrupted;
    }

    let started = Instant::now();
    let next = shared.next_index.load(Ordering::Acquire);
    let Some(frame) = shared.store.take_exact(next) else {
        return Step::Missing(next);
    };

    if !present_frame(&mut **presenter, &frame, next) {
        tracing::warn!("Frame {} is not host-resident, skipping it", next);
        shared.metrics.record_drop(DropReason::NotTransferred, 1);
        shared.next_index.store(next + 1, Ordering::Release);
        return Step::Dropped;
    }
    let following = frame.index().map_or(next + 1, |index| index + 1);
    drop(frame);

    shared.next_index.store(following, Ordering::Release);
    shared.current_index.store(next, Ordering::Release);
    shared.store.evict_surplus();

    let timing = shared.timing;
    let audio_seconds = shared.clock.audio_seconds().max(0.0);
    shared.metrics.record_frame(
        Duration::from_secs_f64(timing.seconds_of(next).max(0.0)),
        Duration::from_secs_f64(audio_seconds),
    );

    let base = timing.base_frame_duration();
    if skip_sync {
        return Step::Presented(base.saturating_sub(started.elapsed()).max(MIN_FRAME_DELAY));
    }

    let (ideal, time_in_frame) = timing.frame_info(audio_seconds);
    let correction = correct(ideal, time_in_frame, following, base, shared.config.ahead_factor);
    if correction.skip > 0 {
        let skipped = (following..following + correction.skip)
            .filter(|index| shared.store.take_exact(*index).is_some())
            .count();
        shared
            .next_index
            .store(following + correction.skip, Ordering::Release);
        shared.metrics.record_drop(DropReason::Behind, skipped as u64);
        tracing::trace!(
            "Video behind audio: skipped {} frames ({} buffered), now at {}",
            correction.skip,
            skipped,
            following + correction.skip
        );
    }
    drop(presenter);

    Step::Presented(
        correction
            .delay
            .saturating_sub(started.elapsed())
            .max(MIN_FRAME_DELAY),
    )
}

/// Recovers from the expected frame not being buffered. Returns true when
/// audio was paused by the recovery and must be resumed.
fn self_heal<B: MediaBackend>(
    shared: &Shared<B>,
    next: FrameIndex,
    healed_at: &mut Option<FrameIndex>,
) -> bool {
    let video_ended = shared.video_ended.load(Ordering::Acquire);
    let (Some(first), Some(last)) = (shared.store.first_index(), shared.store.last_index()) else {
        shared.wait_event(HOLD_POLL);
        return false;
    };
    shared.metrics.record_self_heal();

    if last < next {
        if let Some(evicted) = if_current(shared, next, || shared.store.evict_below(next)) {
            shared.metrics.record_drop(DropReason::Stale, evicted as u64);
            tracing::debug!("Self-heal: evicted {} stale frames below {}", evicted, next);
        }
        return false;
    }

    if video_ended || *healed_at == Some(next) || first < next {
        jump(shared, next, first);
        *healed_at = None;
        return false;
    }

    *healed_at = Some(next);
    let commands = shared.user_commands.load(Ordering::Acquire);
    tracing::debug!("Self-heal: frame {} missing, seeking to it", next);
    let found = crate::seek::seek_to_exact_frame(shared, next);
    if !found {
        if let Some(first) = shared.store.first_index() {
            jump(shared, next, first);
        }
    }

    let _presenter = shared.lock_presenter();
    if !resume_after_heal(commands, shared.user_commands.load(Ordering::Acquire)) {
        tracing::debug!(
            "Self-heal: playback control changed during recovery, staying {}",
            shared.state.get()
        );
        return false;
    }
    let _ = shared
        .state
        .transition_from(&[PlaybackState::Paused], PlaybackState::Playing);
    true
}

/// Whether a self-heal may put playback back into `Playing`: only when no
/// play, pause, seek or stop call arrived while it was seeking.
fn resume_after_heal(commands_before: u64, commands_now: u64) -> bool {
    commands_before == commands_now
}

/// Runs `f` with presentation locked, unless a seek is running or has moved
/// `next_index` away from `next`.
fn if_current<B: MediaBackend, R>(
    shared: &Shared<B>,
    next: FrameIndex,
    f: impl FnOnce() -> R,
) -> Option<R> {
    let _presenter = shared.lock_presenter();
    if shared.state.get().is_seeking() || shared.next_index.load(Ordering::Acquire) != next {
        return None;
    }
    Some(f())
}

fn jump<B: MediaBackend>(shared: &Shared<B>, from: FrameIndex, to: FrameIndex) {
    let moved = if_current(shared, from, || {
        if to < from {
            let evicted = shared.store.evict_below(from);
            shared.metrics.record_drop(DropReason::Stale, evicted as u64);
        } else {
            shared.next_index.store(to, Ordering::Release);
        }
    });
    match moved {
        Some(()) => tracing::debug!("Self-heal: jumping from frame {} to {}", from, to),
        None => tracing::debug!("Self-heal: frame {} is no longer expected", from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_nanos(33_333_333);

    fn close(a: Duration, b: f64) -> bool {
        (a.as_secs_f64() - b).abs() < 1e-6
    }

    #[test]
    fn test_skip_count_tiers() {
        assert_eq!(skip_count(-4), 0);
        assert_eq!(skip_count(2), 0);
        assert_eq!(skip_count(3), 2);
        assert_eq!(skip_count(4), 2);
        assert_eq!(skip_count(5), 5);
        assert_eq!(skip_count(9), 5);
        assert_eq!(skip_count(10), 10);
        assert_eq!(skip_count(42), 42);
    }

    #[test]
    fn test_behind_by_five_skips_to_ideal() {
        let correction = correct(50, Duration::ZERO, 45, BASE, 1.3);
        assert_eq!(correction.skip, 5);
        assert_eq!(correction.diff, 0);
        assert!(close(correction.delay, BASE.as_secs_f64()));
    }

    #[test]
    fn test_behind_by_four_keeps_remaining_diff() {
        let correction = correct(50, Duration::ZERO, 46, BASE, 1.3);
        assert_eq!(correction.skip, 2);
        assert_eq!(correction.diff, 2);
        let base = BASE.as_secs_f64();
        assert!(close(correction.delay, base / 4.0));
    }

    #[test]
    fn test_on_time_delay() {
        let base = BASE.as_secs_f64();
        let t = Duration::from_secs_f64(base / 4.0);
        assert!(close(frame_delay(0, t, BASE, 1.3), base * 0.75));
        let late = Duration::from_secs_f64(base * 0.9);
        assert!(close(frame_delay(0, late, BASE, 1.3), base / 2.0));
    }

    #[test]
    fn test_ahead_delay_stretches() {
        let base = BASE.as_secs_f64();
        let t = Duration::from_secs_f64(base / 2.0);
        let expected = base + 1.3 * (2.0 * base - base / 2.0);
        assert!(close(frame_delay(-2, t, BASE, 1.3), expected));
    }

    #[test]
    fn test_heal_resumes_only_without_user_commands() {
        assert!(resume_after_heal(7, 7));
        assert!(!resume_after_heal(7, 8));
    }

    #[test]
    fn test_slightly_behind_delay_has_floor() {
        let base = BASE.as_secs_f64();
        assert!(close(frame_delay(1, Duration::ZERO, BASE, 1.3), base / 3.0));
        assert!(close(frame_delay(2, Duration::ZERO, BASE, 1.3), base / 4.0));
    }
}
