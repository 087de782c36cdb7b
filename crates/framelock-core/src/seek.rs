//! Frame-exact seeking.
//!
//! A seek is exclusive with itself (a second caller is turned away, never
//! queued) and with the scheduler (the state moves to `Seeking` before
//! anything is touched). It ends `Paused` on the target frame, with the audio
//! clock reading exactly the target instant.
//!
//! Fast path: the target is already buffered. Frames below it are evicted,
//! it is presented and the audio sink is skipped forward; the decoder is not
//! repositioned.
//!
//! Slow path: the decoder is repositioned to the keyframe before the target
//! and decodes forward until the target comes out, then audio is re-seeked,
//! trimmed to the target and the store re-primed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::audio::AudioSink;
use crate::audio_convert;
use crate::backend::{MediaBackend, StreamKind};
use crate::frame_source::{FrameRead, FrameSource};
use crate::player::{present_frame, Shared};
use crate::state::PlaybackState;
use crate::sync_metrics::SeekKind;
use crate::video::{rescale, FrameIndex, VideoFrame};

/// States a seek may start from.
const SEEKABLE: [PlaybackState; 5] = [
    PlaybackState::Playing,
    PlaybackState::Paused,
    PlaybackState::Buffering,
    PlaybackState::EndedStream,
    PlaybackState::Ended,
];

struct SeekGuard<'a>(&'a AtomicBool);

impl Drop for SeekGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Seeks to `target` (clamped into the stream). Returns whether the target
/// frame was found and presented.
pub(crate) fn seek_to_exact_frame<B: MediaBackend>(shared: &Shared<B>, target: FrameIndex) -> bool {
    if shared
        .seeking
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        tracing::debug!("Seek to {} rejected: another seek is in progress", target);
        return false;
    }
    let _guard = SeekGuard(&shared.seeking);

    let total = shared.total_frames;
    if total <= 0 {
        tracing::warn!("Seek to {} rejected: frame count unknown", target);
        return false;
    }
    let target = target.clamp(0, total - 1);

    let from = {
        let _presenter = shared.lock_presenter();
        if shared.is_stopped() {
            tracing::debug!("Seek to {} rejected: player is stopped", target);
            return false;
        }
        match shared.state.transition_from(&SEEKABLE, PlaybackState::Seeking) {
            Ok(from) => from,
            Err(err) => {
                tracing::debug!("Seek to {} rejected: {}", target, err);
                return false;
            }
        }
    };
    shared.notify_scheduler();

    let started = Instant::now();
    let paused_at = shared.clock.pause();
    tracing::debug!(
        "Seeking to frame {} from {} (audio at {:.3}s)",
        target,
        from,
        paused_at
    );

    let kind = if let Some(frame) = shared.store.take_exact(target) {
        fast_path(shared, target, frame)
    } else {
        slow_path(shared, target)
    };

    if kind.is_some() {
        shared.next_index.store(target + 1, Ordering::Release);
        shared.current_index.store(target, Ordering::Release);
    }
    let _ = shared.state.transition_from(
        &[PlaybackState::Seeking, PlaybackState::SeekBuffering],
        PlaybackState::Paused,
    );
    shared.metrics.record_seek(kind, started.elapsed());
    shared.notify_scheduler();

    match kind {
        Some(kind) => {
            tracing::debug!(
                "Seek to {} done ({:?} path) in {:?}",
                target,
                kind,
                started.elapsed()
            );
            true
        }
        None => {
            tracing::warn!("Seek to frame {} failed", target);
            false
        }
    }
}

fn fast_path<B: MediaBackend>(shared: &Shared<B>, target: FrameIndex, frame: VideoFrame) -> Option<SeekKind> {
    let evicted = shared.store.evict_below(target);
    if let Err(err) = shared.transfer.ensure_host_resident(&frame) {
        tracing::warn!("Buffered seek target {} unusable: {}", target, err);
        drop(frame);
        return slow_path(shared, target);
    }
    if !present_frame(&mut **shared.lock_presenter(), &frame, target) {
        drop(frame);
        return slow_path(shared, target);
    }
    drop(frame);

    let target_seconds = shared.timing.seconds_of(target);
    let audio_seconds = shared.clock.audio_seconds();
    let sink = shared.clock.sink();
    match sink.format() {
        Some(format) if target_seconds > audio_seconds => {
            let align = format.block_align().max(1);
            let bytes = format.bytes_for(Duration::from_secs_f64(target_seconds - audio_seconds));
            sink.skip(bytes / align * align);
        }
        _ => {}
    }
    // Keep the clock exact despite block alignment, and for targets behind
    // the audio position.
    shared.clock.rebase(target_seconds);

    tracing::trace!("Fast seek to {}: evicted {} frames", target, evicted);
    Some(SeekKind::Fast)
}

fn slow_path<B: MediaBackend>(shared: &Shared<B>, target: FrameIndex) -> Option<SeekKind> {
    let mut source = shared.source.lock();
    let _ = shared
        .state
        .transition_from(&[PlaybackState::Seeking], PlaybackState::SeekBuffering);

    let timestamp = shared.timing.timestamp_of(target);
    if let Err(err) = source.seek(StreamKind::Video, timestamp) {
        tracing::warn!("Decoder seek to ts {} failed: {}", timestamp, err);
        shared.store.reset();
        return None;
    }
    shared.store.reset();
    shared.seek_generation.fetch_add(1, Ordering::AcqRel);
    shared.video_ended.store(false, Ordering::Release);
    shared.audio_ended.store(false, Ordering::Release);
    shared.last_decoded.store(target - 1, Ordering::Release);

    let frame = match decode_to_target(shared, &mut source, target) {
        Decoded::Target(frame) => frame,
        Decoded::Passed(index, frame) => {
            // The target is not in the stream; continue from the frame after
            // it.
            let epoch = shared.store.epoch();
            shared.transfer.admit(&frame, shared.store.len());
            shared.store.insert(index, frame, epoch);
            shared.next_index.store(index, Ordering::Release);
            resync_audio(shared, &mut source, index);
            reprime(shared, &mut source, index);
            return None;
        }
        Decoded::NotFound => return None,
    };
    if let Err(err) = shared.transfer.ensure_host_resident(&frame) {
        tracing::warn!("Seek target {} could not be transferred: {}", target, err);
        return None;
    }
    if !present_frame(&mut **shared.lock_presenter(), &frame, target) {
        return None;
    }
    drop(frame);

    resync_audio(shared, &mut source, target);
    reprime(shared, &mut source, target);
    Some(SeekKind::Slow)
}

enum Decoded {
    Target(VideoFrame),
    /// The first frame after the target, which the stream does not contain
    Passed(FrameIndex, VideoFrame),
    NotFound,
}

/// Decodes forward from the keyframe until `target` comes out. A frame
/// without a timestamp takes the index after the previous one.
fn decode_to_target<B: MediaBackend>(
    shared: &Shared<B>,
    source: &mut FrameSource<B>,
    target: FrameIndex,
) -> Decoded {
    let mut previous: Option<FrameIndex> = None;
    for _ in 0..shared.config.seek_max_attempts {
        if shared.is_stopped() {
            return Decoded::NotFound;
        }
        match source.try_read_video_frame() {
            Ok(FrameRead::Available(frame)) => {
                let Some(index) = frame.index().or(previous.map(|p| p + 1)) else {
                    continue;
                };
                previous = Some(index);
                if index == target {
                    return Decoded::Target(frame);
                }
                if index > target {
                    tracing::debug!("Seek passed target {} at frame {}", target, index);
                    return Decoded::Passed(index, frame);
                }
            }
            Ok(FrameRead::NotReady) => {}
            Ok(FrameRead::EndOfStream) => {
                shared.video_ended.store(true, Ordering::Release);
                tracing::debug!("Stream ended before seek target {}", target);
                return Decoded::NotFound;
            }
            Err(err) => {
                shared.fail(err);
                return Decoded::NotFound;
            }
        }
    }
    tracing::debug!(
        "Seek target {} not reached within {} reads",
        target,
        shared.config.seek_max_attempts
    );
    Decoded::NotFound
}

/// Re-anchors audio so the first sample pushed plays at the target instant.
fn resync_audio<B: MediaBackend>(shared: &Shared<B>, source: &mut FrameSource<B>, target: FrameIndex) {
    let target_seconds = shared.timing.seconds_of(target);
    let sink = shared.clock.sink();
    sink.flush();
    shared.clock.rebase(target_seconds);

    let Some(track) = shared.audio else {
        return;
    };
    let timestamp = rescale(target, shared.timing.frame_duration(), track.time_base) + track.start_pts;
    if let Err(err) = source.seek_stream(StreamKind::Audio, timestamp) {
        tracing::warn!("Audio re-seek to ts {} failed: {}", timestamp, err);
        return;
    }

    for _ in 0..shared.config.seek_max_attempts {
        let frame = match source.try_read_audio_frame() {
            Ok(FrameRead::Available(frame)) => frame,
            Ok(FrameRead::NotReady) => continue,
            Ok(FrameRead::EndOfStream) => {
                shared.audio_ended.store(true, Ordering::Release);
                return;
            }
            Err(err) => {
                tracing::warn!("Audio decode failed during seek: {}", err);
                return;
            }
        };
        let mut samples = match audio_convert::to_pcm(&frame, track.start_pts) {
            Ok(samples) => samples,
            Err(err) => {
                tracing::warn!("Dropping unconvertible audio frame: {}", err);
                continue;
            }
        };
        let start = samples.start_seconds.unwrap_or(target_seconds);
        if start + samples.duration().as_secs_f64() <= target_seconds {
            continue;
        }
        let trimmed = samples.trim_before(target_seconds);
        push_samples(sink.as_ref(), &samples.data);
        tracing::trace!(
            "Audio resynced at {:.4}s, trimmed {} leading bytes",
            target_seconds,
            trimmed
        );
        return;
    }
}

fn push_samples(sink: &dyn AudioSink, data: &[u8]) {
    if !data.is_empty() {
        sink.push_samples(data);
    }
}

/// Decodes ahead until the store holds the fill threshold or the stream ends.
fn reprime<B: MediaBackend>(shared: &Shared<B>, source: &mut FrameSource<B>, target: FrameIndex) {
    let fill = shared.config.fill_threshold();
    let epoch = shared.store.epoch();
    let mut last = target;
    let mut reads = 0;
    while shared.store.len() < fill && reads < fill + shared.config.seek_max_attempts {
        reads += 1;
        if shared.is_stopped() {
            break;
        }
        match source.try_read_video_frame() {
            Ok(FrameRead::Available(frame)) => {
                let index = frame.index().unwrap_or(last + 1);
                if index <= target {
                    continue;
                }
                last = last.max(index);
                shared.transfer.admit(&frame, shared.store.len());
                shared.store.insert(index, frame, epoch);
            }
            Ok(FrameRead::NotReady) => {}
            Ok(FrameRead::EndOfStream) => {
                shared.video_ended.store(true, Ordering::Release);
                shared.notify_video_ended();
                break;
            }
            Err(err) => {
                shared.fail(err);
                break;
            }
        }
    }
    shared.last_decoded.store(last, Ordering::Release);
    tracing::trace!(
        "Re-primed {} frames after seek to {} ({} reads)",
        shared.store.len(),
        target,
        reads
    );
}
