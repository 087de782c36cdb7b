//! Reader threads feeding the frame store and the audio sink.
//!
//! Both readers share the decoder lock with the seek path. Anything decoded
//! before a seek is recognised afterwards and discarded: video by the store
//! epoch read under the lock, audio by the seek generation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio_convert;
use crate::backend::MediaBackend;
use crate::frame_source::FrameRead;
use crate::player::Shared;
use crate::sync_metrics::DropReason;

/// Idle poll once a stream has ended (it may be revived by a seek).
const ENDED_POLL: Duration = Duration::from_millis(5);

/// Longest wait for store space before re-checking the stop flag.
const SPACE_POLL: Duration = Duration::from_millis(20);

/// Handles of the running reader threads.
pub(crate) struct DecodeThreads {
    video: Option<JoinHandle<()>>,
    audio: Option<JoinHandle<()>>,
}

impl DecodeThreads {
    /// Starts the video reader, and the audio reader when the media has an
    /// enabled audio track.
    pub(crate) fn spawn<B: MediaBackend>(shared: &Arc<Shared<B>>) -> std::io::Result<Self> {
        let video = {
            let shared = Arc::clone(shared);
            thread::Builder::new()
                .name("framelock-video".into())
                .spawn(move || video_loop(&shared))?
        };

        let audio = match shared.audio {
            Some(_) => {
                let reader = Arc::clone(shared);
                let spawned = thread::Builder::new()
                    .name("framelock-audio".into())
                    .spawn(move || audio_loop(&reader));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        shared.stop.store(true, Ordering::Release);
                        shared.store.wake_all();
                        let _ = video.join();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        Ok(Self {
            video: Some(video),
            audio,
        })
    }

    /// Joins both readers. The stop flag must already be set.
    pub(crate) fn join(&mut self) {
        for (name, handle) in [("video", self.video.take()), ("audio", self.audio.take())] {
            if let Some(handle) = handle {
                if let Err(e) = handle.join() {
                    tracing::warn!("{} reader thread panicked: {:?}", name, e);
                }
            }
        }
    }
}

fn video_loop<B: MediaBackend>(shared: &Shared<B>) {
    tracing::debug!("Video reader started");
    while !shared.is_stopped() {
        if shared.video_ended.load(Ordering::Acquire) {
            thread::sleep(ENDED_POLL);
            continue;
        }
        if !shared.store.wait_for_space(SPACE_POLL) || shared.state.get().is_seeking() {
            continue;
        }

        let (read, epoch) = {
            let mut source = shared.source.lock();
            if shared.video_ended.load(Ordering::Acquire) {
                continue;
            }
            let epoch = shared.store.epoch();
            let read = source.try_read_video_frame();
            if matches!(read, Ok(FrameRead::EndOfStream)) {
                shared.video_ended.store(true, Ordering::Release);
            }
            shared
                .metrics
                .record_drop(DropReason::Undecodable, source.take_dropped_video());
            (read, epoch)
        };

        match read {
            Ok(FrameRead::Available(frame)) => {
                let index = frame
                    .index()
                    .unwrap_or_else(|| shared.last_decoded.load(Ordering::Acquire) + 1);
                shared.last_decoded.fetch_max(index, Ordering::AcqRel);

                if index < shared.next_index.load(Ordering::Acquire) {
                    shared.metrics.record_drop(DropReason::Stale, 1);
                    tracing::trace!("Dropping frame {} decoded behind presentation", index);
                    continue;
                }
                shared.transfer.admit(&frame, shared.store.len());
                shared.store.insert(index, frame, epoch);
            }
            Ok(FrameRead::NotReady) => {}
            Ok(FrameRead::EndOfStream) => {
                tracing::debug!(
                    "Video stream ended after frame {}",
                    shared.last_decoded.load(Ordering::Acquire)
                );
                shared.notify_video_ended();
            }
            Err(e) => {
                tracing::error!("Video decode failed: {}", e);
                shared.fail(e);
                break;
            }
        }
    }
    tracing::debug!("Video reader exiting");
}

fn audio_loop<B: MediaBackend>(shared: &Shared<B>) {
    let Some(track) = shared.audio else {
        return;
    };
    let sink = Arc::clone(shared.clock.sink());
    let ahead = shared.config.audio_buffer_ahead;
    tracing::debug!("Audio reader started");

    while !shared.is_stopped() {
        if shared.audio_ended.load(Ordering::Acquire)
            || sink.buffered_duration() >= ahead
            || shared.state.get().is_seeking()
        {
            thread::sleep(ENDED_POLL);
            continue;
        }

        let (read, generation) = {
            let mut source = shared.source.lock();
            if shared.audio_ended.load(Ordering::Acquire) {
                continue;
            }
            let generation = shared.seek_generation.load(Ordering::Acquire);
            let read = source.try_read_audio_frame();
            if matches!(read, Ok(FrameRead::EndOfStream)) {
                shared.audio_ended.store(true, Ordering::Release);
            }
            (read, generation)
        };

        let frame = match read {
            Ok(FrameRead::Available(frame)) => frame,
            Ok(FrameRead::NotReady) => continue,
            Ok(FrameRead::EndOfStream) => {
                tracing::debug!("Audio stream ended");
                continue;
            }
            Err(e) => {
                tracing::error!("Audio decode failed: {}", e);
                shared.fail(e);
                break;
            }
        };

        let samples = match audio_convert::to_pcm(&frame, track.start_pts) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!("Dropping unconvertible audio frame: {}", e);
                continue;
            }
        };
        if samples.data.is_empty() {
            continue;
        }

        // A seek between decode and push has re-anchored the sink; these
        // samples belong to the old position.
        let _source = shared.source.lock();
        if shared.seek_generation.load(Ordering::Acquire) == generation {
            sink.push_samples(&samples.data);
        }
    }
    tracing::debug!("Audio reader exiting");
}
