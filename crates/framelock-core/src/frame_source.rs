//! Pull-one-frame state machine over a [`MediaBackend`].
//!
//! Both streams share a single demux cursor. When the cursor yields a packet
//! for the stream that is *not* being serviced, the packet is parked in that
//! stream's pending queue and handed to its decoder on the next call for that
//! stream. Nothing read from the container is lost because of request order.
//!
//! ```text
//!   receive(target) ── Frame ──────────────────────────────▶ Available
//!        │ NeedsInput
//!        ▼
//!   pending[target]? ── yes ─▶ send ─▶ receive ─▶ Available / NotReady
//!        │ no
//!        ▼
//!   read_packet ── other stream ─▶ pending[other], read again
//!        │ target             │ exhausted
//!        ▼                    ▼
//!   send ─▶ receive      send_eof ─▶ receive ─▶ Available / EndOfStream (latched)
//! ```

use std::collections::VecDeque;

use crate::audio::AudioFrame;
use crate::backend::{MediaBackend, MediaInfo, Receive, SeekFlags, StreamKind};
use crate::video::{FrameTiming, VideoError, VideoFrame};

/// Upper bound on parked packets per stream before the oldest are dropped.
const MAX_PENDING_PACKETS: usize = 8192;

/// Result of one pull attempt.
#[derive(Debug)]
pub enum FrameRead<T> {
    /// A decoded unit
    Available(T),
    /// Transient: the decoder wants more input, call again
    NotReady,
    /// The stream is finished; latched until the next seek
    EndOfStream,
}

impl<T> FrameRead<T> {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, FrameRead::EndOfStream)
    }
}

enum Feed {
    Sent,
    Exhausted,
}

struct StreamSlot<P> {
    pending: VecDeque<P>,
    ended: bool,
    eof_sent: bool,
    /// Newest decode timestamp read from the cursor for this stream
    last_seen_dts: Option<i64>,
    /// Packets at or before this dts are replays after a single-stream seek
    replay_guard: Option<i64>,
}

impl<P> StreamSlot<P> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            ended: false,
            eof_sent: false,
            last_seen_dts: None,
            replay_guard: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn observe(&mut self, dts: Option<i64>) {
        if let Some(dts) = dts {
            self.last_seen_dts = Some(self.last_seen_dts.map_or(dts, |seen| seen.max(dts)));
        }
    }
}

/// Decoded frames out of one container, one unit per call.
pub struct FrameSource<B: MediaBackend> {
    backend: B,
    timing: FrameTiming,
    audio_enabled: bool,
    input_exhausted: bool,
    /// Video frames the backend discarded since the last `take_dropped_video`
    dropped_video: u64,
    video: StreamSlot<B::Packet>,
    audio: StreamSlot<B::Packet>,
}

impl<B: MediaBackend> FrameSource<B> {
    /// Wraps a backend whose decoders are already initialized.
    pub fn new(backend: B) -> Self {
        let info = backend.media_info();
        let timing = info.timing();
        let audio_enabled = info.audio.is_some();
        Self {
            backend,
            timing,
            audio_enabled,
            input_exhausted: false,
            dropped_video: 0,
            video: StreamSlot::new(),
            audio: StreamSlot::new(),
        }
    }

    pub fn media_info(&self) -> &MediaInfo {
        self.backend.media_info()
    }

    pub fn timing(&self) -> FrameTiming {
        self.timing
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Stops parking audio packets, e.g. when no sink consumes them.
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled && self.backend.media_info().audio.is_some();
        if !self.audio_enabled {
            self.audio.pending.clear();
        }
    }

    pub fn is_ended(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Video => self.video.ended,
            StreamKind::Audio => self.audio.ended || !self.audio_enabled,
        }
    }

    pub fn pending_len(&self, stream: StreamKind) -> usize {
        self.slot_ref(stream).pending.len()
    }

    /// Video frames decoded but discarded as unconvertible since the last
    /// call.
    pub fn take_dropped_video(&mut self) -> u64 {
        std::mem::take(&mut self.dropped_video)
    }

    /// Pulls one video frame, stamping its frame index from the timestamp.
    pub fn try_read_video_frame(&mut self) -> Result<FrameRead<VideoFrame>, VideoError> {
        let timing = self.timing;
        Ok(match self.pull(StreamKind::Video, B::receive_video)? {
            FrameRead::Available(mut frame) => {
                frame.set_index(frame.pts().map(|pts| timing.index_of(pts)));
                FrameRead::Available(frame)
            }
            other => other,
        })
    }

    /// Pulls one decoded audio frame.
    pub fn try_read_audio_frame(&mut self) -> Result<FrameRead<AudioFrame>, VideoError> {
        if !self.audio_enabled {
            return Ok(FrameRead::EndOfStream);
        }
        self.pull(StreamKind::Audio, B::receive_audio)
    }

    /// Repositions the shared cursor to the keyframe at or before `timestamp`
    /// (in `stream`'s time base) and resets both decoders and queues.
    pub fn seek(&mut self, stream: StreamKind, timestamp: i64) -> Result<(), VideoError> {
        self.backend.seek(stream, timestamp, SeekFlags::BACKWARD)?;
        self.backend.flush(StreamKind::Video);
        if self.backend.media_info().audio.is_some() {
            self.backend.flush(StreamKind::Audio);
        }
        self.video.reset();
        self.audio.reset();
        self.input_exhausted = false;
        tracing::debug!("FrameSource: seek {:?} to ts {}", stream, timestamp);
        Ok(())
    }

    /// Re-seeks the cursor for one stream only. The other stream keeps its
    /// decoder state; packets it has already seen are skipped when the cursor
    /// replays them.
    pub fn seek_stream(&mut self, stream: StreamKind, timestamp: i64) -> Result<(), VideoError> {
        self.backend.seek(stream, timestamp, SeekFlags::BACKWARD)?;
        self.backend.flush(stream);
        self.slot(stream).reset();
        let other = self.slot(stream.other());
        other.replay_guard = other.last_seen_dts;
        self.input_exhausted = false;
        tracing::debug!(
            "FrameSource: stream seek {:?} to ts {} (replay guard {:?})",
            stream,
            timestamp,
            self.slot_ref(stream.other()).replay_guard
        );
        Ok(())
    }

    fn slot(&mut self, stream: StreamKind) -> &mut StreamSlot<B::Packet> {
        match stream {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }

    fn slot_ref(&self, stream: StreamKind) -> &StreamSlot<B::Packet> {
        match stream {
            StreamKind::Video => &self.video,
            StreamKind::Audio => &self.audio,
        }
    }

    fn latch_end<T>(&mut self, stream: StreamKind) -> FrameRead<T> {
        let slot = self.slot(stream);
        if !slot.ended {
            slot.ended = true;
            slot.pending.clear();
            tracing::debug!("FrameSource: {:?} stream ended", stream);
        }
        FrameRead::EndOfStream
    }

    fn discard<T>(&mut self, stream: StreamKind, err: VideoError) -> FrameRead<T> {
        tracing::warn!("FrameSource: dropping undecodable {:?} frame: {}", stream, err);
        if stream == StreamKind::Video {
            self.dropped_video += 1;
        }
        FrameRead::NotReady
    }

    fn pull<T>(
        &mut self,
        stream: StreamKind,
        receive: fn(&mut B) -> Receive<T>,
    ) -> Result<FrameRead<T>, VideoError> {
        if self.slot_ref(stream).ended {
            return Ok(FrameRead::EndOfStream);
        }

        match receive(&mut self.backend) {
            Receive::Frame(unit) => return Ok(FrameRead::Available(unit)),
            Receive::EndOfStream => return Ok(self.latch_end(stream)),
            Receive::Dropped(err) => return Ok(self.discard(stream, err)),
            Receive::Failed(err) => return Err(err),
            Receive::NeedsInput => {}
        }

        if self.slot_ref(stream).eof_sent {
            return Ok(self.latch_end(stream));
        }

        match self.feed(stream)? {
            Feed::Sent => match receive(&mut self.backend) {
                Receive::Frame(unit) => Ok(FrameRead::Available(unit)),
                Receive::NeedsInput => Ok(FrameRead::NotReady),
                Receive::EndOfStream => Ok(self.latch_end(stream)),
                Receive::Dropped(err) => Ok(self.discard(stream, err)),
                Receive::Failed(err) => Err(err),
            },
            Feed::Exhausted => {
                if let Err(err) = self.backend.send_eof(stream) {
                    tracing::debug!("FrameSource: send_eof({:?}) rejected: {}", stream, err);
                }
                self.slot(stream).eof_sent = true;
                match receive(&mut self.backend) {
                    Receive::Frame(unit) => Ok(FrameRead::Available(unit)),
                    Receive::Dropped(err) => Ok(self.discard(stream, err)),
                    Receive::Failed(err) => Err(err),
                    Receive::NeedsInput | Receive::EndOfStream => Ok(self.latch_end(stream)),
                }
            }
        }
    }

    /// Hands one packet to `stream`'s decoder, reading through the cursor and
    /// parking packets for the other stream as needed.
    fn feed(&mut self, stream: StreamKind) -> Result<Feed, VideoError> {
        if let Some(packet) = self.slot(stream).pending.pop_front() {
            self.backend.send_packet(stream, &packet)?;
            return Ok(Feed::Sent);
        }
        if self.input_exhausted {
            return Ok(Feed::Exhausted);
        }

        loop {
            let (kind, packet) = match self.backend.read_packet() {
                Ok(Some(read)) => read,
                Ok(None) => {
                    self.input_exhausted = true;
                    return Ok(Feed::Exhausted);
                }
                Err(err) => {
                    tracing::warn!("FrameSource: read failed, treating as end of input: {}", err);
                    self.input_exhausted = true;
                    return Ok(Feed::Exhausted);
                }
            };

            let dts = B::packet_dts(&packet);
            let audio_enabled = self.audio_enabled;
            let slot = self.slot(kind);
            if let Some(guard) = slot.replay_guard {
                // Only a packet with a known dts past the guard ends the replay.
                match dts {
                    Some(d) if d > guard => slot.replay_guard = None,
                    _ => {
                        tracing::trace!("FrameSource: dropping replayed {:?} packet dts={:?}", kind, dts);
                        continue;
                    }
                }
            }
            slot.observe(dts);

            if kind == stream {
                self.backend.send_packet(stream, &packet)?;
                return Ok(Feed::Sent);
            }

            if slot.ended || (kind == StreamKind::Audio && !audio_enabled) {
                continue;
            }
            if slot.pending.len() >= MAX_PENDING_PACKETS {
                slot.pending.pop_front();
                tracing::warn!(
                    "FrameSource: {:?} pending queue full, dropping oldest packet",
                    kind
                );
            }
            slot.pending.push_back(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticBackend, SyntheticConfig};
    use std::time::Duration;

    fn source(config: SyntheticConfig) -> FrameSource<SyntheticBackend> {
        let mut backend = SyntheticBackend::new(config);
        let Ok(()) = backend.init_decoders() else {
            panic!("init failed");
        };
        FrameSource::new(backend)
    }

    fn next_video(source: &mut FrameSource<SyntheticBackend>) -> Option<VideoFrame> {
        for _ in 0..10_000 {
            match source.try_read_video_frame() {
                Ok(FrameRead::Available(frame)) => return Some(frame),
                Ok(FrameRead::NotReady) => continue,
                Ok(FrameRead::EndOfStream) => return None,
                Err(err) => panic!("decode error: {err}"),
            }
        }
        panic!("no progress");
    }

    #[test]
    fn test_video_frames_arrive_in_order_with_indices() {
        let mut source = source(SyntheticConfig::default());
        for expected in 0..50 {
            let Some(frame) = next_video(&mut source) else {
                panic!("stream ended early");
            };
            assert_eq!(frame.index(), Some(expected));
        }
    }

    #[test]
    fn test_other_stream_packets_are_parked_not_lost() {
        let mut source = source(SyntheticConfig::default());
        for _ in 0..30 {
            assert!(next_video(&mut source).is_some());
        }
        assert!(source.pending_len(StreamKind::Audio) > 0);

        // One second of video has been read; all audio before it must still
        // come out in order.
        let mut expected_pts = 0;
        for _ in 0..40 {
            let audio = loop {
                match source.try_read_audio_frame() {
                    Ok(FrameRead::Available(frame)) => break frame,
                    Ok(FrameRead::NotReady) => continue,
                    other => panic!("unexpected {other:?}"),
                }
            };
            assert_eq!(audio.pts, Some(expected_pts));
            expected_pts += audio.samples as i64;
        }
    }

    #[test]
    fn test_end_of_stream_drains_decoder_then_latches() {
        let mut source = source(SyntheticConfig {
            duration: Duration::from_secs(1),
            audio: None,
            ..SyntheticConfig::default()
        });
        let mut count = 0;
        while next_video(&mut source).is_some() {
            count += 1;
        }
        assert_eq!(count, 30);
        assert!(source.is_ended(StreamKind::Video));
        let reads_before = source.backend().stats().packets_read();
        assert!(matches!(source.try_read_video_frame(), Ok(FrameRead::EndOfStream)));
        assert_eq!(source.backend().stats().packets_read(), reads_before);
    }

    #[test]
    fn test_fatal_decode_error_is_returned() {
        let mut source = source(SyntheticConfig {
            fatal_at: Some(5),
            audio: None,
            ..SyntheticConfig::default()
        });
        let mut saw_error = false;
        for _ in 0..100 {
            match source.try_read_video_frame() {
                Err(VideoError::DecodeFailed(_)) => {
                    saw_error = true;
                    break;
                }
                Err(other) => panic!("unexpected error {other}"),
                Ok(_) => {}
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn test_seek_resets_end_of_stream() {
        let mut source = source(SyntheticConfig {
            duration: Duration::from_secs(2),
            audio: None,
            ..SyntheticConfig::default()
        });
        while next_video(&mut source).is_some() {}
        let ts = source.timing().timestamp_of(40);
        let Ok(()) = source.seek(StreamKind::Video, ts) else {
            panic!("seek failed");
        };
        assert!(!source.is_ended(StreamKind::Video));
        let Some(frame) = next_video(&mut source) else {
            panic!("no frame after seek");
        };
        assert_eq!(frame.index(), Some(30));
    }

    #[test]
    fn test_stream_seek_does_not_replay_other_stream() {
        let mut source = source(SyntheticConfig::default());
        let mut last = 0;
        for _ in 0..45 {
            let Some(frame) = next_video(&mut source) else {
                panic!("stream ended early");
            };
            last = frame.index().unwrap_or(-1);
        }
        let Ok(()) = source.seek_stream(StreamKind::Audio, 48000) else {
            panic!("seek failed");
        };
        for _ in 0..30 {
            let Some(frame) = next_video(&mut source) else {
                panic!("stream ended early");
            };
            let index = frame.index().unwrap_or(-1);
            assert_eq!(index, last + 1, "video replayed or skipped a frame");
            last = index;
        }
    }

    #[test]
    fn test_undecodable_frame_is_skipped_and_counted() {
        let mut source = source(SyntheticConfig {
            audio: None,
            corrupt_frames: vec![3],
            ..SyntheticConfig::default()
        });
        let mut indices = Vec::new();
        for _ in 0..6 {
            let Some(frame) = next_video(&mut source) else {
                panic!("stream ended early");
            };
            indices.push(frame.index().unwrap_or(-1));
        }
        assert_eq!(indices, vec![0, 1, 2, 4, 5, 6]);
        assert_eq!(source.take_dropped_video(), 1);
        assert_eq!(source.take_dropped_video(), 0);
    }

    #[test]
    fn test_unknown_dts_keeps_replay_guard() {
        let mut source = source(SyntheticConfig {
            unknown_dts: vec![35],
            ..SyntheticConfig::default()
        });
        let mut last = 0;
        for _ in 0..45 {
            let Some(frame) = next_video(&mut source) else {
                panic!("stream ended early");
            };
            last = frame.index().unwrap_or(-1);
        }
        // Rewinds the cursor to the audio packet at 1s, so video 30..=46 is
        // read again; 35 carries no dts.
        let Ok(()) = source.seek_stream(StreamKind::Audio, 48000) else {
            panic!("seek failed");
        };
        for _ in 0..30 {
            let Some(frame) = next_video(&mut source) else {
                panic!("stream ended early");
            };
            let index = frame.index().unwrap_or(-1);
            assert_eq!(index, last + 1, "video replayed or skipped a frame");
            last = index;
        }
    }
}
