//! Audio types, the output sink boundary and the playback clock.
//!
//! The engine never owns an audio device directly. Decoded audio is converted
//! to interleaved S16 PCM and pushed into an [`AudioSink`]; the sink's byte
//! position is the master clock for video pacing ([`PlaybackClock`]).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::video::Rational;

/// Audio output errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    /// No output device could be opened
    #[error("No audio output device available: {0}")]
    DeviceUnavailable(String),
    /// The device rejected the requested stream
    #[error("Audio output init failed: {0}")]
    InitFailed(String),
    /// Sample layout the converter cannot handle
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
}

/// Sample encoding of a decoded audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// One decoded unit of audio as it leaves the codec.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Presentation timestamp in `time_base` units
    pub pts: Option<i64>,
    pub time_base: Rational,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    /// One plane per channel when true, a single interleaved plane otherwise
    pub planar: bool,
    /// Samples per channel
    pub samples: usize,
    pub planes: Vec<Vec<u8>>,
}

impl AudioFrame {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples as f64 / self.sample_rate as f64)
    }

    /// Start of this frame in seconds relative to `start_pts`.
    pub fn start_seconds(&self, start_pts: i64) -> Option<f64> {
        if self.time_base.den == 0 {
            return None;
        }
        self.pts.map(|pts| {
            (pts - start_pts) as f64 * self.time_base.num as f64 / self.time_base.den as f64
        })
    }
}

/// PCM layout accepted by a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// Interleaved signed 16-bit PCM, what the converter produces.
    pub fn s16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    /// Bytes per sample frame (all channels).
    pub fn block_align(&self) -> u64 {
        self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.block_align()
    }

    pub fn bytes_for(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.bytes_per_second() as f64) as u64
    }

    pub fn duration_of(&self, bytes: u64) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / bps as f64)
    }
}

/// Interleaved PCM ready for a sink.
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub data: Vec<u8>,
    pub format: AudioFormat,
    /// Start of the block on the media timeline, when known
    pub start_seconds: Option<f64>,
}

impl AudioSamples {
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.data.len() as u64)
    }

    /// Drops the samples that play before `seconds`, keeping whole sample
    /// frames. Returns the number of bytes removed.
    pub fn trim_before(&mut self, seconds: f64) -> usize {
        let Some(start) = self.start_seconds else {
            return 0;
        };
        if seconds <= start {
            return 0;
        }
        let align = self.format.block_align().max(1);
        let frames = ((seconds - start) * self.format.sample_rate as f64).round() as u64;
        let cut = ((frames * align) as usize).min(self.data.len());
        self.data.drain(..cut);
        self.start_seconds = Some(start + self.format.duration_of(cut as u64).as_secs_f64());
        cut
    }
}

/// Push-style audio output device.
///
/// Position is monotonic: [`flush`](Self::flush) drops queued data without
/// moving it, and [`skip`](Self::skip) advances it without playing.
pub trait AudioSink: Send + Sync {
    fn init(&self, format: AudioFormat, latency: Duration) -> Result<(), AudioError>;

    /// Format given to `init`, if initialized.
    fn format(&self) -> Option<AudioFormat>;

    fn push_samples(&self, bytes: &[u8]);

    /// Bytes played since `init`, including silence after an underrun.
    fn position_bytes(&self) -> u64;

    /// Audio queued but not yet played.
    fn buffered_duration(&self) -> Duration;

    fn start(&self);

    fn pause(&self);

    fn resume(&self);

    fn is_playing(&self) -> bool;

    /// Discards all queued audio.
    fn flush(&self);

    /// Advances the position by `bytes` without playing them. Bytes beyond
    /// what is queued are dropped from the next pushes.
    fn skip(&self, bytes: u64);
}

/// How a [`VirtualSink`] advances its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Advances with a monotonic clock while playing
    RealTime,
    /// Advances only through [`VirtualSink::advance`]
    Manual,
}

/// A software audio device.
///
/// Accepts PCM, discards it as it "plays" and reports a position that behaves
/// like a hardware output: it advances at the byte rate while playing, keeps
/// advancing through silence on underrun and freezes while paused. Used as the
/// clock for video-only media, for headless playback and in tests.
pub struct VirtualSink {
    mode: ClockMode,
    state: Mutex<VirtualState>,
}

#[derive(Debug, Default)]
struct VirtualState {
    format: Option<AudioFormat>,
    /// Position accumulated up to `anchor`
    played: u64,
    /// Set while playing (real-time mode)
    anchor: Option<Instant>,
    playing: bool,
    /// Absolute position at which queued data ends
    queue_end: u64,
    /// Bytes still to drop from future pushes
    skip_debt: u64,
    total_pushed: u64,
}

impl VirtualState {
    fn position(&self) -> u64 {
        let bps = self.format.map(|f| f.bytes_per_second()).unwrap_or(0);
        match self.anchor {
            Some(anchor) => self.played + (anchor.elapsed().as_secs_f64() * bps as f64) as u64,
            None => self.played,
        }
    }

    fn freeze(&mut self) {
        self.played = self.position();
        self.anchor = None;
    }
}

impl VirtualSink {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            state: Mutex::new(VirtualState::default()),
        }
    }

    pub fn real_time() -> Arc<Self> {
        Arc::new(Self::new(ClockMode::RealTime))
    }

    pub fn manual() -> Arc<Self> {
        Arc::new(Self::new(ClockMode::Manual))
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Moves a manual clock forward by `duration`, whether or not it is
    /// playing. No-op in real-time mode.
    pub fn advance(&self, duration: Duration) {
        if self.mode != ClockMode::Manual {
            return;
        }
        let mut state = self.state.lock();
        let bytes = state.format.map(|f| f.bytes_for(duration)).unwrap_or(0);
        state.played += bytes;
    }

    /// Sets a manual clock to an absolute media time.
    pub fn set_position(&self, position: Duration) {
        if self.mode != ClockMode::Manual {
            return;
        }
        let mut state = self.state.lock();
        state.played = state.format.map(|f| f.bytes_for(position)).unwrap_or(0);
    }

    /// Total bytes accepted by `push_samples` after skip debt.
    pub fn total_pushed(&self) -> u64 {
        self.state.lock().total_pushed
    }
}

impl AudioSink for VirtualSink {
    fn init(&self, format: AudioFormat, latency: Duration) -> Result<(), AudioError> {
        if format.bytes_per_second() == 0 {
            return Err(AudioError::UnsupportedFormat(format!("{format:?}")));
        }
        *self.state.lock() = VirtualState {
            format: Some(format),
            ..VirtualState::default()
        };
        tracing::debug!(
            "VirtualSink initialized: {}Hz {}ch {}bit, latency {:?}, {:?}",
            format.sample_rate,
            format.channels,
            format.bits_per_sample,
            latency,
            self.mode
        );
        Ok(())
    }

    fn format(&self) -> Option<AudioFormat> {
        self.state.lock().format
    }

    fn push_samples(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        let mut len = bytes.len() as u64;
        let dropped = state.skip_debt.min(len);
        state.skip_debt -= dropped;
        len -= dropped;
        if len == 0 {
            return;
        }
        let position = state.position();
        if state.queue_end < position {
            state.queue_end = position;
        }
        state.queue_end += len;
        state.total_pushed += len;
    }

    fn position_bytes(&self) -> u64 {
        self.state.lock().position()
    }

    fn buffered_duration(&self) -> Duration {
        let state = self.state.lock();
        let Some(format) = state.format else {
            return Duration::ZERO;
        };
        format.duration_of(state.queue_end.saturating_sub(state.position()))
    }

    fn start(&self) {
        self.resume();
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        state.freeze();
        state.playing = false;
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        if state.playing {
            return;
        }
        state.playing = true;
        if self.mode == ClockMode::RealTime {
            state.anchor = Some(Instant::now());
        }
    }

    fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        state.queue_end = state.position();
        state.skip_debt = 0;
    }

    fn skip(&self, bytes: u64) {
        let mut state = self.state.lock();
        let position = state.position();
        let queued = state.queue_end.saturating_sub(position);
        state.skip_debt += bytes.saturating_sub(queued);
        state.played += bytes;
        if state.queue_end < state.position() {
            state.queue_end = state.position();
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Rebase {
    seconds: f64,
    bytes: u64,
}

/// Media time derived from the audio sink.
///
/// `seconds = rebase_seconds + (position_bytes - rebase_bytes) / bytes_per_second`.
/// The rebase point is recorded whenever the audio timeline is re-anchored
/// (seek), so the sink position itself never has to jump backwards.
pub struct PlaybackClock {
    sink: Arc<dyn AudioSink>,
    rebase: Mutex<Rebase>,
    paused_at: Mutex<Option<f64>>,
}

impl PlaybackClock {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            rebase: Mutex::new(Rebase::default()),
            paused_at: Mutex::new(None),
        }
    }

    pub fn sink(&self) -> &Arc<dyn AudioSink> {
        &self.sink
    }

    /// Current audio position in seconds on the media timeline.
    pub fn audio_seconds(&self) -> f64 {
        let rebase = *self.rebase.lock();
        let Some(format) = self.sink.format() else {
            return rebase.seconds;
        };
        let bps = format.bytes_per_second();
        if bps == 0 {
            return rebase.seconds;
        }
        let played = self.sink.position_bytes().saturating_sub(rebase.bytes);
        rebase.seconds + played as f64 / bps as f64
    }

    /// Anchors the clock so it reads `seconds` at the sink's current position.
    pub fn rebase(&self, seconds: f64) {
        let bytes = self.sink.position_bytes();
        *self.rebase.lock() = Rebase { seconds, bytes };
        tracing::trace!("PlaybackClock rebased to {:.3}s at byte {}", seconds, bytes);
    }

    /// Pauses the sink and remembers where it stopped.
    pub fn pause(&self) -> f64 {
        self.sink.pause();
        let at = self.audio_seconds();
        *self.paused_at.lock() = Some(at);
        at
    }

    /// Resumes the sink.
    pub fn resume(&self) {
        self.paused_at.lock().take();
        self.sink.resume();
    }

    /// Position recorded by the last [`pause`](Self::pause), cleared on resume.
    pub fn paused_position(&self) -> Option<f64> {
        *self.paused_at.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_sink() -> Arc<VirtualSink> {
        let sink = VirtualSink::manual();
        let Ok(()) = sink.init(AudioFormat::s16(1000, 2), Duration::from_millis(200)) else {
            panic!("init failed");
        };
        sink
    }

    #[test]
    fn test_format_math() {
        let format = AudioFormat::s16(48000, 2);
        assert_eq!(format.block_align(), 4);
        assert_eq!(format.bytes_per_second(), 192_000);
        assert_eq!(format.bytes_for(Duration::from_millis(500)), 96_000);
        assert_eq!(format.duration_of(192_000), Duration::from_secs(1));
    }

    #[test]
    fn test_manual_sink_position_and_buffer() {
        let sink = manual_sink();
        sink.start();
        sink.push_samples(&[0; 4000]);
        assert_eq!(sink.buffered_duration(), Duration::from_secs(1));
        sink.advance(Duration::from_millis(250));
        assert_eq!(sink.position_bytes(), 1000);
        assert_eq!(sink.buffered_duration(), Duration::from_millis(750));
        sink.flush();
        assert_eq!(sink.buffered_duration(), Duration::ZERO);
        assert_eq!(sink.position_bytes(), 1000);
    }

    #[test]
    fn test_skip_consumes_queue_then_future_pushes() {
        let sink = manual_sink();
        sink.push_samples(&[0; 400]);
        sink.skip(1000);
        assert_eq!(sink.position_bytes(), 1000);
        assert_eq!(sink.buffered_duration(), Duration::ZERO);
        sink.push_samples(&[0; 400]);
        assert_eq!(sink.total_pushed(), 400);
        sink.push_samples(&[0; 400]);
        assert_eq!(sink.total_pushed(), 600);
        assert_eq!(sink.buffered_duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_real_time_sink_freezes_when_paused() {
        let sink = VirtualSink::real_time();
        let Ok(()) = sink.init(AudioFormat::s16(48000, 2), Duration::ZERO) else {
            panic!("init failed");
        };
        assert_eq!(sink.position_bytes(), 0);
        sink.start();
        std::thread::sleep(Duration::from_millis(20));
        sink.pause();
        let frozen = sink.position_bytes();
        assert!(frozen > 0);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(sink.position_bytes(), frozen);
    }

    #[test]
    fn test_clock_rebase() {
        let sink = manual_sink();
        let clock = PlaybackClock::new(sink.clone());
        sink.advance(Duration::from_secs(2));
        assert!((clock.audio_seconds() - 2.0).abs() < 1e-9);
        clock.rebase(10.0);
        assert!((clock.audio_seconds() - 10.0).abs() < 1e-9);
        sink.advance(Duration::from_millis(500));
        assert!((clock.audio_seconds() - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_clock_records_pause_position() {
        let sink = manual_sink();
        let clock = PlaybackClock::new(sink.clone());
        sink.advance(Duration::from_secs(1));
        let at = clock.pause();
        assert!((at - 1.0).abs() < 1e-9);
        assert_eq!(clock.paused_position(), Some(at));
        clock.resume();
        assert!(clock.paused_position().is_none());
        assert!(sink.is_playing());
    }

    #[test]
    fn test_trim_before_keeps_whole_frames() {
        let mut samples = AudioSamples {
            data: vec![0; 4000],
            format: AudioFormat::s16(1000, 2),
            start_seconds: Some(1.0),
        };
        assert_eq!(samples.trim_before(0.5), 0);
        assert_eq!(samples.trim_before(1.25), 1000);
        assert_eq!(samples.data.len(), 3000);
        assert_eq!(samples.start_seconds, Some(1.25));
        assert_eq!(samples.trim_before(5.0), 3000);
        assert!(samples.data.is_empty());
    }
}
