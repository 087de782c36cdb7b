//! Deterministic in-memory decode service.
//!
//! `SyntheticBackend` models a real container closely enough to exercise the
//! whole engine without system libraries:
//! - one interleaved packet list (video and audio sorted by time) read through
//!   a single cursor
//! - keyframes every `gop` frames; after a flush the video decoder drops output
//!   until it sees a keyframe
//! - a decoder delay, so the last frames only come out after end-of-input
//! - optional device-resident output whose download can be made to fail
//! - injected faults: missing frames, lost timestamps, frames the decoder
//!   discards, and a fatal bitstream error
//!
//! Open with a URI such as `synthetic://clip?fps=24&seconds=5&hw=1`; unknown
//! paths fall back to the defaults (30 fps, 10 s, 48 kHz stereo audio).

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{AudioFrame, SampleFormat};
use crate::backend::{
    AudioStreamInfo, HwAccelConfig, HwAccelType, MediaBackend, MediaInfo, Receive, SeekFlags,
    StreamKind, VideoStreamInfo,
};
use crate::video::{
    CpuFrame, DeviceSurface, FrameBuffer, FrameIndex, FrameLedger, FrameTiming, PixelFormat,
    Plane, Rational, VideoError, VideoFrame,
};

/// Audio track of a synthetic container.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_packet: usize,
}

impl Default for SyntheticAudio {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            samples_per_packet: 1024,
        }
    }
}

/// Shape of a synthetic container.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub time_base: Rational,
    pub duration: Duration,
    /// Keyframe interval in frames
    pub gop: u32,
    /// Frames the video decoder holds before emitting output
    pub decoder_delay: usize,
    pub audio: Option<SyntheticAudio>,
    /// Emit device-resident frames
    pub hardware: bool,
    /// Frames whose device download fails
    pub failing_transfers: Vec<FrameIndex>,
    /// Frames absent from the container
    pub missing_frames: Vec<FrameIndex>,
    /// Frames whose timestamp is lost
    pub unknown_pts: Vec<FrameIndex>,
    /// Frames whose packet carries no decode timestamp
    pub unknown_dts: Vec<FrameIndex>,
    /// Frames the decoder outputs in a layout it cannot convert
    pub corrupt_frames: Vec<FrameIndex>,
    /// Frame whose decode fails fatally
    pub fatal_at: Option<FrameIndex>,
    pub start_pts: i64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 36,
            frame_rate: Rational::new(30, 1),
            time_base: Rational::new(1, 90000),
            duration: Duration::from_secs(10),
            gop: 30,
            decoder_delay: 2,
            audio: Some(SyntheticAudio::default()),
            hardware: false,
            failing_transfers: Vec::new(),
            missing_frames: Vec::new(),
            unknown_pts: Vec::new(),
            unknown_dts: Vec::new(),
            corrupt_frames: Vec::new(),
            fatal_at: None,
            start_pts: 0,
        }
    }
}

impl SyntheticConfig {
    /// Parses `synthetic://name?key=value&...`. Recognized keys: `fps`,
    /// `seconds`, `width`, `height`, `gop`, `hw`, `audio`.
    pub fn from_uri(uri: &str) -> Self {
        let mut config = Self::default();
        let Some((_, query)) = uri.split_once('?') else {
            return config;
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "1"));
            let parsed = match key {
                "fps" => value.parse().map(|v| config.frame_rate = Rational::new(v, 1)).is_ok(),
                "seconds" => value
                    .parse::<f64>()
                    .map(|v| config.duration = Duration::from_secs_f64(v.max(0.0)))
                    .is_ok(),
                "width" => value.parse().map(|v| config.width = v).is_ok(),
                "height" => value.parse().map(|v| config.height = v).is_ok(),
                "gop" => value.parse::<u32>().map(|v| config.gop = v.max(1)).is_ok(),
                "hw" => {
                    config.hardware = value != "0";
                    true
                }
                "audio" => {
                    if value == "0" {
                        config.audio = None;
                    }
                    true
                }
                _ => false,
            };
            if !parsed {
                tracing::warn!("Ignoring synthetic option {key}={value}");
            }
        }
        config
    }

    fn timing(&self) -> FrameTiming {
        FrameTiming::new(self.time_base, self.frame_rate, self.start_pts)
    }

    fn frame_count(&self) -> FrameIndex {
        (self.duration.as_secs_f64() * self.timing().fps()).floor() as FrameIndex
    }
}

/// Counters shared with tests and diagnostics; survives the backend moving
/// into a player.
#[derive(Debug, Clone, Default)]
pub struct SyntheticStats {
    pub ledger: FrameLedger,
    seeks: Arc<AtomicUsize>,
    packets: Arc<AtomicUsize>,
    downloads: Arc<AtomicUsize>,
}

impl SyntheticStats {
    /// Calls to `MediaBackend::seek`.
    pub fn seek_calls(&self) -> usize {
        self.seeks.load(Ordering::SeqCst)
    }

    pub fn packets_read(&self) -> usize {
        self.packets.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

/// A compressed packet of the synthetic container.
#[derive(Debug, Clone)]
pub struct SyntheticPacket {
    pts: i64,
    dts: Option<i64>,
    keyframe: bool,
    /// Frame number for video, packet number for audio
    ordinal: i64,
}

#[derive(Debug)]
struct Entry {
    stream: StreamKind,
    seconds: f64,
    packet: SyntheticPacket,
}

#[derive(Debug, Default)]
struct VideoDecoder {
    output: VecDeque<SyntheticPacket>,
    awaiting_keyframe: bool,
    eof: bool,
    failure: Option<VideoError>,
}

#[derive(Debug, Default)]
struct AudioDecoder {
    output: VecDeque<SyntheticPacket>,
    eof: bool,
}

/// The synthetic decode service.
pub struct SyntheticBackend {
    config: SyntheticConfig,
    info: MediaInfo,
    entries: Vec<Entry>,
    cursor: usize,
    decoders_ready: bool,
    video: VideoDecoder,
    audio: AudioDecoder,
    stats: SyntheticStats,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        let timing = config.timing();
        let frame_count = config.frame_count();
        let mut entries = Vec::new();

        for n in 0..frame_count {
            if config.missing_frames.contains(&n) {
                continue;
            }
            entries.push(Entry {
                stream: StreamKind::Video,
                seconds: timing.seconds_of(n),
                packet: SyntheticPacket {
                    pts: timing.timestamp_of(n),
                    dts: (!config.unknown_dts.contains(&n)).then(|| timing.timestamp_of(n)),
                    keyframe: n % config.gop.max(1) as i64 == 0,
                    ordinal: n,
                },
            });
        }

        if let Some(audio) = &config.audio {
            let per_packet = audio.samples_per_packet.max(1) as i64;
            let total = (config.duration.as_secs_f64() * audio.sample_rate as f64) as i64;
            let mut ordinal = 0;
            while ordinal * per_packet < total {
                let first_sample = ordinal * per_packet;
                entries.push(Entry {
                    stream: StreamKind::Audio,
                    seconds: first_sample as f64 / audio.sample_rate as f64,
                    packet: SyntheticPacket {
                        pts: first_sample,
                        dts: Some(first_sample),
                        keyframe: true,
                        ordinal,
                    },
                });
                ordinal += 1;
            }
        }

        // Stable: audio pushed after video, so video wins ties.
        entries.sort_by(|a, b| a.seconds.total_cmp(&b.seconds));

        let info = MediaInfo {
            duration: Some(config.duration),
            video: VideoStreamInfo {
                width: config.width,
                height: config.height,
                time_base: config.time_base,
                frame_rate: config.frame_rate,
                start_pts: config.start_pts,
                frame_count: None,
                codec: "synthetic".to_string(),
            },
            audio: config.audio.as_ref().map(|a| AudioStreamInfo {
                sample_rate: a.sample_rate,
                channels: a.channels,
                time_base: Rational::new(1, a.sample_rate as i32),
                start_pts: 0,
                codec: "pcm_f32le".to_string(),
            }),
        };

        Self {
            config,
            info,
            entries,
            cursor: 0,
            decoders_ready: false,
            video: VideoDecoder::default(),
            audio: AudioDecoder::default(),
            stats: SyntheticStats::default(),
        }
    }

    pub fn stats(&self) -> SyntheticStats {
        self.stats.clone()
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn make_frame(&self, packet: &SyntheticPacket) -> VideoFrame {
        let n = packet.ordinal;
        let pts = (!self.config.unknown_pts.contains(&n)).then_some(packet.pts);
        let buffer = if self.config.hardware {
            FrameBuffer::Device(Box::new(SyntheticSurface {
                width: self.config.width,
                height: self.config.height,
                ordinal: n,
                fail: self.config.failing_transfers.contains(&n),
                downloads: Arc::clone(&self.stats.downloads),
            }))
        } else {
            FrameBuffer::Host(gradient_frame(self.config.width, self.config.height, n))
        };
        VideoFrame::new(pts, buffer, Some(&self.stats.ledger))
    }

    fn make_audio(&self, packet: &SyntheticPacket) -> Option<AudioFrame> {
        let audio = self.config.audio.as_ref()?;
        let samples = audio.samples_per_packet;
        let planes = (0..audio.channels)
            .map(|ch| {
                (0..samples)
                    .flat_map(|i| {
                        let t = (packet.pts + i as i64) as f32 / audio.sample_rate as f32;
                        let hz = 440.0 * (ch as f32 + 1.0);
                        (0.25 * (t * hz * std::f32::consts::TAU).sin()).to_le_bytes()
                    })
                    .collect()
            })
            .collect();
        Some(AudioFrame {
            pts: Some(packet.pts),
            time_base: Rational::new(1, audio.sample_rate as i32),
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            format: SampleFormat::F32,
            planar: true,
            samples,
            planes,
        })
    }

    fn stream_seconds(&self, stream: StreamKind, timestamp: i64) -> f64 {
        match stream {
            StreamKind::Video => {
                (timestamp - self.config.start_pts) as f64 * self.config.time_base.num as f64
                    / self.config.time_base.den as f64
            }
            StreamKind::Audio => {
                let rate = self.config.audio.as_ref().map(|a| a.sample_rate).unwrap_or(1);
                timestamp as f64 / rate as f64
            }
        }
    }
}

impl MediaBackend for SyntheticBackend {
    type Packet = SyntheticPacket;

    fn open(path: &Path, hw: &HwAccelConfig) -> Result<Self, VideoError> {
        let uri = path.to_string_lossy();
        let mut config = SyntheticConfig::from_uri(&uri);
        if hw.hw_type != HwAccelType::None {
            config.hardware = true;
        }
        tracing::info!(
            "SyntheticBackend: opening {} ({}x{} @ {} fps, {:?}, hw={})",
            uri,
            config.width,
            config.height,
            config.frame_rate,
            config.duration,
            config.hardware
        );
        Ok(Self::new(config))
    }

    fn init_decoders(&mut self) -> Result<(), VideoError> {
        self.decoders_ready = true;
        Ok(())
    }

    fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<(StreamKind, Self::Packet)>, VideoError> {
        if !self.decoders_ready {
            return Err(VideoError::DecoderInit("decoders not initialized".into()));
        }
        let Some(entry) = self.entries.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        self.stats.packets.fetch_add(1, Ordering::Relaxed);
        Ok(Some((entry.stream, entry.packet.clone())))
    }

    fn packet_dts(packet: &Self::Packet) -> Option<i64> {
        packet.dts
    }

    fn send_packet(&mut self, stream: StreamKind, packet: &Self::Packet) -> Result<(), VideoError> {
        match stream {
            StreamKind::Video => {
                if self.config.fatal_at == Some(packet.ordinal) {
                    self.video.failure = Some(VideoError::DecodeFailed(format!(
                        "corrupt bitstream at frame {}",
                        packet.ordinal
                    )));
                }
                if self.video.awaiting_keyframe && !packet.keyframe {
                    return Ok(());
                }
                self.video.awaiting_keyframe = false;
                self.video.output.push_back(packet.clone());
            }
            StreamKind::Audio => self.audio.output.push_back(packet.clone()),
        }
        Ok(())
    }

    fn send_eof(&mut self, stream: StreamKind) -> Result<(), VideoError> {
        match stream {
            StreamKind::Video => self.video.eof = true,
            StreamKind::Audio => self.audio.eof = true,
        }
        Ok(())
    }

    fn receive_video(&mut self) -> Receive<VideoFrame> {
        if let Some(err) = self.video.failure.take() {
            return Receive::Failed(err);
        }
        let ready = self.video.output.len() > self.config.decoder_delay
            || (self.video.eof && !self.video.output.is_empty());
        if ready {
            if let Some(packet) = self.video.output.pop_front() {
                if self.config.corrupt_frames.contains(&packet.ordinal) {
                    return Receive::Dropped(VideoError::UnsupportedFormat(format!(
                        "unconvertible layout at frame {}",
                        packet.ordinal
                    )));
                }
                return Receive::Frame(self.make_frame(&packet));
            }
        }
        if self.video.eof {
            Receive::EndOfStream
        } else {
            Receive::NeedsInput
        }
    }

    fn receive_audio(&mut self) -> Receive<AudioFrame> {
        if let Some(packet) = self.audio.output.pop_front() {
            return match self.make_audio(&packet) {
                Some(frame) => Receive::Frame(frame),
                None => Receive::Failed(VideoError::DecodeFailed("no audio track".into())),
            };
        }
        if self.audio.eof {
            Receive::EndOfStream
        } else {
            Receive::NeedsInput
        }
    }

    fn seek(&mut self, stream: StreamKind, timestamp: i64, flags: SeekFlags) -> Result<(), VideoError> {
        self.stats.seeks.fetch_add(1, Ordering::SeqCst);
        let target = self.stream_seconds(stream, timestamp);
        let position = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.stream == stream && e.packet.keyframe)
            .filter(|(_, e)| if flags.backward { e.seconds <= target + 1e-9 } else { true })
            .map(|(i, _)| i)
            .last()
            .unwrap_or(0);
        tracing::trace!(
            "SyntheticBackend: seek {:?} to {:.3}s -> packet {}",
            stream,
            target,
            position
        );
        self.cursor = position;
        Ok(())
    }

    fn flush(&mut self, stream: StreamKind) {
        match stream {
            StreamKind::Video => {
                self.video = VideoDecoder {
                    awaiting_keyframe: true,
                    ..VideoDecoder::default()
                };
            }
            StreamKind::Audio => self.audio = AudioDecoder::default(),
        }
    }

    fn hw_accel_type(&self) -> HwAccelType {
        if self.config.hardware {
            HwAccelType::platform_default()
        } else {
            HwAccelType::None
        }
    }

    fn frame_ledger(&self) -> Option<&FrameLedger> {
        Some(&self.stats.ledger)
    }
}

/// Device-resident frame of the synthetic decoder; downloads as NV12.
struct SyntheticSurface {
    width: u32,
    height: u32,
    ordinal: i64,
    fail: bool,
    downloads: Arc<AtomicUsize>,
}

impl DeviceSurface for SyntheticSurface {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn download_format(&self) -> PixelFormat {
        PixelFormat::Nv12
    }

    fn download(&self) -> Result<CpuFrame, VideoError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(VideoError::TransferFailed(format!(
                "device lost while mapping frame {}",
                self.ordinal
            )));
        }
        let w = self.width as usize;
        let h = self.height as usize;
        let luma = 16 + (self.ordinal % 220) as u8;
        let chroma_stride = w.div_ceil(2) * 2;
        Ok(CpuFrame::new(
            PixelFormat::Nv12,
            self.width,
            self.height,
            vec![
                Plane {
                    data: vec![luma; w * h],
                    stride: w,
                },
                Plane {
                    data: vec![128; chroma_stride * h.div_ceil(2)],
                    stride: chroma_stride,
                },
            ],
        ))
    }
}

/// Gradient test image whose blue channel encodes the frame number.
fn gradient_frame(width: u32, height: u32, ordinal: i64) -> CpuFrame {
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    let b = (ordinal % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let r = ((x as f32 / width.max(1) as f32) * 255.0) as u8;
            let g = ((y as f32 / height.max(1) as f32) * 255.0) as u8;
            pixels.extend_from_slice(&[r, g, b, 255]);
        }
    }
    CpuFrame::new(
        PixelFormat::Rgba,
        width,
        height,
        vec![Plane {
            data: pixels,
            stride: width as usize * 4,
        }],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(config: SyntheticConfig) -> SyntheticBackend {
        let mut backend = SyntheticBackend::new(config);
        let Ok(()) = backend.init_decoders() else {
            panic!("init failed");
        };
        backend
    }

    #[test]
    fn test_from_uri() {
        let config = SyntheticConfig::from_uri("synthetic://clip?fps=24&seconds=2.5&hw=1&audio=0&bogus=3");
        assert_eq!(config.frame_rate, Rational::new(24, 1));
        assert_eq!(config.duration, Duration::from_millis(2500));
        assert!(config.hardware);
        assert!(config.audio.is_none());
        assert_eq!(SyntheticConfig::from_uri("movie.mp4"), SyntheticConfig::default());
    }

    #[test]
    fn test_packets_are_interleaved() {
        let mut backend = ready(SyntheticConfig::default());
        let mut kinds = Vec::new();
        for _ in 0..8 {
            let Ok(Some((kind, _))) = backend.read_packet() else {
                panic!("expected packet");
            };
            kinds.push(kind);
        }
        assert!(kinds.contains(&StreamKind::Video));
        assert!(kinds.contains(&StreamKind::Audio));
        assert_eq!(backend.stats().packets_read(), 8);
    }

    #[test]
    fn test_decoder_delay_and_drain() {
        let mut backend = ready(SyntheticConfig {
            audio: None,
            duration: Duration::from_millis(100),
            ..SyntheticConfig::default()
        });
        let mut decoded = 0;
        while let Ok(Some((kind, packet))) = backend.read_packet() {
            assert_eq!(kind, StreamKind::Video);
            let Ok(()) = backend.send_packet(kind, &packet) else {
                panic!("send failed");
            };
            if let Receive::Frame(_) = backend.receive_video() {
                decoded += 1;
            }
        }
        assert_eq!(decoded, 1);
        let Ok(()) = backend.send_eof(StreamKind::Video) else {
            panic!("eof failed");
        };
        assert!(matches!(backend.receive_video(), Receive::Frame(_)));
        assert!(matches!(backend.receive_video(), Receive::Frame(_)));
        assert!(matches!(backend.receive_video(), Receive::EndOfStream));
    }

    #[test]
    fn test_corrupt_frame_is_dropped_not_fatal() {
        let mut backend = ready(SyntheticConfig {
            audio: None,
            decoder_delay: 0,
            corrupt_frames: vec![1],
            ..SyntheticConfig::default()
        });
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let Ok(Some((kind, packet))) = backend.read_packet() else {
                panic!("expected packet");
            };
            let Ok(()) = backend.send_packet(kind, &packet) else {
                panic!("send failed");
            };
            outcomes.push(backend.receive_video());
        }
        assert!(matches!(outcomes[0], Receive::Frame(_)));
        assert!(matches!(outcomes[1], Receive::Dropped(VideoError::UnsupportedFormat(_))));
        assert!(matches!(outcomes[2], Receive::Frame(_)));
        assert_eq!(backend.stats().ledger.live(), 2);
    }

    #[test]
    fn test_seek_lands_on_keyframe() {
        let mut backend = ready(SyntheticConfig {
            audio: None,
            ..SyntheticConfig::default()
        });
        let timing = backend.media_info().timing();
        let Ok(()) = backend.seek(StreamKind::Video, timing.timestamp_of(75), SeekFlags::BACKWARD) else {
            panic!("seek failed");
        };
        let Ok(Some((_, packet))) = backend.read_packet() else {
            panic!("expected packet");
        };
        assert_eq!(packet.ordinal, 60);
        assert_eq!(backend.stats().seek_calls(), 1);
    }

    #[test]
    fn test_failing_surface_download() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            hardware: true,
            failing_transfers: vec![3],
            ..SyntheticConfig::default()
        });
        let frame = backend.make_frame(&SyntheticPacket {
            pts: 0,
            dts: Some(0),
            keyframe: true,
            ordinal: 3,
        });
        assert!(!frame.is_host_resident());
        assert_eq!(backend.stats().ledger.live(), 1);
    }
}
