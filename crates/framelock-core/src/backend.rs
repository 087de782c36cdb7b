//! The decode service boundary.
//!
//! A [`MediaBackend`] is one opened container with one demux cursor and one
//! decoder per consumed stream. It exposes the raw send/receive codec model;
//! [`FrameSource`](crate::frame_source::FrameSource) builds the pull-one-frame
//! state machine on top of it.
//!
//! Two implementations ship with the crate:
//! - [`SyntheticBackend`](crate::synthetic::SyntheticBackend): a deterministic
//!   in-memory container, always available
//! - `FfmpegBackend`: real demux/decode through ffmpeg-next, behind the
//!   `ffmpeg` feature

use std::path::Path;
use std::time::Duration;

use crate::audio::AudioFrame;
use crate::video::{FrameIndex, FrameLedger, FrameTiming, Rational, VideoError, VideoFrame};

/// Which elementary stream a packet or decoder belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    /// The other consumed stream.
    pub fn other(self) -> Self {
        match self {
            StreamKind::Video => StreamKind::Audio,
            StreamKind::Audio => StreamKind::Video,
        }
    }
}

/// Flags for [`MediaBackend::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekFlags {
    /// Land on the nearest keyframe at or before the timestamp.
    pub backward: bool,
}

impl SeekFlags {
    pub const BACKWARD: SeekFlags = SeekFlags { backward: true };
}

/// Outcome of pulling from a stream decoder without sending new input.
#[derive(Debug)]
pub enum Receive<T> {
    /// A decoded unit
    Frame(T),
    /// The decoder needs another packet first
    NeedsInput,
    /// The decoder has been drained after end-of-input
    EndOfStream,
    /// A unit was decoded but could not be converted; it is discarded and
    /// decoding continues
    Dropped(VideoError),
    /// Anything else; fatal for the current call
    Failed(VideoError),
}

/// Hardware acceleration backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwAccelType {
    /// Software decoding
    #[default]
    None,
    /// NVIDIA CUDA / NVDEC
    Cuda,
    /// Intel Quick Sync
    Qsv,
    /// VA-API (Linux)
    Vaapi,
    /// D3D11 Video Acceleration (Windows)
    D3d11va,
    /// VideoToolbox (macOS)
    VideoToolbox,
}

impl HwAccelType {
    /// Returns the preferred hardware acceleration for the current platform.
    pub fn platform_default() -> Self {
        #[cfg(target_os = "macos")]
        {
            HwAccelType::VideoToolbox
        }
        #[cfg(target_os = "windows")]
        {
            HwAccelType::D3d11va
        }
        #[cfg(target_os = "linux")]
        {
            HwAccelType::Vaapi
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
        {
            HwAccelType::None
        }
    }
}

/// Configuration for hardware-accelerated decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwAccelConfig {
    /// The type of hardware acceleration to use
    pub hw_type: HwAccelType,
    /// Whether to fall back to software if hardware fails
    pub fallback_to_software: bool,
}

impl Default for HwAccelConfig {
    fn default() -> Self {
        Self {
            hw_type: HwAccelType::platform_default(),
            fallback_to_software: true,
        }
    }
}

impl HwAccelConfig {
    /// Creates a config for software-only decoding.
    pub fn software_only() -> Self {
        Self {
            hw_type: HwAccelType::None,
            fallback_to_software: false,
        }
    }

    /// Creates a config for the specified hardware acceleration type.
    pub fn with_hw_type(hw_type: HwAccelType) -> Self {
        Self {
            hw_type,
            fallback_to_software: true,
        }
    }
}

/// Video stream description.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    pub time_base: Rational,
    /// Average frame rate as reported by the container
    pub frame_rate: Rational,
    /// Timestamp of the first frame, in `time_base` units
    pub start_pts: i64,
    /// Frame count from the container header, when present
    pub frame_count: Option<i64>,
    pub codec: String,
}

/// Audio stream description.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub time_base: Rational,
    pub start_pts: i64,
    pub codec: String,
}

/// What `open` learned about a container.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration: Option<Duration>,
    pub video: VideoStreamInfo,
    pub audio: Option<AudioStreamInfo>,
}

impl MediaInfo {
    /// Container duration in whole milliseconds, 0 if unknown.
    pub fn duration_ms(&self) -> u64 {
        self.duration.map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    pub fn timing(&self) -> FrameTiming {
        FrameTiming::new(
            self.video.time_base,
            self.video.frame_rate,
            self.video.start_pts,
        )
    }

    /// Total number of video frames: the header count when known, otherwise
    /// `floor(duration * fps)`.
    pub fn total_frame_count(&self) -> FrameIndex {
        if let Some(count) = self.video.frame_count.filter(|c| *c > 0) {
            return count;
        }
        let fps = self.timing().fps();
        self.duration
            .map(|d| (d.as_secs_f64() * fps).floor() as FrameIndex)
            .unwrap_or(0)
    }
}

/// One opened container: a shared demux cursor plus per-stream decoders.
///
/// Implementations are driven from one thread at a time; the engine wraps
/// the backend in a single mutex shared by the readers and the seek path.
pub trait MediaBackend: Send + Sized + 'static {
    /// Compressed packet type.
    type Packet: Send;

    /// Opens `path` and reads its stream parameters.
    fn open(path: &Path, hw: &HwAccelConfig) -> Result<Self, VideoError>;

    /// Opens the stream decoders. Must be called once before reading.
    fn init_decoders(&mut self) -> Result<(), VideoError>;

    fn media_info(&self) -> &MediaInfo;

    /// Reads the next packet for a consumed stream. `Ok(None)` means the
    /// container is exhausted.
    fn read_packet(&mut self) -> Result<Option<(StreamKind, Self::Packet)>, VideoError>;

    /// Decode timestamp of a packet, used to drop replayed packets.
    fn packet_dts(packet: &Self::Packet) -> Option<i64>;

    fn send_packet(&mut self, stream: StreamKind, packet: &Self::Packet) -> Result<(), VideoError>;

    /// Signals end-of-input so the decoder releases its delayed frames.
    fn send_eof(&mut self, stream: StreamKind) -> Result<(), VideoError>;

    fn receive_video(&mut self) -> Receive<VideoFrame>;

    fn receive_audio(&mut self) -> Receive<AudioFrame>;

    /// Repositions the shared demux cursor using `stream`'s time base.
    fn seek(&mut self, stream: StreamKind, timestamp: i64, flags: SeekFlags)
        -> Result<(), VideoError>;

    /// Drops all decoder-internal state for `stream`.
    fn flush(&mut self, stream: StreamKind);

    /// Hardware acceleration actually in use.
    fn hw_accel_type(&self) -> HwAccelType {
        HwAccelType::None
    }

    /// Ledger of the frame buffers this backend allocated, if it keeps one.
    fn frame_ledger(&self) -> Option<&FrameLedger> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(duration: Option<Duration>, frame_count: Option<i64>) -> MediaInfo {
        MediaInfo {
            duration,
            video: VideoStreamInfo {
                width: 16,
                height: 16,
                time_base: Rational::new(1, 90000),
                frame_rate: Rational::new(30, 1),
                start_pts: 0,
                frame_count,
                codec: "test".into(),
            },
            audio: None,
        }
    }

    #[test]
    fn test_total_frame_count_from_duration() {
        let info = info(Some(Duration::from_secs(10)), None);
        assert_eq!(info.total_frame_count(), 300);
        assert_eq!(info.duration_ms(), 10_000);
    }

    #[test]
    fn test_total_frame_count_prefers_header() {
        let info = info(Some(Duration::from_secs(10)), Some(299));
        assert_eq!(info.total_frame_count(), 299);
        assert_eq!(self::info(None, None).total_frame_count(), 0);
    }

    #[test]
    fn test_hw_accel_config_default() {
        let config = HwAccelConfig::default();
        assert!(config.fallback_to_software);
        assert_eq!(HwAccelConfig::software_only().hw_type, HwAccelType::None);
        assert_eq!(StreamKind::Video.other(), StreamKind::Audio);
    }
}
