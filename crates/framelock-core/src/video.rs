//! Video frame types, frame timing and decode errors.
//!
//! A [`VideoFrame`] is a move-only handle around exactly one decoded image
//! buffer. The buffer is either resident in host memory ([`CpuFrame`]) or still
//! lives on the decode device ([`DeviceSurface`]). Dropping the handle releases
//! the buffer; there is no other disposal path, so a frame is released exactly
//! once no matter which component held it last.
//!
//! Frame numbers are derived from timestamps with [`FrameTiming`], which uses
//! the same round-to-nearest rational rescale in both directions so that
//! `index_of(timestamp_of(n)) == n` for any constant frame rate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

/// Integer frame number derived from a presentation timestamp.
pub type FrameIndex = i64;

/// Errors that can occur while demuxing, decoding or transferring video.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VideoError {
    /// Failed to open the media source
    #[error("Failed to open media: {0}")]
    OpenFailed(String),
    /// Decoder initialization failed
    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),
    /// The decoder returned something outside "frame", "needs input" or "end"
    #[error("Frame decode failed: {0}")]
    DecodeFailed(String),
    /// Decode cursor positioning failed
    #[error("Seek failed: {0}")]
    SeekFailed(String),
    /// Device to host copy or pixel normalization failed for one frame
    #[error("Frame transfer failed: {0}")]
    TransferFailed(String),
    /// Unsupported codec or pixel layout
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Pixel format for decoded video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (most common software decoder output)
    Yuv420p,
    /// NV12 (Y plane + interleaved UV, what hardware decoders download as)
    Nv12,
    /// RGB 24-bit
    Rgb24,
    /// RGBA 32-bit, the canonical presentation format
    Rgba,
    /// BGRA 32-bit
    Bgra,
}

impl PixelFormat {
    /// The single format every presented frame is normalized into.
    pub const CANONICAL: PixelFormat = PixelFormat::Rgba;

    /// Returns the number of planes for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgb24 | PixelFormat::Rgba | PixelFormat::Bgra => 1,
        }
    }

    /// Returns true if this is a YUV-based format requiring conversion.
    pub fn is_yuv(&self) -> bool {
        matches!(self, PixelFormat::Yuv420p | PixelFormat::Nv12)
    }
}

/// A single plane of pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Stride (bytes per row, may include padding)
    pub stride: usize,
}

/// Pixel data addressable from the CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuFrame {
    /// Pixel format of the frame
    pub format: PixelFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel data planes
    pub planes: Vec<Plane>,
}

impl CpuFrame {
    /// Creates a new CpuFrame with the given parameters.
    pub fn new(format: PixelFormat, width: u32, height: u32, planes: Vec<Plane>) -> Self {
        Self {
            format,
            width,
            height,
            planes,
        }
    }

    /// Returns the plane at `index`, if present.
    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }
}

/// A decoded image still resident in decoder (accelerator) memory.
///
/// Backends implement this for their hardware frame type. Downloading must not
/// consume the surface: a failed transfer leaves the frame device-resident.
pub trait DeviceSurface: Send {
    /// Width and height in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Host pixel format the surface downloads into.
    fn download_format(&self) -> PixelFormat;

    /// Copies the surface into host memory.
    fn download(&self) -> Result<CpuFrame, VideoError>;
}

/// Where a frame's pixels currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Regular addressable memory, ready to present
    Host,
    /// Accelerator memory, or a transfer is still in flight
    Device,
}

/// The buffer owned by a [`VideoFrame`].
pub enum FrameBuffer {
    Host(CpuFrame),
    Device(Box<dyn DeviceSurface>),
}

impl FrameBuffer {
    pub fn residency(&self) -> Residency {
        match self {
            FrameBuffer::Host(_) => Residency::Host,
            FrameBuffer::Device(_) => Residency::Device,
        }
    }

    pub fn format(&self) -> PixelFormat {
        match self {
            FrameBuffer::Host(frame) => frame.format,
            FrameBuffer::Device(surface) => surface.download_format(),
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameBuffer::Host(frame) => f
                .debug_struct("Host")
                .field("format", &frame.format)
                .field("width", &frame.width)
                .field("height", &frame.height)
                .finish(),
            FrameBuffer::Device(surface) => f
                .debug_struct("Device")
                .field("format", &surface.download_format())
                .field("dimensions", &surface.dimensions())
                .finish(),
        }
    }
}

/// Counts live frame buffers.
///
/// Backends attach a ledger token to every buffer they allocate; the token is
/// released together with the buffer. After playback stops, `live()` must be 0.
#[derive(Debug, Clone, Default)]
pub struct FrameLedger {
    inner: Arc<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    live: AtomicUsize,
    created: AtomicUsize,
}

impl FrameLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers allocated and not yet released.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Total number of buffers ever allocated.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    fn token(&self) -> LedgerToken {
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        LedgerToken {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct LedgerToken {
    inner: Arc<LedgerInner>,
}

impl Drop for LedgerToken {
    fn drop(&mut self) {
        self.inner.live.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct FrameCell {
    pub(crate) buffer: Mutex<FrameBuffer>,
    _token: Option<LedgerToken>,
}

/// Move-only handle to one decoded video frame.
///
/// Not `Clone`: ownership moves FrameSource -> TransferPipeline -> FrameStore
/// -> Scheduler, and the buffer is released when the last owner drops it.
pub struct VideoFrame {
    pts: Option<i64>,
    index: Option<FrameIndex>,
    width: u32,
    height: u32,
    cell: Arc<FrameCell>,
}

impl VideoFrame {
    /// Creates a frame from a decoded buffer, optionally tracked by `ledger`.
    pub fn new(pts: Option<i64>, buffer: FrameBuffer, ledger: Option<&FrameLedger>) -> Self {
        let (width, height) = match &buffer {
            FrameBuffer::Host(frame) => (frame.width, frame.height),
            FrameBuffer::Device(surface) => surface.dimensions(),
        };
        Self {
            pts,
            index: None,
            width,
            height,
            cell: Arc::new(FrameCell {
                buffer: Mutex::new(buffer),
                _token: ledger.map(FrameLedger::token),
            }),
        }
    }

    /// Convenience constructor for a host-resident frame.
    pub fn host(pts: Option<i64>, frame: CpuFrame) -> Self {
        Self::new(pts, FrameBuffer::Host(frame), None)
    }

    /// Presentation timestamp in stream time base units, `None` if unknown.
    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    /// Frame number derived from the timestamp, stamped by the frame source.
    pub fn index(&self) -> Option<FrameIndex> {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: Option<FrameIndex>) {
        self.index = index;
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Current pixel format; blocks while a transfer is rewriting the buffer.
    pub fn format(&self) -> PixelFormat {
        self.cell.buffer.lock().format()
    }

    /// Current residency. A buffer locked by an in-flight transfer reports
    /// [`Residency::Device`], since it cannot be presented yet.
    pub fn residency(&self) -> Residency {
        match self.cell.buffer.try_lock() {
            Some(buffer) => buffer.residency(),
            None => Residency::Device,
        }
    }

    pub fn is_host_resident(&self) -> bool {
        self.residency() == Residency::Host
    }

    /// Runs `f` against the host pixels, or returns `None` if the frame is not
    /// host-resident (or a transfer currently holds it).
    pub fn with_host_frame<R>(&self, f: impl FnOnce(&CpuFrame) -> R) -> Option<R> {
        let buffer = self.cell.buffer.try_lock()?;
        match &*buffer {
            FrameBuffer::Host(frame) => Some(f(frame)),
            FrameBuffer::Device(_) => None,
        }
    }

    pub(crate) fn cell(&self) -> &FrameCell {
        &self.cell
    }

    /// Weak reference for background transfer; never extends the frame's life.
    pub(crate) fn downgrade(&self) -> Weak<FrameCell> {
        Arc::downgrade(&self.cell)
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("pts", &self.pts)
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("residency", &self.residency())
            .finish()
    }
}

/// A rational number, used for stream time bases and frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    pub fn invert(self) -> Self {
        Self::new(self.den, self.num)
    }
}

impl std::fmt::Display for Rational {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rescales `value` from time base `from` to time base `to`, rounding to the
/// nearest integer with ties away from zero.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let mut num = value as i128 * from.num as i128 * to.den as i128;
    let mut den = from.den as i128 * to.num as i128;
    if den == 0 {
        return 0;
    }
    if den < 0 {
        num = -num;
        den = -den;
    }
    let half = den / 2;
    let q = if num >= 0 {
        (num + half) / den
    } else {
        -((-num + half) / den)
    };
    q.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Frame rate used when a stream reports none.
pub const FALLBACK_FRAME_RATE: Rational = Rational::new(30, 1);

/// Normalizes a stream's reported average frame rate.
///
/// Some muxers write a 33 ms frame duration (1000/33) for NTSC material; that
/// is treated as 29.97. Invalid rates fall back to 30 fps.
pub fn normalize_frame_rate(rate: Rational) -> Rational {
    if !rate.is_valid() {
        return FALLBACK_FRAME_RATE;
    }
    if rate == Rational::new(1000, 33) {
        return Rational::new(30000, 1001);
    }
    rate
}

/// Maps between stream timestamps and frame numbers for one video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// Stream time base (seconds per pts unit)
    pub time_base: Rational,
    /// Nominal frames per second
    pub frame_rate: Rational,
    /// Timestamp of frame 0
    pub start_pts: i64,
}

impl FrameTiming {
    pub fn new(time_base: Rational, frame_rate: Rational, start_pts: i64) -> Self {
        Self {
            time_base,
            frame_rate: normalize_frame_rate(frame_rate),
            start_pts,
        }
    }

    pub fn fps(&self) -> f64 {
        self.frame_rate.as_f64()
    }

    /// Duration of one frame as a rational number of seconds.
    pub fn frame_duration(&self) -> Rational {
        self.frame_rate.invert()
    }

    /// Duration of one frame at the nominal rate.
    pub fn base_frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps().max(1.0))
    }

    /// Frame number of a presentation timestamp.
    pub fn index_of(&self, pts: i64) -> FrameIndex {
        rescale(
            pts.saturating_sub(self.start_pts),
            self.time_base,
            self.frame_duration(),
        )
    }

    /// Presentation timestamp of a frame number.
    pub fn timestamp_of(&self, index: FrameIndex) -> i64 {
        rescale(index, self.frame_duration(), self.time_base).saturating_add(self.start_pts)
    }

    /// Start time of a frame in seconds, relative to frame 0.
    pub fn seconds_of(&self, index: FrameIndex) -> f64 {
        index as f64 / self.fps()
    }

    /// Splits a stream position in seconds into `(frame_number, time_in_frame)`.
    pub fn frame_info(&self, seconds: f64) -> (FrameIndex, Duration) {
        let fps = self.fps();
        let frame = (seconds * fps).floor();
        let offset = (seconds - frame / fps).max(0.0);
        (frame as FrameIndex, Duration::from_secs_f64(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSurface;

    impl DeviceSurface for FailingSurface {
        fn dimensions(&self) -> (u32, u32) {
            (4, 2)
        }

        fn download_format(&self) -> PixelFormat {
            PixelFormat::Nv12
        }

        fn download(&self) -> Result<CpuFrame, VideoError> {
            Err(VideoError::TransferFailed("test".into()))
        }
    }

    fn rgba(width: u32, height: u32) -> CpuFrame {
        CpuFrame::new(
            PixelFormat::Rgba,
            width,
            height,
            vec![Plane {
                data: vec![0; (width * height * 4) as usize],
                stride: width as usize * 4,
            }],
        )
    }

    #[test]
    fn test_pixel_format_planes() {
        assert_eq!(PixelFormat::Yuv420p.num_planes(), 3);
        assert_eq!(PixelFormat::Nv12.num_planes(), 2);
        assert_eq!(PixelFormat::Rgba.num_planes(), 1);
        assert!(PixelFormat::Nv12.is_yuv());
        assert!(!PixelFormat::CANONICAL.is_yuv());
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        let ms = Rational::new(1, 1000);
        let sec = Rational::new(1, 1);
        assert_eq!(rescale(1499, ms, sec), 1);
        assert_eq!(rescale(1500, ms, sec), 2);
        assert_eq!(rescale(-1500, ms, sec), -2);
        assert_eq!(rescale(10, ms, Rational::new(0, 1)), 0);
    }

    #[test]
    fn test_index_timestamp_round_trip() {
        let timings = [
            FrameTiming::new(Rational::new(1, 90000), Rational::new(30000, 1001), 0),
            FrameTiming::new(Rational::new(1, 1000), Rational::new(30000, 1001), 0),
            FrameTiming::new(Rational::new(1, 15360), Rational::new(30, 1), 0),
            FrameTiming::new(Rational::new(1, 12800), Rational::new(25, 1), 1024),
        ];
        for timing in timings {
            for n in [0, 1, 2, 29, 30, 299, 1000, 107_892] {
                assert_eq!(timing.index_of(timing.timestamp_of(n)), n, "{timing:?} n={n}");
            }
        }
    }

    #[test]
    fn test_frame_rate_normalization() {
        assert_eq!(
            normalize_frame_rate(Rational::new(1000, 33)),
            Rational::new(30000, 1001)
        );
        assert_eq!(normalize_frame_rate(Rational::new(0, 1)), FALLBACK_FRAME_RATE);
        assert_eq!(normalize_frame_rate(Rational::new(24, 1)), Rational::new(24, 1));
    }

    #[test]
    fn test_frame_info_splits_position() {
        let timing = FrameTiming::new(Rational::new(1, 1000), Rational::new(30, 1), 0);
        let (frame, offset) = timing.frame_info(50.5 / 30.0);
        assert_eq!(frame, 50);
        assert!((offset.as_secs_f64() - 0.5 / 30.0).abs() < 1e-6);
        assert_eq!(timing.frame_info(0.0).0, 0);
    }

    #[test]
    fn test_ledger_tracks_frame_lifetime() {
        let ledger = FrameLedger::new();
        let frame = VideoFrame::new(Some(0), FrameBuffer::Host(rgba(2, 2)), Some(&ledger));
        let moved = frame;
        assert_eq!(ledger.live(), 1);
        drop(moved);
        assert_eq!(ledger.live(), 0);
        assert_eq!(ledger.created(), 1);
    }

    #[test]
    fn test_weak_reference_does_not_keep_frame_alive() {
        let ledger = FrameLedger::new();
        let frame = VideoFrame::new(
            Some(3),
            FrameBuffer::Device(Box::new(FailingSurface)),
            Some(&ledger),
        );
        let weak = frame.downgrade();
        assert_eq!(frame.residency(), Residency::Device);
        assert_eq!(frame.dimensions(), (4, 2));
        drop(frame);
        assert!(weak.upgrade().is_none());
        assert_eq!(ledger.live(), 0);
    }

    #[test]
    fn test_with_host_frame_requires_host_residency() {
        let host = VideoFrame::host(Some(0), rgba(2, 1));
        assert_eq!(host.with_host_frame(|f| f.width), Some(2));

        let device = VideoFrame::new(None, FrameBuffer::Device(Box::new(FailingSurface)), None);
        assert!(device.with_host_frame(|f| f.width).is_none());
        assert_eq!(device.format(), PixelFormat::Nv12);
    }
}
