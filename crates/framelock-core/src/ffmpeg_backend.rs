//! Demux and decode through the system FFmpeg libraries.
//!
//! One `AVFormatContext` is the shared demux cursor; the best video stream and
//! (optionally) the best audio stream each get a decoder. With a hardware
//! device attached, decoded video stays in accelerator memory and is handed
//! out as a [`DeviceSurface`] for the transfer pipeline to download.

use std::path::Path;
use std::ptr;
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::audio::{AudioFrame, SampleFormat};
use crate::backend::{
    AudioStreamInfo, HwAccelConfig, HwAccelType, MediaBackend, MediaInfo, Receive, SeekFlags,
    StreamKind, VideoStreamInfo,
};
use crate::video::{
    normalize_frame_rate, CpuFrame, DeviceSurface, FrameBuffer, PixelFormat, Plane, Rational,
    VideoError, VideoFrame,
};

/// Wrapper for hardware device context buffer reference.
struct HwDeviceCtx {
    ptr: *mut ffi::AVBufferRef,
}

impl HwDeviceCtx {
    fn new(hw_type: ffi::AVHWDeviceType) -> Option<Self> {
        let mut hw_device_ctx: *mut ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut hw_device_ctx,
                hw_type,
                ptr::null(),     // device (NULL = default)
                ptr::null_mut(), // opts
                0,
            )
        };
        if ret < 0 || hw_device_ctx.is_null() {
            tracing::warn!(
                "Failed to create hardware device context for {:?}, error: {}",
                hw_type,
                ret
            );
            None
        } else {
            Some(Self { ptr: hw_device_ctx })
        }
    }
}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                ffi::av_buffer_unref(&mut self.ptr);
            }
        }
    }
}

// SAFETY: exclusive owner of the AVBufferRef; only touched under the
// backend's decoder lock.
unsafe impl Send for HwDeviceCtx {}

/// A decoded frame still in accelerator memory.
struct FfmpegSurface {
    frame: ffmpeg::frame::Video,
}

// SAFETY: the surface owns its AVFrame reference; the frame data is only
// read by `download`, which runs under the frame buffer's mutex.
unsafe impl Send for FfmpegSurface {}

impl DeviceSurface for FfmpegSurface {
    fn dimensions(&self) -> (u32, u32) {
        (self.frame.width(), self.frame.height())
    }

    fn download_format(&self) -> PixelFormat {
        PixelFormat::Nv12
    }

    fn download(&self) -> Result<CpuFrame, VideoError> {
        let mut sw_frame = ffmpeg::frame::Video::empty();
        let ret = unsafe {
            ffi::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), self.frame.as_ptr(), 0)
        };
        if ret < 0 {
            return Err(VideoError::TransferFailed(format!(
                "av_hwframe_transfer_data returned {ret}"
            )));
        }
        to_cpu_frame(&sw_frame, &mut None)
    }
}

/// FFmpeg-backed [`MediaBackend`].
pub struct FfmpegBackend {
    input: ffmpeg::format::context::Input,
    info: MediaInfo,
    video_index: usize,
    audio_index: Option<usize>,
    hw_config: HwAccelConfig,
    video: Option<ffmpeg::decoder::Video>,
    audio: Option<ffmpeg::decoder::Audio>,
    scaler: Option<ffmpeg::software::scaling::Context>,
    active_hw_type: HwAccelType,
    /// Kept alive for the decoder's lifetime
    _hw_device_ctx: Option<HwDeviceCtx>,
}

// SAFETY: FFmpeg contexts are not thread-affine; the engine drives a backend
// from one thread at a time behind its decoder lock.
unsafe impl Send for FfmpegBackend {}

impl FfmpegBackend {
    /// Returns true if hardware acceleration is currently active.
    pub fn is_hw_accel_active(&self) -> bool {
        self.active_hw_type != HwAccelType::None
    }

    fn index_of(&self, stream: StreamKind) -> Option<usize> {
        match stream {
            StreamKind::Video => Some(self.video_index),
            StreamKind::Audio => self.audio_index,
        }
    }

    fn try_init_hw_accel(
        config: &HwAccelConfig,
        context: &mut ffmpeg::codec::context::Context,
    ) -> Result<(Option<HwDeviceCtx>, HwAccelType), VideoError> {
        let device_type = match config.hw_type {
            HwAccelType::None => return Ok((None, HwAccelType::None)),
            HwAccelType::Cuda => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
            HwAccelType::Qsv => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_QSV,
            HwAccelType::Vaapi => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            HwAccelType::D3d11va => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
            HwAccelType::VideoToolbox => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
        };

        if let Some(hw_ctx) = HwDeviceCtx::new(device_type) {
            unsafe {
                let ctx_ptr = context.as_mut_ptr();
                (*ctx_ptr).hw_device_ctx = ffi::av_buffer_ref(hw_ctx.ptr);
            }
            tracing::info!("Hardware acceleration {:?} initialized", config.hw_type);
            Ok((Some(hw_ctx), config.hw_type))
        } else if config.fallback_to_software {
            tracing::warn!(
                "Hardware acceleration {:?} unavailable, falling back to software",
                config.hw_type
            );
            Ok((None, HwAccelType::None))
        } else {
            Err(VideoError::DecoderInit(format!(
                "hardware acceleration {:?} unavailable and fallback disabled",
                config.hw_type
            )))
        }
    }

    fn wrap_video(&mut self, frame: ffmpeg::frame::Video) -> Result<VideoFrame, VideoError> {
        let pts = frame.timestamp().or(frame.pts());
        let is_device = unsafe { !(*frame.as_ptr()).hw_frames_ctx.is_null() };
        let buffer = if is_device {
            FrameBuffer::Device(Box::new(FfmpegSurface { frame }))
        } else {
            FrameBuffer::Host(to_cpu_frame(&frame, &mut self.scaler)?)
        };
        Ok(VideoFrame::new(pts, buffer, None))
    }
}

impl MediaBackend for FfmpegBackend {
    type Packet = ffmpeg::Packet;

    fn open(path: &Path, hw: &HwAccelConfig) -> Result<Self, VideoError> {
        ffmpeg::init().map_err(|e| VideoError::DecoderInit(format!("FFmpeg init failed: {e}")))?;

        let input = ffmpeg::format::input(path).map_err(|e| {
            VideoError::OpenFailed(format!("Failed to open {}: {e}", path.display()))
        })?;

        let video_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| VideoError::OpenFailed("No video stream found".to_string()))?;
        let video_index = video_stream.index();
        let video_params = video_stream.parameters();
        let (width, height) = unsafe {
            let p = video_params.as_ptr();
            ((*p).width.max(0) as u32, (*p).height.max(0) as u32)
        };
        let video = VideoStreamInfo {
            width,
            height,
            time_base: rational(video_stream.time_base()),
            frame_rate: normalize_frame_rate(rational(video_stream.avg_frame_rate())),
            start_pts: video_stream.start_time().max(0),
            frame_count: Some(video_stream.frames()).filter(|n| *n > 0),
            codec: video_params.id().name().to_string(),
        };

        let audio_stream = input.streams().best(ffmpeg::media::Type::Audio);
        let audio_index = audio_stream.as_ref().map(|s| s.index());
        let audio = audio_stream.map(|stream| {
            let params = stream.parameters();
            let (sample_rate, channels) = unsafe {
                let p = params.as_ptr();
                ((*p).sample_rate.max(0) as u32, (*p).ch_layout.nb_channels.max(0) as u16)
            };
            AudioStreamInfo {
                sample_rate,
                channels,
                time_base: rational(stream.time_base()),
                start_pts: stream.start_time().max(0),
                codec: params.id().name().to_string(),
            }
        });

        let duration = (input.duration() > 0).then(|| {
            Duration::from_micros((input.duration() as i128 * 1_000_000 / ffi::AV_TIME_BASE as i128) as u64)
        });

        let info = MediaInfo {
            duration,
            video,
            audio,
        };
        tracing::info!(
            "FfmpegBackend: opened {} ({}x{}, {}, duration {:?}, audio: {})",
            path.display(),
            info.video.width,
            info.video.height,
            info.video.codec,
            info.duration,
            info.audio.as_ref().map(|a| a.codec.as_str()).unwrap_or("none")
        );

        Ok(Self {
            input,
            info,
            video_index,
            audio_index,
            hw_config: hw.clone(),
            video: None,
            audio: None,
            scaler: None,
            active_hw_type: HwAccelType::None,
            _hw_device_ctx: None,
        })
    }

    fn init_decoders(&mut self) -> Result<(), VideoError> {
        let stream = self
            .input
            .stream(self.video_index)
            .ok_or_else(|| VideoError::DecoderInit("video stream vanished".into()))?;
        let mut context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| VideoError::DecoderInit(format!("Failed to create codec context: {e}")))?;
        let (hw_ctx, active) = Self::try_init_hw_accel(&self.hw_config, &mut context)?;
        let video = context
            .decoder()
            .video()
            .map_err(|e| VideoError::DecoderInit(format!("Failed to open video decoder: {e}")))?;

        let audio = match self.audio_index.and_then(|i| self.input.stream(i)) {
            Some(stream) => {
                let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .map_err(|e| VideoError::DecoderInit(format!("Audio codec context: {e}")))?;
                match context.decoder().audio() {
                    Ok(decoder) => Some(decoder),
                    Err(e) => {
                        tracing::warn!("Audio decoder unavailable, playing video only: {}", e);
                        None
                    }
                }
            }
            None => None,
        };
        if audio.is_none() {
            self.audio_index = None;
            self.info.audio = None;
        }

        tracing::info!(
            "FfmpegBackend: decoders ready (hw: {:?}, requested {:?})",
            active,
            self.hw_config.hw_type
        );
        self.video = Some(video);
        self.audio = audio;
        self.active_hw_type = active;
        self._hw_device_ctx = hw_ctx;
        Ok(())
    }

    fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<(StreamKind, Self::Packet)>, VideoError> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => return Err(VideoError::DecodeFailed(format!("Demux failed: {e}"))),
            }
            let index = packet.stream();
            if index == self.video_index {
                return Ok(Some((StreamKind::Video, packet)));
            }
            if Some(index) == self.audio_index {
                return Ok(Some((StreamKind::Audio, packet)));
            }
        }
    }

    fn packet_dts(packet: &Self::Packet) -> Option<i64> {
        packet.dts()
    }

    fn send_packet(&mut self, stream: StreamKind, packet: &Self::Packet) -> Result<(), VideoError> {
        let result = match stream {
            StreamKind::Video => self.video.as_mut().map(|d| d.send_packet(packet)),
            StreamKind::Audio => self.audio.as_mut().map(|d| d.send_packet(packet)),
        };
        match result {
            None => Err(VideoError::DecoderInit("decoders not initialized".into())),
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(VideoError::DecodeFailed(format!("Send packet failed: {e}"))),
        }
    }

    fn send_eof(&mut self, stream: StreamKind) -> Result<(), VideoError> {
        let result = match stream {
            StreamKind::Video => self.video.as_mut().map(|d| d.send_eof()),
            StreamKind::Audio => self.audio.as_mut().map(|d| d.send_eof()),
        };
        match result {
            None => Err(VideoError::DecoderInit("decoders not initialized".into())),
            Some(Ok(())) | Some(Err(ffmpeg::Error::Eof)) => Ok(()),
            Some(Err(e)) => Err(VideoError::DecodeFailed(format!("Send EOF failed: {e}"))),
        }
    }

    fn receive_video(&mut self) -> Receive<VideoFrame> {
        let Some(decoder) = self.video.as_mut() else {
            return Receive::Failed(VideoError::DecoderInit("decoders not initialized".into()));
        };
        let mut frame = ffmpeg::frame::Video::empty();
        match decoder.receive_frame(&mut frame) {
            // A frame that cannot be converted is dropped; the stream goes on.
            Ok(()) => match self.wrap_video(frame) {
                Ok(frame) => Receive::Frame(frame),
                Err(e) => Receive::Dropped(e),
            },
            Err(ffmpeg::Error::Eof) => Receive::EndOfStream,
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                Receive::NeedsInput
            }
            Err(e) => Receive::Failed(VideoError::DecodeFailed(format!("Decode error: {e}"))),
        }
    }

    fn receive_audio(&mut self) -> Receive<AudioFrame> {
        let Some(decoder) = self.audio.as_mut() else {
            return Receive::EndOfStream;
        };
        let mut frame = ffmpeg::frame::Audio::empty();
        match decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let time_base = self
                    .info
                    .audio
                    .as_ref()
                    .map(|a| a.time_base)
                    .unwrap_or(Rational::new(1, frame.rate().max(1) as i32));
                match to_audio_frame(&frame, time_base) {
                    Ok(frame) => Receive::Frame(frame),
                    Err(e) => Receive::Dropped(e),
                }
            }
            Err(ffmpeg::Error::Eof) => Receive::EndOfStream,
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                Receive::NeedsInput
            }
            Err(e) => Receive::Failed(VideoError::DecodeFailed(format!("Audio decode error: {e}"))),
        }
    }

    fn seek(
        &mut self,
        stream: StreamKind,
        timestamp: i64,
        flags: SeekFlags,
    ) -> Result<(), VideoError> {
        let Some(index) = self.index_of(stream) else {
            return Err(VideoError::SeekFailed(format!("no {stream:?} stream")));
        };
        let flags = if flags.backward {
            ffi::AVSEEK_FLAG_BACKWARD as i32
        } else {
            0
        };
        let ret = unsafe {
            ffi::av_seek_frame(self.input.as_mut_ptr(), index as i32, timestamp, flags)
        };
        if ret < 0 {
            return Err(VideoError::SeekFailed(format!(
                "av_seek_frame({stream:?}, {timestamp}) returned {ret}"
            )));
        }
        tracing::debug!("FfmpegBackend: seek {:?} to ts {}", stream, timestamp);
        Ok(())
    }

    fn flush(&mut self, stream: StreamKind) {
        match stream {
            StreamKind::Video => {
                if let Some(decoder) = self.video.as_mut() {
                    decoder.flush();
                }
            }
            StreamKind::Audio => {
                if let Some(decoder) = self.audio.as_mut() {
                    decoder.flush();
                }
            }
        }
    }

    fn hw_accel_type(&self) -> HwAccelType {
        self.active_hw_type
    }
}

fn rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

/// Copies the first `rows` rows of plane `index`, keeping its stride.
fn copy_plane(frame: &ffmpeg::frame::Video, index: usize, rows: usize) -> Plane {
    let stride = frame.stride(index);
    let data = frame.data(index);
    let len = (stride * rows).min(data.len());
    Plane {
        data: data[..len].to_vec(),
        stride,
    }
}

/// Host frame from a software-decoded (or downloaded) FFmpeg frame. Formats
/// without a direct mapping go through swscale to RGBA.
fn to_cpu_frame(
    frame: &ffmpeg::frame::Video,
    scaler: &mut Option<ffmpeg::software::scaling::Context>,
) -> Result<CpuFrame, VideoError> {
    use ffmpeg::format::Pixel;

    let (width, height) = (frame.width(), frame.height());
    let rows = height as usize;
    let chroma_rows = rows.div_ceil(2);
    let (format, planes) = match frame.format() {
        Pixel::YUV420P | Pixel::YUVJ420P => (
            PixelFormat::Yuv420p,
            vec![
                copy_plane(frame, 0, rows),
                copy_plane(frame, 1, chroma_rows),
                copy_plane(frame, 2, chroma_rows),
            ],
        ),
        Pixel::NV12 => (
            PixelFormat::Nv12,
            vec![copy_plane(frame, 0, rows), copy_plane(frame, 1, chroma_rows)],
        ),
        Pixel::RGBA => (PixelFormat::Rgba, vec![copy_plane(frame, 0, rows)]),
        Pixel::BGRA => (PixelFormat::Bgra, vec![copy_plane(frame, 0, rows)]),
        Pixel::RGB24 => (PixelFormat::Rgb24, vec![copy_plane(frame, 0, rows)]),
        other => {
            let needs_recreate = scaler.as_ref().map_or(true, |s| {
                let input = s.input();
                input.format != other || input.width != width || input.height != height
            });
            if needs_recreate {
                *scaler = Some(
                    ffmpeg::software::scaling::Context::get(
                        other,
                        width,
                        height,
                        Pixel::RGBA,
                        width,
                        height,
                        ffmpeg::software::scaling::Flags::BILINEAR,
                    )
                    .map_err(|e| {
                        VideoError::UnsupportedFormat(format!("No scaler for {other:?}: {e}"))
                    })?,
                );
            }
            let Some(scaler) = scaler.as_mut() else {
                return Err(VideoError::UnsupportedFormat(format!("{other:?}")));
            };
            let mut rgba = ffmpeg::frame::Video::empty();
            scaler
                .run(frame, &mut rgba)
                .map_err(|e| VideoError::TransferFailed(format!("Scaling failed: {e}")))?;
            (PixelFormat::Rgba, vec![copy_plane(&rgba, 0, rows)])
        }
    };
    Ok(CpuFrame::new(format, width, height, planes))
}

fn to_audio_frame(frame: &ffmpeg::frame::Audio, time_base: Rational) -> Result<AudioFrame, VideoError> {
    use ffmpeg::format::sample::Type;
    use ffmpeg::format::Sample;

    let (format, planar) = match frame.format() {
        Sample::U8(t) => (SampleFormat::U8, t == Type::Planar),
        Sample::I16(t) => (SampleFormat::S16, t == Type::Planar),
        Sample::I32(t) => (SampleFormat::S32, t == Type::Planar),
        Sample::F32(t) => (SampleFormat::F32, t == Type::Planar),
        Sample::F64(t) => (SampleFormat::F64, t == Type::Planar),
        other => {
            return Err(VideoError::UnsupportedFormat(format!(
                "audio sample format {other:?}"
            )))
        }
    };
    let channels = frame.channels();
    let samples = frame.samples();
    let bytes_per_sample = format.bytes_per_sample();
    let (plane_count, plane_len) = if planar {
        (channels as usize, samples * bytes_per_sample)
    } else {
        (1, samples * bytes_per_sample * channels as usize)
    };
    // data() only reaches the first eight planes
    let plane_count = plane_count.min(frame.planes()).min(8);
    let planes = (0..plane_count)
        .map(|i| {
            let data = frame.data(i);
            data[..plane_len.min(data.len())].to_vec()
        })
        .collect();

    Ok(AudioFrame {
        pts: frame.timestamp().or(frame.pts()),
        time_base,
        sample_rate: frame.rate(),
        channels,
        format,
        planar,
        samples,
        planes,
    })
}
