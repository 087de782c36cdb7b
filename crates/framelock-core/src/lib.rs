//! framelock-core: frame-exact decode, buffering and A/V sync.
//!
//! This crate provides a headless playback engine that can present any frame
//! of a video by index and keep it in sync with an audio output. It contains:
//!
//! - Core types: [`video`], [`audio`], [`backend`]
//! - Decoding: [`frame_source`] over a [`MediaBackend`], with the
//!   [`synthetic`] backend always available and `ffmpeg_backend` behind the
//!   `ffmpeg` feature
//! - Buffering: [`frame_store`], [`transfer`]
//! - Audio: [`audio_convert`], [`audio_ring_buffer`], and `cpal_sink` behind
//!   the `cpal` feature
//! - Playback: [`player`], [`scheduler`], [`state`], [`sync_metrics`]
//!
//! The engine never draws; a presentation layer supplies a
//! [`FramePresenter`] and an [`AudioSink`] whose playback position is the
//! master clock.

pub mod video;
pub mod convert;
pub mod backend;
pub mod synthetic;
pub mod frame_source;

pub mod frame_store;
pub mod transfer;

pub mod audio;
pub mod audio_convert;
pub mod audio_ring_buffer;

pub mod config;
pub mod player;
pub mod scheduler;
pub mod state;
pub mod sync_metrics;

mod decode_thread;
mod seek;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_backend;

#[cfg(feature = "cpal")]
pub mod cpal_sink;

pub use audio::{AudioError, AudioFormat, AudioSink, ClockMode, PlaybackClock, VirtualSink};
pub use backend::{HwAccelConfig, HwAccelType, MediaBackend, MediaInfo, StreamKind};
pub use config::PlayerConfig;
pub use player::{FramePresenter, Player, PlayerError};
pub use state::PlaybackState;
pub use sync_metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use synthetic::{SyntheticBackend, SyntheticConfig};
pub use video::{CpuFrame, FrameIndex, FrameTiming, PixelFormat, Rational, VideoError};

#[cfg(feature = "cpal")]
pub use cpal_sink::CpalSink;
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_backend::FfmpegBackend;
