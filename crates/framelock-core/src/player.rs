//! Headless frame-exact player.
//!
//! [`Player`] owns the decode pipeline, frame store, audio clock and playback
//! state machine. It is consumed by a presentation layer that supplies a
//! [`FramePresenter`] and an [`AudioSink`].
//!
//! # Threads
//!
//! ```text
//!   framelock-video  FrameSource ─▶ TransferPipeline ─▶ FrameStore
//!   framelock-audio  FrameSource ─▶ audio_convert ─▶ AudioSink
//!   framelock-sync   FrameStore ─▶ FramePresenter   (paced by PlaybackClock)
//!   frame-transfer   short-lived, bounded by the transfer limiter
//! ```
//!
//! # State Machine
//!
//! ```text
//! open → Stopped (preview frame presented)
//!
//! play()  [Stopped/Paused]                     → Playing
//! pause() [Playing/Buffering/EndedStream]      → Paused
//! seek    [Playing/Paused/Buffering/Ended*]    → Seeking → (SeekBuffering) → Paused
//! store below low watermark                    → Buffering → Playing
//! video EOS                                    → EndedStream → Ended
//! play()  [Ended]                              → Playing from frame 0
//! stop()  [any]                                → Stopped
//! ```
//!
//! On `Ended` the readers are stopped and every buffered frame is released;
//! the state stays `Ended` until the next play, seek or stop.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};

use crate::audio::{AudioError, AudioFormat, AudioSink, PlaybackClock};
use crate::audio_convert;
use crate::backend::{MediaBackend, MediaInfo, StreamKind};
use crate::config::PlayerConfig;
use crate::decode_thread::DecodeThreads;
use crate::frame_source::{FrameRead, FrameSource};
use crate::frame_store::FrameStore;
use crate::scheduler::{self, SchedulerEvent};
use crate::seek;
use crate::state::{PlaybackState, StateCell};
use crate::sync_metrics::SyncMetrics;
use crate::transfer::TransferPipeline;
use crate::video::{CpuFrame, FrameIndex, FrameTiming, Rational, VideoError, VideoFrame};

/// Sample rate of the clock used when the media has no enabled audio track.
const CLOCK_ONLY_SAMPLE_RATE: u32 = 48000;

/// How long `stop()` waits for in-flight transfers.
const TRANSFER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors surfaced by [`Player`].
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// The player was disposed by a fatal error and must be reopened
    #[error("Player is not open")]
    NotOpen,
    /// The requested state change is not an edge of the state machine
    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: PlaybackState,
        to: PlaybackState,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    /// A worker thread could not be started
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Receives every presented frame, already host-resident in
/// [`PixelFormat::CANONICAL`](crate::video::PixelFormat::CANONICAL).
///
/// Called with the presentation lock held; keep it short.
pub trait FramePresenter: Send {
    fn present(&mut self, frame: &CpuFrame, index: FrameIndex);
}

impl<F> FramePresenter for F
where
    F: FnMut(&CpuFrame, FrameIndex) + Send,
{
    fn present(&mut self, frame: &CpuFrame, index: FrameIndex) {
        self(frame, index)
    }
}

/// Hands `frame` to the presenter if it is host-resident. Returns false when
/// it is not (failed or still running transfer).
pub(crate) fn present_frame(
    presenter: &mut dyn FramePresenter,
    frame: &VideoFrame,
    index: FrameIndex,
) -> bool {
    let index = frame.index().unwrap_or(index);
    frame
        .with_host_frame(|cpu| presenter.present(cpu, index))
        .is_some()
}

/// Audio track parameters the readers and seek need.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AudioTrack {
    pub(crate) time_base: Rational,
    pub(crate) start_pts: i64,
}

/// State shared by the player, the reader threads and the scheduler.
pub(crate) struct Shared<B: MediaBackend> {
    /// The decoder lock
    pub(crate) source: Mutex<FrameSource<B>>,
    pub(crate) store: FrameStore,
    pub(crate) transfer: TransferPipeline,
    pub(crate) state: StateCell,
    pub(crate) clock: PlaybackClock,
    pub(crate) metrics: SyncMetrics,
    pub(crate) config: PlayerConfig,
    pub(crate) timing: FrameTiming,
    pub(crate) info: MediaInfo,
    pub(crate) total_frames: FrameIndex,
    pub(crate) audio: Option<AudioTrack>,
    presenter: Mutex<Box<dyn FramePresenter>>,

    pub(crate) stop: AtomicBool,
    failed: AtomicBool,
    pub(crate) video_ended: AtomicBool,
    pub(crate) audio_ended: AtomicBool,
    pub(crate) seeking: AtomicBool,
    /// Bumped by every decoder reposition; stale audio is dropped
    pub(crate) seek_generation: AtomicU64,
    /// Bumped by every play, pause, seek and stop call
    pub(crate) user_commands: AtomicU64,
    pub(crate) next_index: AtomicI64,
    pub(crate) current_index: AtomicI64,
    pub(crate) last_decoded: AtomicI64,

    events_tx: Sender<SchedulerEvent>,
    pub(crate) events_rx: Receiver<SchedulerEvent>,
    error: Mutex<Option<VideoError>>,
}

impl<B: MediaBackend> Shared<B> {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleeps up to `timeout`, returning early on any scheduler event.
    pub(crate) fn wait_event(&self, timeout: Duration) {
        let _ = self.events_rx.recv_timeout(timeout);
    }

    pub(crate) fn lock_presenter(&self) -> MutexGuard<'_, Box<dyn FramePresenter>> {
        self.presenter.lock()
    }

    pub(crate) fn notify_scheduler(&self) {
        let _ = self.events_tx.send(SchedulerEvent::Wake);
    }

    pub(crate) fn notify_video_ended(&self) {
        let _ = self.events_tx.send(SchedulerEvent::VideoEnded);
    }

    /// Records a fatal decode error and stops playback.
    pub(crate) fn fail(&self, err: VideoError) {
        tracing::error!("Fatal decode error, stopping playback: {}", err);
        self.error.lock().get_or_insert(err);
        self.failed.store(true, Ordering::Release);
        self.stop.store(true, Ordering::Release);
        self.state.stop();
        self.clock.pause();
        let _ = self.events_tx.send(SchedulerEvent::Fatal);
        self.store.wake_all();
    }

    /// Releases buffers and audio once the last frame has been presented.
    /// The stop flag is already set, so the readers wind down on their own.
    pub(crate) fn release_after_end(&self) {
        self.store.wake_all();
        let released = self.store.reset();
        self.clock.sink().flush();
        if !self.transfer.limiter().wait_idle(TRANSFER_DRAIN_TIMEOUT) {
            tracing::warn!(
                "{} frame transfers still running after end of playback",
                self.transfer.limiter().in_flight()
            );
        }
        tracing::debug!("Released {} buffered frames after end of playback", released);
    }

    fn count_command(&self) {
        self.user_commands.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct Threads {
    readers: Option<DecodeThreads>,
    scheduler: Option<JoinHandle<()>>,
}

/// Frame-exact media player over a [`MediaBackend`].
///
/// All methods take `&self`; a player can be shared between a UI thread and
/// a control thread.
pub struct Player<B: MediaBackend> {
    shared: Arc<Shared<B>>,
    threads: Mutex<Threads>,
}

impl<B: MediaBackend> Player<B> {
    /// Opens `path` with the default configuration and no presenter.
    pub fn open_file(path: impl AsRef<Path>, sink: Arc<dyn AudioSink>) -> Result<Self, PlayerError> {
        Self::open_file_with(path, sink, |_: &CpuFrame, _: FrameIndex| {}, PlayerConfig::default())
    }

    pub fn open_file_with(
        path: impl AsRef<Path>,
        sink: Arc<dyn AudioSink>,
        presenter: impl FramePresenter + 'static,
        config: PlayerConfig,
    ) -> Result<Self, PlayerError> {
        config.validate()?;
        let path = path.as_ref();
        tracing::info!("Opening {}", path.display());
        let backend = B::open(path, &config.hw_accel)?;
        Self::open_backend_with(backend, sink, presenter, config)
    }

    /// Wraps an already opened backend with the default configuration.
    pub fn open_backend(backend: B, sink: Arc<dyn AudioSink>) -> Result<Self, PlayerError> {
        Self::open_backend_with(backend, sink, |_: &CpuFrame, _: FrameIndex| {}, PlayerConfig::default())
    }

    pub fn open_backend_with(
        mut backend: B,
        sink: Arc<dyn AudioSink>,
        presenter: impl FramePresenter + 'static,
        config: PlayerConfig,
    ) -> Result<Self, PlayerError> {
        config.validate()?;
        backend.init_decoders()?;

        let info = backend.media_info().clone();
        let timing = info.timing();
        let total_frames = info.total_frame_count();
        let audio_info = info.audio.clone().filter(|_| config.enable_audio);

        let format = audio_info
            .as_ref()
            .map(|a| audio_convert::output_format(a.sample_rate, a.channels))
            .unwrap_or_else(|| AudioFormat::s16(CLOCK_ONLY_SAMPLE_RATE, 2));
        sink.init(format, config.audio_latency)?;

        let mut source = FrameSource::new(backend);
        source.set_audio_enabled(audio_info.is_some());

        tracing::info!(
            "Media opened: {}x{} @ {:.3} fps, {} frames, {}ms, audio: {}, hw: {:?}",
            info.video.width,
            info.video.height,
            timing.fps(),
            total_frames,
            info.duration_ms(),
            audio_info
                .as_ref()
                .map(|a| format!("{}Hz {}ch {}", a.sample_rate, a.channels, a.codec))
                .unwrap_or_else(|| "none".to_string()),
            source.backend().hw_accel_type()
        );

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            source: Mutex::new(source),
            store: FrameStore::new(config.frame_cap),
            transfer: TransferPipeline::new(config.max_concurrent_transfers, config.transfer_lookahead),
            state: StateCell::new(),
            clock: PlaybackClock::new(sink),
            metrics: SyncMetrics::new(),
            timing,
            total_frames,
            audio: audio_info.as_ref().map(|a| AudioTrack {
                time_base: a.time_base,
                start_pts: a.start_pts,
            }),
            info,
            config,
            presenter: Mutex::new(Box::new(presenter)),
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            video_ended: AtomicBool::new(false),
            audio_ended: AtomicBool::new(false),
            seeking: AtomicBool::new(false),
            seek_generation: AtomicU64::new(0),
            user_commands: AtomicU64::new(0),
            next_index: AtomicI64::new(0),
            current_index: AtomicI64::new(-1),
            last_decoded: AtomicI64::new(-1),
            events_tx,
            events_rx,
            error: Mutex::new(None),
        });

        load_preview(&shared)?;
        let readers = DecodeThreads::spawn(&shared)?;

        Ok(Self {
            shared,
            threads: Mutex::new(Threads {
                readers: Some(readers),
                scheduler: None,
            }),
        })
    }

    /// Starts or resumes playback. From `Stopped` after [`stop`](Self::stop),
    /// and from `Ended`, playback restarts at frame 0.
    pub fn play(&self) -> Result<(), PlayerError> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(PlayerError::NotOpen);
        }
        self.shared.count_command();
        let mut threads = self.threads.lock();

        if self.shared.state.get() == PlaybackState::Ended {
            self.shared.stop.store(true, Ordering::Release);
            shut_down(&mut threads);
            self.shared.state.stop();
        }
        if threads.readers.is_none() {
            self.rewind()?;
            threads.readers = Some(DecodeThreads::spawn(&self.shared)?);
        }

        if matches!(
            self.shared.state.get(),
            PlaybackState::Playing | PlaybackState::Buffering | PlaybackState::EndedStream
        ) {
            return Ok(());
        }
        {
            let _presenter = self.shared.lock_presenter();
            self.shared
                .state
                .transition_from(&[PlaybackState::Stopped, PlaybackState::Paused], PlaybackState::Playing)?;
        }

        let running = threads.scheduler.as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            if let Some(handle) = threads.scheduler.take() {
                join_thread("scheduler", handle);
            }
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("framelock-sync".into())
                .spawn(move || scheduler::run(shared));
            match spawned {
                Ok(handle) => threads.scheduler = Some(handle),
                Err(e) => {
                    let _ = self.shared.state.transition(PlaybackState::Paused);
                    return Err(e.into());
                }
            }
        }
        self.shared.notify_scheduler();
        tracing::info!(
            "Playing from frame {}",
            self.shared.next_index.load(Ordering::Acquire)
        );
        Ok(())
    }

    /// Pauses presentation and the audio clock. Reader threads keep filling
    /// the store. Already paused, or seeking (which ends paused), is a no-op.
    pub fn pause(&self) -> Result<(), PlayerError> {
        self.shared.count_command();
        let from = {
            let _presenter = self.shared.lock_presenter();
            let state = self.shared.state.get();
            if state == PlaybackState::Paused || state.is_seeking() {
                return Ok(());
            }
            self.shared.state.transition_from(
                &[
                    PlaybackState::Playing,
                    PlaybackState::Buffering,
                    PlaybackState::EndedStream,
                ],
                PlaybackState::Paused,
            )?
        };
        self.shared.clock.pause();
        self.shared.notify_scheduler();
        tracing::debug!(
            "Paused at frame {} (was {})",
            self.shared.current_index.load(Ordering::Acquire),
            from
        );
        Ok(())
    }

    /// Stops playback, joins every thread and releases all buffered frames.
    pub fn stop(&self) {
        self.shared.count_command();
        let mut threads = self.threads.lock();
        let shared = &self.shared;
        shared.stop.store(true, Ordering::Release);
        let from = shared.state.stop();
        shared.clock.pause();
        shared.notify_scheduler();
        shared.store.wake_all();
        shut_down(&mut threads);

        let released = shared.store.reset();
        shared.clock.sink().flush();
        if !shared.transfer.limiter().wait_idle(TRANSFER_DRAIN_TIMEOUT) {
            tracing::warn!(
                "{} frame transfers still running after stop",
                shared.transfer.limiter().in_flight()
            );
        }
        tracing::info!("Stopped (was {}), released {} buffered frames", from, released);
    }

    /// Seeks to frame `index` (clamped to the stream) and leaves the player
    /// paused on it. Returns whether the target frame was presented; a second
    /// seek while one is running is rejected with `false`.
    ///
    /// From `Ended` the readers are restarted first, so playback can go on
    /// from the target with [`play`](Self::play).
    pub fn seek_to_exact_frame(&self, index: FrameIndex) -> bool {
        if self.shared.failed.load(Ordering::Acquire) {
            return false;
        }
        self.shared.count_command();
        if let Err(err) = self.revive_after_end() {
            tracing::warn!("Seek to {} rejected: {}", index, err);
            return false;
        }
        seek::seek_to_exact_frame(&self.shared, index)
    }

    /// Index of the frame presented last, -1 before any.
    pub fn frame_index(&self) -> FrameIndex {
        self.shared.current_index.load(Ordering::Acquire)
    }

    pub fn total_frame_count(&self) -> FrameIndex {
        self.shared.total_frames
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state.get()
    }

    /// Blocks until the state satisfies `done` or `timeout` elapses.
    pub fn wait_for_state(
        &self,
        timeout: Duration,
        done: impl Fn(PlaybackState) -> bool,
    ) -> PlaybackState {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                return self.state();
            }
            let state = self.shared.state.wait_while(deadline - now, |s| !done(s));
            if done(state) {
                return state;
            }
        }
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.shared.info
    }

    pub fn timing(&self) -> FrameTiming {
        self.shared.timing
    }

    /// Media time of the audio clock in seconds.
    pub fn position_seconds(&self) -> f64 {
        self.shared.clock.audio_seconds()
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.shared.metrics
    }

    /// Number of decoded frames currently buffered.
    pub fn buffered_frames(&self) -> usize {
        self.shared.store.len()
    }

    /// The fatal error that stopped playback, if any.
    pub fn take_error(&self) -> Option<VideoError> {
        self.shared.error.lock().take()
    }

    /// Frame buffers the backend reports alive, when it tracks them.
    pub fn live_frames(&self) -> Option<usize> {
        let source = self.shared.source.lock();
        source.backend().frame_ledger().map(|ledger| ledger.live())
    }

    /// Restarts the readers that the end of playback wound down. No-op unless
    /// the player is `Ended`.
    fn revive_after_end(&self) -> Result<(), PlayerError> {
        let mut threads = self.threads.lock();
        let shared = &self.shared;
        if shared.state.get() != PlaybackState::Ended || !shared.is_stopped() {
            return Ok(());
        }
        shut_down(&mut threads);
        shared.stop.store(false, Ordering::Release);
        while shared.events_rx.try_recv().is_ok() {}
        threads.readers = Some(DecodeThreads::spawn(shared)?);
        tracing::debug!("Readers restarted after end of playback");
        Ok(())
    }

    /// Repositions the decoder at frame 0 after a stop.
    fn rewind(&self) -> Result<(), PlayerError> {
        let shared = &self.shared;
        let mut source = shared.source.lock();
        source.seek(StreamKind::Video, shared.timing.timestamp_of(0))?;
        shared.store.reset();
        shared.seek_generation.fetch_add(1, Ordering::AcqRel);
        shared.video_ended.store(false, Ordering::Release);
        shared.audio_ended.store(false, Ordering::Release);
        shared.next_index.store(0, Ordering::Release);
        shared.last_decoded.store(-1, Ordering::Release);
        shared.clock.sink().flush();
        shared.clock.rebase(0.0);
        shared.stop.store(false, Ordering::Release);
        while shared.events_rx.try_recv().is_ok() {}
        tracing::debug!("Rewound to frame 0");
        Ok(())
    }
}

impl<B: MediaBackend> Drop for Player<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Acquires the first frame, presents it and seeds the store with it.
fn load_preview<B: MediaBackend>(shared: &Shared<B>) -> Result<(), PlayerError> {
    let attempts = shared.config.initial_frame_attempts;
    let mut source = shared.source.lock();
    for _ in 0..attempts {
        let frame = match source.try_read_video_frame()? {
            FrameRead::Available(frame) => frame,
            FrameRead::NotReady => continue,
            FrameRead::EndOfStream => {
                shared.video_ended.store(true, Ordering::Release);
                break;
            }
        };
        let index = frame.index().unwrap_or(0);
        shared.transfer.ensure_host_resident(&frame)?;
        if !present_frame(&mut **shared.lock_presenter(), &frame, index) {
            tracing::warn!("Preview frame {} could not be presented", index);
        }
        shared.current_index.store(index, Ordering::Release);
        shared.next_index.store(index + 1, Ordering::Release);
        shared.last_decoded.store(index, Ordering::Release);
        shared.store.insert(index, frame, shared.store.epoch());
        tracing::debug!("Preview frame {} presented", index);
        return Ok(());
    }
    Err(VideoError::DecodeFailed(format!("no video frame within {attempts} reads")).into())
}

/// Joins the scheduler and the readers. The stop flag must already be set.
fn shut_down(threads: &mut Threads) {
    if let Some(handle) = threads.scheduler.take() {
        join_thread("scheduler", handle);
    }
    if let Some(mut readers) = threads.readers.take() {
        readers.join();
    }
}

fn join_thread(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.join() {
        tracing::warn!("{} thread panicked: {:?}", name, e);
    }
}
