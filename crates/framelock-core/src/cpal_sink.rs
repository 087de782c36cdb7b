//! Audio output through the default cpal device.
//!
//! The cpal stream lives on its own thread (it is not `Send` on every
//! platform); the sink talks to it over a command channel and feeds it
//! through an [`audio_ring_buffer`]. The sink position is the number of
//! sample slots the device callback has consumed, plus anything skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::audio::{AudioError, AudioFormat, AudioSink};
use crate::audio_convert;
use crate::audio_ring_buffer::{
    audio_ring_buffer, ReadSample, RingBufferConfig, RingBufferConsumer, RingBufferProducer,
};

/// Default queue capacity; must exceed the player's `audio_buffer_ahead`.
pub const DEFAULT_CPAL_BUFFER: Duration = Duration::from_secs(12);

enum Command {
    Play,
    Pause,
    Shutdown,
}

struct Output {
    format: AudioFormat,
    producer: RingBufferProducer,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    /// Samples skipped without playing
    skipped: u64,
}

/// [`AudioSink`] backed by the system's default output device.
pub struct CpalSink {
    buffer: Duration,
    playing: Arc<AtomicBool>,
    output: Mutex<Option<Output>>,
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalSink {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_CPAL_BUFFER)
    }

    /// Sink whose queue holds up to `buffer` of audio.
    pub fn with_buffer(buffer: Duration) -> Self {
        Self {
            buffer,
            playing: Arc::new(AtomicBool::new(false)),
            output: Mutex::new(None),
        }
    }

    fn send(&self, command: Command) {
        if let Some(output) = self.output.lock().as_ref() {
            let _ = output.commands.send(command);
        }
    }
}

impl AudioSink for CpalSink {
    fn init(&self, format: AudioFormat, latency: Duration) -> Result<(), AudioError> {
        if format.bits_per_sample != 16 || format.channels == 0 {
            return Err(AudioError::UnsupportedFormat(format!("{format:?}")));
        }
        let mut output = self.output.lock();
        if let Some(old) = output.take() {
            shutdown(old);
        }

        let (producer, consumer) = audio_ring_buffer(RingBufferConfig::for_format(
            format.sample_rate,
            format.channels,
            self.buffer,
        ));
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let playing = Arc::clone(&self.playing);

        let thread = thread::Builder::new()
            .name("framelock-cpal".into())
            .spawn(move || run_device(format, consumer, playing, command_rx, ready_tx))
            .map_err(|e| AudioError::InitFailed(format!("failed to spawn device thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::InitFailed("device thread exited".into()));
            }
        }

        tracing::info!(
            "Audio output initialized (cpal, {}Hz, {}ch, latency {:?})",
            format.sample_rate,
            format.channels,
            latency
        );
        *output = Some(Output {
            format,
            producer,
            commands,
            thread: Some(thread),
            skipped: 0,
        });
        Ok(())
    }

    fn format(&self) -> Option<AudioFormat> {
        self.output.lock().as_ref().map(|o| o.format)
    }

    fn push_samples(&self, bytes: &[u8]) {
        let output = self.output.lock();
        let Some(output) = output.as_ref() else {
            return;
        };
        let samples: Vec<f32> = audio_convert::s16_to_f32(bytes).collect();
        output.producer.write(&samples);
    }

    fn position_bytes(&self) -> u64 {
        let output = self.output.lock();
        let Some(output) = output.as_ref() else {
            return 0;
        };
        let bytes_per_sample = u64::from(output.format.bits_per_sample / 8);
        (output.producer.played() + output.skipped) * bytes_per_sample
    }

    fn buffered_duration(&self) -> Duration {
        let output = self.output.lock();
        let Some(output) = output.as_ref() else {
            return Duration::ZERO;
        };
        let bytes_per_sample = u64::from(output.format.bits_per_sample / 8);
        output
            .format
            .duration_of(output.producer.fill() as u64 * bytes_per_sample)
    }

    fn start(&self) {
        self.resume();
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::Release);
        self.send(Command::Pause);
    }

    fn resume(&self) {
        self.playing.store(true, Ordering::Release);
        self.send(Command::Play);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn flush(&self) {
        if let Some(output) = self.output.lock().as_ref() {
            output.producer.request_flush();
        }
    }

    fn skip(&self, bytes: u64) {
        let mut output = self.output.lock();
        let Some(output) = output.as_mut() else {
            return;
        };
        let bytes_per_sample = u64::from(output.format.bits_per_sample / 8).max(1);
        let samples = bytes / bytes_per_sample;
        output.producer.request_discard(samples as usize);
        output.skipped += samples;
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if let Some(output) = self.output.lock().take() {
            shutdown(output);
        }
    }
}

fn shutdown(mut output: Output) {
    let _ = output.commands.send(Command::Shutdown);
    if let Some(thread) = output.thread.take() {
        if let Err(e) = thread.join() {
            tracing::warn!("Audio device thread panicked: {:?}", e);
        }
    }
}

fn run_device(
    format: AudioFormat,
    consumer: RingBufferConsumer,
    playing: Arc<AtomicBool>,
    commands: Receiver<Command>,
    ready: Sender<Result<(), AudioError>>,
) {
    let stream = match build_stream(format, consumer, playing) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    for command in commands.iter() {
        let result = match command {
            Command::Play => stream.play().map_err(|e| e.to_string()),
            // not every backend can pause; the callback outputs silence then
            Command::Pause => stream.pause().map_err(|e| e.to_string()),
            Command::Shutdown => break,
        };
        if let Err(e) = result {
            tracing::warn!("cpal stream control failed: {}", e);
        }
    }
    tracing::debug!("Audio device thread exiting");
}

fn build_stream(
    format: AudioFormat,
    mut consumer: RingBufferConsumer,
    playing: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no default output device".into()))?;

    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: format.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if !playing.load(Ordering::Acquire) {
                    data.fill(0.0);
                    return;
                }
                for slot in data.iter_mut() {
                    *slot = match consumer.read_sample() {
                        ReadSample::Sample(sample) => sample,
                        ReadSample::Flushed | ReadSample::Empty => 0.0,
                    };
                }
            },
            |err| tracing::error!("cpal audio error: {err}"),
            None,
        )
        .map_err(|e| AudioError::InitFailed(format!("failed to build output stream: {e}")))?;

    if let Err(e) = stream.pause() {
        tracing::debug!("cpal stream cannot start paused: {}", e);
    }
    Ok(stream)
}
