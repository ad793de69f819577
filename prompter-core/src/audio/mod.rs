//! Audio output via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal output callback runs on an OS audio thread at elevated priority.
//! It must not block on a mutex or perform I/O. Scheduling commands reach it
//! through a crossbeam channel drained with `try_recv`, and the clock and
//! master gain are plain atomics.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `CpalOutput` therefore owns a dedicated thread that builds the
//! stream, keeps it alive and drops it on shutdown. The handle itself is
//! `Send + Sync` and is shared as `Arc<dyn AudioOutput>`.

pub mod device;
pub mod resample;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::buffering::PcmBuffer;
use crate::playback::VoiceId;

/// Voice slots reserved up front. Schedules past this are dropped.
const VOICE_CAPACITY: usize = 64;

/// Frames of mix scratch allocated with the stream. Larger device buffers
/// are rendered in several blocks.
const SCRATCH_FRAMES: usize = 4_096;

#[derive(Debug)]
pub(crate) enum MixerCommand {
    Schedule {
        id: VoiceId,
        buffer: Arc<PcmBuffer>,
        start_frame: u64,
    },
    Halt(VoiceId),
}

struct Voice {
    id: VoiceId,
    buffer: Arc<PcmBuffer>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.samples.len() as u64
    }
}

/// Sums scheduled mono voices into the device buffer and advances the clock.
///
/// Lives inside the output callback.
pub(crate) struct Mixer {
    voices: Vec<Voice>,
    commands: Receiver<MixerCommand>,
    clock: Arc<AtomicU64>,
    gain: Arc<AtomicU32>,
}

impl Mixer {
    pub(crate) fn new(commands: Receiver<MixerCommand>, clock: Arc<AtomicU64>, gain: Arc<AtomicU32>) -> Self {
        Self {
            voices: Vec::with_capacity(VOICE_CAPACITY),
            commands,
            clock,
            gain,
        }
    }

    fn apply_commands(&mut self, now: u64) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                MixerCommand::Schedule {
                    id,
                    buffer,
                    start_frame,
                } => {
                    if self.voices.len() < VOICE_CAPACITY {
                        self.voices.push(Voice {
                            id,
                            buffer,
                            start_frame: start_frame.max(now),
                        });
                    }
                }
                MixerCommand::Halt(id) => self.voices.retain(|v| v.id != id),
            }
        }
    }

    /// Fill interleaved `out` with `channels` copies of the mono mix.
    pub(crate) fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let base = self.clock.load(Ordering::Acquire);
        self.apply_commands(base);

        let gain = f32::from_bits(self.gain.load(Ordering::Relaxed));
        let frames = out.len() / channels;
        for (f, frame) in out.chunks_exact_mut(channels).enumerate() {
            let at = base + f as u64;
            let mut sum = 0f32;
            for voice in &self.voices {
                if at >= voice.start_frame {
                    if let Some(s) = voice.buffer.samples.get((at - voice.start_frame) as usize) {
                        sum += *s;
                    }
                }
            }
            frame.fill((sum * gain).clamp(-1.0, 1.0));
        }

        let end = base + frames as u64;
        self.clock.store(end, Ordering::Release);
        self.voices.retain(|v| v.end_frame() > end);
    }

    /// Render into a device buffer of any sample type through `scratch`,
    /// one scratch-sized block at a time. Never allocates.
    #[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
    pub(crate) fn render_blocks<T>(
        &mut self,
        out: &mut [T],
        scratch: &mut [f32],
        channels: usize,
        convert: impl Fn(f32) -> T,
    ) {
        let channels = channels.max(1);
        let block = scratch.len() / channels * channels;
        if block == 0 {
            return;
        }
        for chunk in out.chunks_mut(block) {
            let mix = &mut scratch[..chunk.len()];
            self.render(mix, channels);
            for (dst, src) in chunk.iter_mut().zip(mix.iter()) {
                *dst = convert(*src);
            }
        }
    }
}

/// Scratch buffer sized for [`Mixer::render_blocks`] on a stream with
/// `channels` channels.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
pub(crate) fn mix_scratch(channels: usize) -> Vec<f32> {
    vec![0.0; SCRATCH_FRAMES * channels.max(1)]
}

/// Cross-thread handle state shared by both backends.
struct OutputHandle {
    sample_rate: u32,
    clock: Arc<AtomicU64>,
    gain: Arc<AtomicU32>,
    commands: Sender<MixerCommand>,
    next_voice: AtomicU64,
}

impl OutputHandle {
    fn schedule(&self, buffer: Arc<PcmBuffer>, start_frame: u64) -> crate::error::Result<VoiceId> {
        let id = self.next_voice.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(MixerCommand::Schedule {
                id,
                buffer,
                start_frame,
            })
            .map_err(|_| crate::error::PrompterError::AudioOutput("output stream is closed".into()))?;
        Ok(id)
    }
}

#[cfg(feature = "audio-cpal")]
mod backend {
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
    use crossbeam_channel::Sender;
    use tracing::{debug, error, info, warn};

    use super::device::match_device_name;
    use super::{mix_scratch, Mixer, MixerCommand, OutputHandle};
    use crate::buffering::PcmBuffer;
    use crate::error::{PrompterError, Result};
    use crate::playback::{clamp_volume, AudioOutput, PlaybackConfig, VoiceId};

    /// Process-scoped speaker output.
    ///
    /// Open once and share; dropping it closes the device.
    pub struct CpalOutput {
        handle: OutputHandle,
        shutdown: Option<Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl CpalOutput {
        /// Open the preferred (or default) output device.
        ///
        /// # Errors
        /// `PrompterError::NoDefaultOutputDevice` when no speaker is available,
        /// or `PrompterError::AudioOutput` if cpal fails to build the stream.
        pub fn open(config: &PlaybackConfig) -> Result<Self> {
            let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
            let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
            let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<MixerCommand>();
            let clock = Arc::new(AtomicU64::new(0));
            let gain = Arc::new(AtomicU32::new(clamp_volume(config.volume).to_bits()));

            let mixer = Mixer::new(cmd_rx, Arc::clone(&clock), Arc::clone(&gain));
            let device_name = config.output_device.clone();
            let preferred_rate = config.output_sample_rate;

            let thread = std::thread::Builder::new()
                .name("prompter-audio-out".into())
                .spawn(move || match open_stream(device_name.as_deref(), preferred_rate, mixer) {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        let _ = shutdown_rx.recv();
                        drop(stream);
                        debug!("output stream closed");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })?;

            let sample_rate = match ready_rx.recv() {
                Ok(Ok(rate)) => rate,
                Ok(Err(e)) => {
                    let _ = thread.join();
                    return Err(e);
                }
                Err(_) => {
                    let _ = thread.join();
                    return Err(PrompterError::AudioOutput(
                        "output thread exited before the stream opened".into(),
                    ));
                }
            };

            Ok(Self {
                handle: OutputHandle {
                    sample_rate,
                    clock,
                    gain,
                    commands: cmd_tx,
                    next_voice: AtomicU64::new(1),
                },
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            })
        }

        /// Close the stream and join the output thread. Idempotent.
        pub fn shutdown(&mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    error!("audio output thread panicked");
                }
            }
        }
    }

    impl Drop for CpalOutput {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

    impl AudioOutput for CpalOutput {
        fn sample_rate(&self) -> u32 {
            self.handle.sample_rate
        }

        fn current_frame(&self) -> u64 {
            self.handle.clock.load(Ordering::Acquire)
        }

        fn schedule(&self, buffer: Arc<PcmBuffer>, start_frame: u64) -> Result<VoiceId> {
            if buffer.sample_rate != self.handle.sample_rate {
                return Err(PrompterError::AudioOutput(format!(
                    "buffer at {} Hz scheduled on {} Hz output",
                    buffer.sample_rate, self.handle.sample_rate
                )));
            }
            self.handle.schedule(buffer, start_frame)
        }

        fn halt(&self, voice: VoiceId) {
            let _ = self.handle.commands.send(MixerCommand::Halt(voice));
        }

        fn set_gain(&self, gain: f32) {
            self.handle
                .gain
                .store(clamp_volume(gain).to_bits(), Ordering::Relaxed);
        }
    }

    fn select_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
        if let Some(preferred_name) = preferred {
            match host.output_devices() {
                Ok(devices) => {
                    let devices: Vec<cpal::Device> = devices.collect();
                    let names: Vec<String> = devices
                        .iter()
                        .map(|d| d.name().unwrap_or_default())
                        .collect();
                    if let Some(idx) = match_device_name(names.iter().map(String::as_str), preferred_name) {
                        if let Some(device) = devices.into_iter().nth(idx) {
                            return Ok(device);
                        }
                    }
                    warn!("preferred output device '{preferred_name}' not found, falling back");
                }
                Err(e) => warn!("failed to list output devices while resolving preference: {e}"),
            }
        }

        if let Some(default) = host.default_output_device() {
            return Ok(default);
        }
        let mut devices = host
            .output_devices()
            .map_err(|e| PrompterError::AudioOutput(e.to_string()))?;
        let fallback = devices.next().ok_or(PrompterError::NoDefaultOutputDevice)?;
        warn!("no default output device, falling back to first available output");
        Ok(fallback)
    }

    fn supports_rate(device: &cpal::Device, channels: u16, format: SampleFormat, rate: u32) -> bool {
        device
            .supported_output_configs()
            .map(|mut ranges| {
                ranges.any(|r| {
                    r.channels() == channels
                        && r.sample_format() == format
                        && (r.min_sample_rate().0..=r.max_sample_rate().0).contains(&rate)
                })
            })
            .unwrap_or(false)
    }

    fn open_stream(preferred: Option<&str>, preferred_rate: Option<u32>, mixer: Mixer) -> Result<(Stream, u32)> {
        let host = cpal::default_host();
        let device = select_device(&host, preferred)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| PrompterError::AudioOutput(e.to_string()))?;
        let sample_format = supported.sample_format();
        let channels = supported.channels();
        let mut sample_rate = supported.sample_rate().0;
        if let Some(rate) = preferred_rate.filter(|r| *r != sample_rate) {
            if supports_rate(&device, channels, sample_format, rate) {
                sample_rate = rate;
            } else {
                warn!(rate, fallback = sample_rate, "output rate not supported by device");
            }
        }
        info!(sample_rate, channels, ?sample_format, "output config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer),
            fmt => Err(PrompterError::AudioOutput(format!(
                "unsupported sample format: {fmt:?}"
            ))),
        }?;
        stream
            .play()
            .map_err(|e| PrompterError::AudioOutput(e.to_string()))?;
        Ok((stream, sample_rate))
    }

    fn build_stream<T>(device: &cpal::Device, config: &StreamConfig, mut mixer: Mixer) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels as usize;
        let mut scratch = mix_scratch(channels);
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                    mixer.render_blocks(data, &mut scratch, channels, |s| T::from_sample(s));
                },
                |err| error!("audio output stream error: {err}"),
                None,
            )
            .map_err(|e| PrompterError::AudioOutput(e.to_string()))
    }
}

#[cfg(feature = "audio-cpal")]
pub use backend::CpalOutput;

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
pub struct CpalOutput {
    handle: OutputHandle,
}

#[cfg(not(feature = "audio-cpal"))]
impl CpalOutput {
    pub fn open(_config: &crate::playback::PlaybackConfig) -> crate::error::Result<Self> {
        Err(crate::error::PrompterError::AudioOutput(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn shutdown(&mut self) {}
}

#[cfg(not(feature = "audio-cpal"))]
impl crate::playback::AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.handle.sample_rate
    }

    fn current_frame(&self) -> u64 {
        self.handle.clock.load(Ordering::Acquire)
    }

    fn schedule(&self, buffer: Arc<PcmBuffer>, start_frame: u64) -> crate::error::Result<VoiceId> {
        self.handle.schedule(buffer, start_frame)
    }

    fn halt(&self, _voice: VoiceId) {}

    fn set_gain(&self, gain: f32) {
        self.handle.gain.store(gain.to_bits(), Ordering::Relaxed);
    }
}
