//! `PlaybackScheduler`: queues encoded chunks and plays them back to back.
//!
//! One drain task per response pulls chunks in arrival order, decodes them on
//! the blocking pool and reserves the next slot on the output clock. A
//! `generation` counter invalidates everything in flight when `stop()` runs:
//! a decode that finishes afterwards is dropped instead of scheduled.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{clamp_volume, frames_to_duration, AudioOutput, PlaySource, PlaybackConfig, PlaybackTimeline, VoiceId};
use crate::buffering::PcmBuffer;
use crate::error::{PrompterError, Result};
use crate::ipc::events::PlaybackEvent;

const EVENT_CAPACITY: usize = 64;

/// Shortest wait between settle checks.
const MIN_SETTLE_WAIT: Duration = Duration::from_millis(1);

/// Encoded payload plus its arrival sequence number.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct SchedulerState {
    generation: u64,
    next_seq: u64,
    queue: VecDeque<AudioChunk>,
    draining: bool,
    /// The producer has signalled that no more chunks follow.
    finished: bool,
    started: bool,
    settling: bool,
    chunks_played: u64,
    voices: Vec<VoiceId>,
    timeline: PlaybackTimeline,
    volume: f32,
}

impl SchedulerState {
    fn is_active(&self) -> bool {
        self.started || self.draining || self.finished || self.settling || !self.queue.is_empty()
    }

    fn clear_response(&mut self) {
        self.queue.clear();
        self.voices.clear();
        self.draining = false;
        self.finished = false;
        self.started = false;
        self.settling = false;
        self.chunks_played = 0;
    }
}

struct Shared {
    output: Arc<dyn AudioOutput>,
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl Shared {
    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }

    /// Place a decoded chunk right after everything already reserved.
    fn schedule_decoded(&self, state: &mut SchedulerState, seq: u64, pcm: PcmBuffer) -> Result<()> {
        if pcm.is_empty() {
            return Err(PrompterError::Decode("chunk decoded to zero frames".into()));
        }
        let frames = pcm.samples.len() as u64;
        let now = self.output.current_frame();
        let start = now.max(state.timeline.end());
        let voice = self.output.schedule(Arc::new(pcm), start)?;
        state.timeline.reserve(now, frames);
        state.voices.push(voice);
        state.chunks_played += 1;
        debug!(seq, start, frames, voice, "chunk scheduled");

        if !state.started {
            state.started = true;
            info!(seq, lead_frames = start - now, "playback started");
            self.emit(PlaybackEvent::Started);
        }
        Ok(())
    }
}

/// Gapless streaming player for response audio.
///
/// Cheap to share behind an `Arc`; every method takes `&self`. Chunk
/// processing runs on spawned tasks, so the scheduler must be used from
/// inside a tokio runtime.
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    http: reqwest::Client,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>, config: &PlaybackConfig) -> Self {
        let volume = clamp_volume(config.volume);
        output.set_gain(volume);
        let timeline = PlaybackTimeline::new(output.current_frame());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                output,
                state: Mutex::new(SchedulerState {
                    generation: 0,
                    next_seq: 0,
                    queue: VecDeque::new(),
                    draining: false,
                    finished: false,
                    started: false,
                    settling: false,
                    chunks_played: 0,
                    voices: Vec::new(),
                    timeline,
                    volume,
                }),
                events,
            }),
            http: reqwest::Client::new(),
        }
    }

    pub fn output(&self) -> Arc<dyn AudioOutput> {
        Arc::clone(&self.shared.output)
    }

    /// Append one encoded chunk. Returns its sequence number.
    pub fn queue_chunk(&self, bytes: Vec<u8>) -> u64 {
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back(AudioChunk { seq, bytes });
        if !state.draining {
            state.draining = true;
            tokio::spawn(drain(Arc::clone(&self.shared), state.generation));
        }
        seq
    }

    /// No more chunks follow for the current response. `Ended` is emitted
    /// once the queue is empty and the last scheduled frame has played.
    pub fn finish_stream(&self) {
        let mut state = self.shared.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        if !state.draining && state.queue.is_empty() {
            arm_settle(&self.shared, &mut state);
        }
    }

    /// Halt everything immediately and forget the current response.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        let was_active = state.is_active();
        state.generation += 1;
        for voice in state.voices.drain(..) {
            self.shared.output.halt(voice);
        }
        state.clear_response();
        let now = self.shared.output.current_frame();
        state.timeline.reset(now);
        if was_active {
            info!(generation = state.generation, "playback stopped");
            self.shared.emit(PlaybackEvent::Stopped);
        }
    }

    /// Replace whatever is playing with one complete clip.
    pub async fn play(&self, source: PlaySource) -> Result<()> {
        self.stop();
        let generation = self.shared.state.lock().generation;
        let bytes = match source {
            PlaySource::Bytes(bytes) => bytes,
            PlaySource::Url(url) => {
                debug!(%url, "fetching clip");
                let response = self.http.get(&url).send().await?.error_for_status()?;
                response.bytes().await?.to_vec()
            }
        };
        if self.shared.state.lock().generation != generation {
            debug!("clip superseded before playback");
            return Ok(());
        }
        self.queue_chunk(bytes);
        self.finish_stream();
        Ok(())
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = clamp_volume(volume);
        self.shared.state.lock().volume = volume;
        self.shared.output.set_gain(volume);
    }

    pub fn volume(&self) -> f32 {
        self.shared.state.lock().volume
    }

    /// True from the first queued chunk until `Ended` or `stop()`.
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().is_active()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn drain(shared: Arc<Shared>, generation: u64) {
    loop {
        let chunk = {
            let mut state = shared.state.lock();
            if state.generation != generation {
                return;
            }
            match state.queue.pop_front() {
                Some(chunk) => chunk,
                None => {
                    state.draining = false;
                    if state.finished {
                        arm_settle(&shared, &mut state);
                    }
                    return;
                }
            }
        };

        let seq = chunk.seq;
        let output = Arc::clone(&shared.output);
        let decoded = match tokio::task::spawn_blocking(move || output.decode(&chunk.bytes)).await {
            Ok(result) => result,
            Err(e) => Err(PrompterError::Decode(format!("decode task failed: {e}"))),
        };

        let mut state = shared.state.lock();
        if state.generation != generation {
            debug!(seq, "dropping chunk decoded for a stopped response");
            return;
        }
        if let Err(e) = decoded.and_then(|pcm| shared.schedule_decoded(&mut state, seq, pcm)) {
            warn!(seq, error = %e, "skipping audio chunk");
            shared.emit(PlaybackEvent::ChunkSkipped {
                seq,
                reason: e.to_string(),
            });
        }
    }
}

fn arm_settle(shared: &Arc<Shared>, state: &mut SchedulerState) {
    if state.settling {
        return;
    }
    state.settling = true;
    tokio::spawn(settle(Arc::clone(shared), state.generation));
}

/// Wait for the output clock to pass the end of the timeline, then report
/// `Ended`. Bails out if a new chunk arrived or the response was stopped.
async fn settle(shared: Arc<Shared>, generation: u64) {
    let rate = shared.output.sample_rate();
    loop {
        let wait = {
            let mut state = shared.state.lock();
            if state.generation != generation {
                return;
            }
            if state.draining || !state.queue.is_empty() || !state.finished {
                // The drain task re-arms settling when it runs dry.
                state.settling = false;
                return;
            }
            let now = shared.output.current_frame();
            let end = state.timeline.end();
            if now >= end {
                let chunks_played = state.chunks_played;
                state.clear_response();
                info!(chunks_played, "playback ended");
                shared.emit(PlaybackEvent::Ended { chunks_played });
                return;
            }
            frames_to_duration(end - now, rate).max(MIN_SETTLE_WAIT)
        };
        tokio::time::sleep(wait).await;
    }
}
