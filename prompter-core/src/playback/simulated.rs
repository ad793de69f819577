//! `SimulatedOutput`: audio output with no device behind it.
//!
//! The clock follows `tokio::time`, so tests running with a paused clock can
//! advance playback deterministically. Every scheduled voice is recorded for
//! inspection.

use std::io::Cursor;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{AudioOutput, VoiceId};
use crate::buffering::PcmBuffer;
use crate::error::{PrompterError, Result};

/// One `schedule` call as the output saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledVoice {
    pub id: VoiceId,
    pub start_frame: u64,
    pub frames: u64,
    pub halted_at: Option<u64>,
}

impl ScheduledVoice {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frames
    }

    pub fn is_playing_at(&self, frame: u64) -> bool {
        let stopped = self.halted_at.map_or(self.end_frame(), |h| h.min(self.end_frame()));
        (self.start_frame..stopped).contains(&frame)
    }
}

struct SimState {
    next_id: VoiceId,
    voices: Vec<ScheduledVoice>,
    gain: f32,
}

pub struct SimulatedOutput {
    origin: Instant,
    sample_rate: u32,
    state: Mutex<SimState>,
}

impl SimulatedOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            origin: Instant::now(),
            sample_rate,
            state: Mutex::new(SimState {
                next_id: 1,
                voices: Vec::new(),
                gain: 1.0,
            }),
        }
    }

    pub fn voices(&self) -> Vec<ScheduledVoice> {
        self.state.lock().voices.clone()
    }

    pub fn gain(&self) -> f32 {
        self.state.lock().gain
    }

    /// Voices audible at the current frame.
    pub fn playing_count(&self) -> usize {
        let now = self.current_frame();
        self.state
            .lock()
            .voices
            .iter()
            .filter(|v| v.is_playing_at(now))
            .count()
    }
}

impl AudioOutput for SimulatedOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_frame(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.origin);
        (elapsed.as_nanos() * self.sample_rate as u128 / 1_000_000_000) as u64
    }

    fn schedule(&self, buffer: Arc<PcmBuffer>, start_frame: u64) -> Result<VoiceId> {
        if buffer.sample_rate != self.sample_rate {
            return Err(PrompterError::AudioOutput(format!(
                "buffer at {} Hz scheduled on {} Hz output",
                buffer.sample_rate, self.sample_rate
            )));
        }
        let now = self.current_frame();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.voices.push(ScheduledVoice {
            id,
            start_frame: start_frame.max(now),
            frames: buffer.samples.len() as u64,
            halted_at: None,
        });
        debug!(id, start_frame, frames = buffer.samples.len(), "simulated voice scheduled");
        Ok(id)
    }

    fn halt(&self, voice: VoiceId) {
        let now = self.current_frame();
        let mut state = self.state.lock();
        if let Some(v) = state.voices.iter_mut().find(|v| v.id == voice) {
            if v.halted_at.is_none() && now < v.end_frame() {
                v.halted_at = Some(now);
            }
        }
    }

    fn set_gain(&self, gain: f32) {
        self.state.lock().gain = gain;
    }
}

/// A mono 16-bit WAV of `frames` samples of a quiet constant tone.
pub fn wav_fixture(frames: usize, sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)
            .map_err(|e| PrompterError::Decode(e.to_string()))?;
        for _ in 0..frames {
            writer
                .write_sample(3_000i16)
                .map_err(|e| PrompterError::Decode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| PrompterError::Decode(e.to_string()))?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_tokio_time() {
        let out = SimulatedOutput::new(48_000);
        assert_eq!(out.current_frame(), 0);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(out.current_frame(), 12_000);
    }

    #[tokio::test(start_paused = true)]
    async fn halt_cuts_a_voice_short() {
        let out = SimulatedOutput::new(1_000);
        let id = out
            .schedule(Arc::new(PcmBuffer::new(vec![0.0; 1_000], 1_000)), 0)
            .unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(out.playing_count(), 1);
        out.halt(id);
        assert_eq!(out.playing_count(), 0);
        assert_eq!(out.voices()[0].halted_at, Some(100));
    }

    #[test]
    fn fixture_decodes_to_the_requested_length() {
        let bytes = wav_fixture(480, 48_000).unwrap();
        let pcm = crate::playback::decode_chunk(&bytes, 48_000).unwrap();
        assert_eq!(pcm.samples.len(), 480);
    }
}
