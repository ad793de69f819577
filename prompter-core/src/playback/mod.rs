//! Streaming, gapless playback of response audio.
//!
//! The `AudioOutput` trait is the seam to whatever actually produces sound:
//! [`crate::audio::CpalOutput`] on real hardware, [`SimulatedOutput`] in tests.
//! Its clock is counted in output frames, so scheduling chunks back to back
//! on a [`PlaybackTimeline`] is exact to the sample.
//!
//! ```text
//! queue_chunk ─► queue ─► drain task ─ decode (blocking pool) ─► timeline.reserve ─► output.schedule
//! finish_stream ─────────────────────────────────► settle task ─► PlaybackEvent::Ended
//! stop ─► generation++, halt voices, clear queue, timeline.reset(now)
//! ```

pub mod decode;
pub mod scheduler;
pub mod simulated;
pub mod timeline;

pub use decode::decode_chunk;
pub use scheduler::PlaybackScheduler;
pub use simulated::SimulatedOutput;
pub use timeline::PlaybackTimeline;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffering::PcmBuffer;
use crate::error::Result;

/// Handle to one scheduled buffer.
pub type VoiceId = u64;

/// Contract for audio output engines.
///
/// Implementations are process-scoped: one instance lives for the whole
/// session and is shared by reference, never recreated per response.
pub trait AudioOutput: Send + Sync + 'static {
    /// Frame rate of the output clock.
    fn sample_rate(&self) -> u32;

    /// Frames rendered since the output was created.
    fn current_frame(&self) -> u64;

    /// Decode encoded bytes into mono PCM at [`Self::sample_rate`].
    ///
    /// Runs on the blocking pool; may be slow.
    fn decode(&self, bytes: &[u8]) -> Result<PcmBuffer> {
        decode_chunk(bytes, self.sample_rate())
    }

    /// Start `buffer` at `start_frame`, or immediately if that frame is
    /// already past.
    fn schedule(&self, buffer: Arc<PcmBuffer>, start_frame: u64) -> Result<VoiceId>;

    /// Silence a scheduled voice now. Unknown or finished voices are ignored.
    fn halt(&self, voice: VoiceId);

    /// Master gain in `[0, 1]`, applied without interrupting playback.
    fn set_gain(&self, gain: f32);
}

/// Convert a frame count at `sample_rate` into wall time.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((frames as u128 * 1_000_000_000 / sample_rate as u128) as u64)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlaybackConfig {
    pub volume: f32,
    /// Preferred output rate; the device default is used when `None`.
    pub output_sample_rate: Option<u32>,
    /// Output device by name; the system default when `None`.
    pub output_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            output_sample_rate: None,
            output_device: None,
        }
    }
}

impl PlaybackConfig {
    pub fn normalize(&mut self) {
        self.volume = clamp_volume(self.volume);
        self.output_sample_rate = self.output_sample_rate.filter(|r| (8_000..=192_000).contains(r));
        self.output_device = self
            .output_device
            .take()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }
}

pub(crate) fn clamp_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Source for single-shot playback.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaySource {
    Url(String),
    Bytes(Vec<u8>),
}
