//! Voice activity detection for the auto-stop interruption policy.
//!
//! The `VoiceActivityDetector` trait classifies single frames;
//! [`interruption::InterruptionDetector`] turns the frame decisions into an
//! utterance-level verdict: a short backchannel ("mm-hm", "yeah") versus a
//! sustained interruption that should stop playback.

pub mod energy;
pub mod interruption;

pub use energy::AdaptiveEnergyVad;
pub use interruption::{InterruptionDetector, SpeechVerdict};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffering::PcmBuffer;

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
pub trait VoiceActivityDetector: Send + 'static {
    /// Analyse one frame and return a speech/silence decision.
    fn classify(&mut self, frame: &PcmBuffer) -> VadDecision;

    /// Forget any adaptive state.
    fn reset(&mut self);
}

/// Tunables for the auto-stop policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InterruptionConfig {
    /// Utterances shorter than this are backchannels.
    pub backchannel_max_ms: u64,
    /// Sustained speech at least this long interrupts playback.
    pub interruption_min_ms: u64,
    /// RMS above the noise floor that counts as speech.
    pub rms_delta: f32,
    /// EMA weight applied to the noise floor on non-speech frames.
    pub noise_floor_alpha: f32,
    /// Silent gaps up to this long do not end an utterance.
    pub gap_tolerance_ms: u64,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            backchannel_max_ms: 600,
            interruption_min_ms: 1_200,
            rms_delta: 0.02,
            noise_floor_alpha: 0.05,
            gap_tolerance_ms: 200,
        }
    }
}

impl InterruptionConfig {
    pub fn normalize(&mut self) {
        self.noise_floor_alpha = self.noise_floor_alpha.clamp(0.001, 1.0);
        self.rms_delta = self.rms_delta.clamp(0.001, 1.0);
        self.interruption_min_ms = self.interruption_min_ms.max(self.backchannel_max_ms);
    }

    pub fn backchannel_max(&self) -> Duration {
        Duration::from_millis(self.backchannel_max_ms)
    }

    pub fn interruption_min(&self) -> Duration {
        Duration::from_millis(self.interruption_min_ms)
    }

    pub fn gap_tolerance(&self) -> Duration {
        Duration::from_millis(self.gap_tolerance_ms)
    }
}

/// What happens when the user talks over playback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum InterruptionPolicy {
    /// Playback only stops on an explicit stop command.
    #[default]
    ManualOnly,
    /// Sustained speech during playback stops it.
    AutoStop(InterruptionConfig),
}

impl InterruptionPolicy {
    pub fn normalize(&mut self) {
        if let InterruptionPolicy::AutoStop(cfg) = self {
            cfg.normalize();
        }
    }

    pub fn auto_stop(&self) -> Option<&InterruptionConfig> {
        match self {
            InterruptionPolicy::ManualOnly => None,
            InterruptionPolicy::AutoStop(cfg) => Some(cfg),
        }
    }
}
