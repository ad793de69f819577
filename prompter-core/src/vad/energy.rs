//! Energy VAD with an adaptive noise floor.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the incoming frame.
//! 2. The first frame seeds the noise floor.
//! 3. If `rms - floor ≥ delta` → `Speech`; the floor is left alone so speech
//!    does not drag it upward.
//! 4. Otherwise → `Silence`, and the floor moves toward the frame's RMS by
//!    `alpha` (exponential moving average).

use super::{InterruptionConfig, VadDecision, VoiceActivityDetector};
use crate::buffering::PcmBuffer;

#[derive(Debug, Clone)]
pub struct AdaptiveEnergyVad {
    /// Required margin over the noise floor. Typical range: 0.01–0.05.
    delta: f32,
    /// EMA weight for floor updates.
    alpha: f32,
    noise_floor: Option<f32>,
}

impl AdaptiveEnergyVad {
    pub fn new(delta: f32, alpha: f32) -> Self {
        Self {
            delta,
            alpha: alpha.clamp(0.0, 1.0),
            noise_floor: None,
        }
    }

    pub fn from_config(config: &InterruptionConfig) -> Self {
        Self::new(config.rms_delta, config.noise_floor_alpha)
    }

    /// Current ambient estimate, if any frame has been seen.
    pub fn noise_floor(&self) -> Option<f32> {
        self.noise_floor
    }
}

impl Default for AdaptiveEnergyVad {
    fn default() -> Self {
        Self::from_config(&InterruptionConfig::default())
    }
}

impl VoiceActivityDetector for AdaptiveEnergyVad {
    fn classify(&mut self, frame: &PcmBuffer) -> VadDecision {
        let rms = frame.rms();
        let Some(floor) = self.noise_floor else {
            self.noise_floor = Some(rms);
            return VadDecision::Silence;
        };

        if rms - floor >= self.delta {
            VadDecision::Speech
        } else {
            self.noise_floor = Some(floor + self.alpha * (rms - floor));
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {
        self.noise_floor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn frame(amplitude: f32) -> PcmBuffer {
        PcmBuffer::new(vec![amplitude; 320], 16_000)
    }

    #[test]
    fn first_frame_seeds_the_floor() {
        let mut vad = AdaptiveEnergyVad::new(0.02, 0.05);
        assert_eq!(vad.classify(&frame(0.01)), VadDecision::Silence);
        assert_relative_eq!(vad.noise_floor().unwrap(), 0.01);
    }

    #[test]
    fn speech_is_relative_to_the_floor() {
        let mut vad = AdaptiveEnergyVad::new(0.02, 0.05);
        vad.classify(&frame(0.1)); // noisy room
        assert_eq!(vad.classify(&frame(0.11)), VadDecision::Silence);
        assert_eq!(vad.classify(&frame(0.2)), VadDecision::Speech);
    }

    #[test]
    fn floor_tracks_ambient_but_not_speech() {
        let mut vad = AdaptiveEnergyVad::new(0.05, 0.5);
        vad.classify(&frame(0.0));
        vad.classify(&frame(0.02));
        assert_relative_eq!(vad.noise_floor().unwrap(), 0.01);

        vad.classify(&frame(0.5));
        assert_relative_eq!(vad.noise_floor().unwrap(), 0.01);
    }

    #[test]
    fn reset_forgets_the_floor() {
        let mut vad = AdaptiveEnergyVad::default();
        vad.classify(&frame(0.3));
        vad.reset();
        assert!(vad.noise_floor().is_none());
    }
}
