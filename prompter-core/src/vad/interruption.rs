//! Utterance-level classification of speech heard during playback.
//!
//! Time is measured in audio, not wall clock: every frame advances the run by
//! its own duration, so the verdict does not depend on delivery jitter.

use std::time::Duration;

use tracing::debug;

use super::{AdaptiveEnergyVad, InterruptionConfig, VoiceActivityDetector};
use crate::buffering::PcmBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechVerdict {
    /// Short acknowledgment; playback continues.
    Backchannel,
    /// Ended between the backchannel and interruption thresholds.
    Ambiguous,
    /// Sustained speech; playback should stop.
    Interruption,
}

pub struct InterruptionDetector {
    config: InterruptionConfig,
    vad: Box<dyn VoiceActivityDetector>,
    in_speech: bool,
    /// Speech plus tolerated gaps in the current utterance.
    run: Duration,
    /// Trailing silence since the last speech frame.
    gap: Duration,
    /// `Interruption` already reported for this utterance.
    reported: bool,
}

impl InterruptionDetector {
    pub fn new(config: InterruptionConfig) -> Self {
        let vad = Box::new(AdaptiveEnergyVad::from_config(&config));
        Self::with_vad(config, vad)
    }

    pub fn with_vad(config: InterruptionConfig, vad: Box<dyn VoiceActivityDetector>) -> Self {
        Self {
            config,
            vad,
            in_speech: false,
            run: Duration::ZERO,
            gap: Duration::ZERO,
            reported: false,
        }
    }

    /// Feed one frame. Returns a verdict when one becomes known: an
    /// interruption as soon as the run crosses the threshold, otherwise a
    /// backchannel or ambiguous verdict when the utterance ends.
    pub fn push(&mut self, frame: &PcmBuffer) -> Option<SpeechVerdict> {
        let frame_len = Duration::from_secs_f64(frame.duration_secs());
        if self.vad.classify(frame).is_speech() {
            if !self.in_speech {
                self.in_speech = true;
                self.run = Duration::ZERO;
                self.gap = Duration::ZERO;
                self.reported = false;
            }
            self.run += self.gap + frame_len;
            self.gap = Duration::ZERO;

            if !self.reported && self.run >= self.config.interruption_min() {
                self.reported = true;
                debug!(run_ms = self.run.as_millis() as u64, "sustained speech over playback");
                return Some(SpeechVerdict::Interruption);
            }
            return None;
        }

        if !self.in_speech {
            return None;
        }
        self.gap += frame_len;
        if self.gap <= self.config.gap_tolerance() {
            return None;
        }

        // Utterance over.
        self.in_speech = false;
        if self.reported {
            return None;
        }
        let verdict = if self.run < self.config.backchannel_max() {
            SpeechVerdict::Backchannel
        } else {
            SpeechVerdict::Ambiguous
        };
        debug!(run_ms = self.run.as_millis() as u64, ?verdict, "utterance ended");
        Some(verdict)
    }

    pub fn reset(&mut self) {
        self.vad.reset();
        self.in_speech = false;
        self.run = Duration::ZERO;
        self.gap = Duration::ZERO;
        self.reported = false;
    }
}
