//! Pause & cooldown detection.
//!
//! `PauseDetector` turns the stream of "last spoke at" instants into a single
//! debounced trigger per silence episode. It holds no timers of its own: the
//! owner calls [`PauseDetector::tick`] on a fixed period and feeds speech
//! through [`PauseDetector::spoke`].
//!
//! ```text
//!  spoke ──► episode open ──silence ≥ T, not in cooldown──► triggered
//!    ▲                                                         │
//!    └──────────────────── spoke again ◄──────────────────────┘
//! ```
//!
//! All comparisons are inclusive: a silence of exactly `T` triggers, and the
//! cooldown ends exactly at `cooldown_until`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ipc::events::PauseProgressEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PauseConfig {
    /// Silence that qualifies as a pause.
    pub silence_threshold_ms: u64,
    /// Suppression window after a delivered suggestion.
    pub cooldown_ms: u64,
    /// Sampling period of the owner's tick.
    pub tick_ms: u64,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 5_000,
            cooldown_ms: 30_000,
            tick_ms: 100,
        }
    }
}

impl PauseConfig {
    pub fn normalize(&mut self) {
        self.silence_threshold_ms = self.silence_threshold_ms.clamp(500, 60_000);
        self.cooldown_ms = self.cooldown_ms.min(600_000);
        self.tick_ms = self.tick_ms.clamp(10, 1_000);
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Snapshot of the detector's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PauseState {
    pub listening: bool,
    pub last_spoken_at: Option<Instant>,
    /// Silence measured at the last tick.
    pub silence: Duration,
    pub triggered: bool,
    pub cooldown_until: Option<Instant>,
}

/// Raised once per qualifying silence episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseTrigger {
    pub silence: Duration,
    pub last_spoken_at: Instant,
}

#[derive(Debug, Clone)]
pub struct PauseDetector {
    config: PauseConfig,
    state: PauseState,
}

impl PauseDetector {
    pub fn new(config: PauseConfig) -> Self {
        Self {
            config,
            state: PauseState::default(),
        }
    }

    pub fn config(&self) -> &PauseConfig {
        &self.config
    }

    pub fn state(&self) -> &PauseState {
        &self.state
    }

    pub fn is_listening(&self) -> bool {
        self.state.listening
    }

    /// Toggle listening. Either edge starts from a clean episode, and
    /// stopping also drops any running cooldown.
    pub fn set_listening(&mut self, listening: bool) {
        if self.state.listening == listening {
            return;
        }
        debug!(listening, "pause detector listening changed");
        self.state.listening = listening;
        self.state.last_spoken_at = None;
        self.state.silence = Duration::ZERO;
        self.state.triggered = false;
        if !listening {
            self.state.cooldown_until = None;
        }
    }

    /// Record speech at `at`. Only an advancing timestamp opens a new episode.
    pub fn spoke(&mut self, at: Instant) {
        if !self.state.listening {
            return;
        }
        if self.state.last_spoken_at.is_some_and(|prev| at <= prev) {
            return;
        }
        self.state.last_spoken_at = Some(at);
        self.state.silence = Duration::ZERO;
        self.state.triggered = false;
    }

    /// Sample silence at `now`; returns the trigger at most once per episode.
    pub fn tick(&mut self, now: Instant) -> Option<PauseTrigger> {
        if !self.state.listening {
            return None;
        }
        let last = self.state.last_spoken_at?;
        let silence = now.saturating_duration_since(last);
        self.state.silence = silence;

        if self.state.triggered || silence < self.config.silence_threshold() {
            return None;
        }
        if self.in_cooldown(now) {
            return None;
        }
        self.state.triggered = true;
        info!(silence_ms = silence.as_millis() as u64, "pause detected");
        Some(PauseTrigger {
            silence,
            last_spoken_at: last,
        })
    }

    /// Start the cooldown after a response has been delivered.
    pub fn mark_suggestion_delivered(&mut self, now: Instant) {
        let until = now + self.config.cooldown();
        debug!(cooldown_ms = self.config.cooldown_ms, "suggestion delivered, cooldown armed");
        self.state.cooldown_until = Some(until);
    }

    /// Clear trigger and cooldown and rebase silence to `now`.
    pub fn reset_pause(&mut self, now: Instant) {
        self.state.triggered = false;
        self.state.cooldown_until = None;
        self.state.silence = Duration::ZERO;
        if self.state.listening {
            self.state.last_spoken_at = Some(now);
        }
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.state.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.state
            .cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Silence at `now`, zero when not listening or before any speech.
    pub fn silence_at(&self, now: Instant) -> Duration {
        match (self.state.listening, self.state.last_spoken_at) {
            (true, Some(last)) => now.saturating_duration_since(last),
            _ => Duration::ZERO,
        }
    }

    /// `min(silence / threshold, 1)`, forced to 0 during cooldown.
    pub fn silence_progress(&self, now: Instant) -> f32 {
        if self.in_cooldown(now) {
            return 0.0;
        }
        let threshold = self.config.silence_threshold().as_secs_f32();
        if threshold <= 0.0 {
            return 0.0;
        }
        (self.silence_at(now).as_secs_f32() / threshold).clamp(0.0, 1.0)
    }

    pub fn progress(&self, now: Instant) -> PauseProgressEvent {
        PauseProgressEvent {
            silence_ms: self.silence_at(now).as_millis() as u64,
            progress: self.silence_progress(now),
            in_cooldown: self.in_cooldown(now),
            cooldown_remaining_ms: self.cooldown_remaining(now).as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn listening_detector(t0: Instant) -> PauseDetector {
        let mut det = PauseDetector::new(PauseConfig::default());
        det.set_listening(true);
        det
    }

    /// Tick every 100 ms over `[from, to]` and collect trigger offsets.
    fn run_ticks(det: &mut PauseDetector, t0: Instant, from: u64, to: u64) -> Vec<u64> {
        (from..=to)
            .step_by(100)
            .filter(|&off| det.tick(t0 + ms(off)).is_some())
            .collect()
    }

    #[test]
    fn fires_once_at_threshold_inclusive() {
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        det.spoke(t0);

        assert!(det.tick(t0 + ms(4_999)).is_none());
        let trigger = det.tick(t0 + ms(5_000)).expect("fires at exactly T");
        assert_eq!(trigger.silence, ms(5_000));
        assert!(det.tick(t0 + ms(9_000)).is_none(), "once per episode");
    }

    #[test]
    fn speech_opens_a_new_episode() {
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        det.spoke(t0);
        assert_eq!(run_ticks(&mut det, t0, 0, 7_000), vec![5_000]);

        det.spoke(t0 + ms(7_000));
        assert_eq!(run_ticks(&mut det, t0, 7_100, 13_000), vec![12_000]);
    }

    #[test]
    fn stale_spoke_does_not_reset_episode() {
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        det.spoke(t0 + ms(1_000));
        det.tick(t0 + ms(6_000)).expect("trigger");
        det.spoke(t0 + ms(500));
        assert!(det.state().triggered);
    }

    #[test]
    fn cooldown_scenario() {
        // T = 5 s, cooldown = 30 s: speak at 0, pause at 5 s, response ends
        // at 6 s, no second trigger while cooling down.
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        det.spoke(t0);

        assert_eq!(run_ticks(&mut det, t0, 0, 6_000), vec![5_000]);
        det.mark_suggestion_delivered(t0 + ms(6_000));
        assert_eq!(det.state().cooldown_until, Some(t0 + ms(36_000)));

        assert!(det.tick(t0 + ms(10_000)).is_none());
        assert!(det.in_cooldown(t0 + ms(35_999)));
        assert!(!det.in_cooldown(t0 + ms(36_000)));
    }

    #[test]
    fn cooldown_suppresses_new_episode_until_it_expires() {
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        det.mark_suggestion_delivered(t0);
        det.spoke(t0 + ms(1_000));

        assert!(run_ticks(&mut det, t0, 1_000, 29_900).is_empty());
        assert_eq!(run_ticks(&mut det, t0, 30_000, 31_000), vec![30_000]);
    }

    #[test]
    fn progress_is_clamped_and_zero_in_cooldown() {
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        det.spoke(t0);

        assert_relative_eq!(det.silence_progress(t0 + ms(2_500)), 0.5);
        assert_relative_eq!(det.silence_progress(t0 + ms(20_000)), 1.0);

        det.mark_suggestion_delivered(t0 + ms(6_000));
        assert_relative_eq!(det.silence_progress(t0 + ms(7_000)), 0.0);
        let progress = det.progress(t0 + ms(7_000));
        assert!(progress.in_cooldown);
        assert_eq!(progress.cooldown_remaining_ms, 29_000);
    }

    #[test]
    fn reset_pause_clears_cooldown_and_rebases() {
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        det.spoke(t0);
        det.tick(t0 + ms(5_000)).expect("trigger");
        det.mark_suggestion_delivered(t0 + ms(5_500));

        det.reset_pause(t0 + ms(6_000));
        assert!(!det.in_cooldown(t0 + ms(6_000)));
        assert!(!det.state().triggered);
        assert!(det.tick(t0 + ms(10_999)).is_none());
        assert!(det.tick(t0 + ms(11_000)).is_some());
    }

    #[test]
    fn stopping_listening_resets_the_episode() {
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        det.spoke(t0);
        det.set_listening(false);
        assert_eq!(det.state().last_spoken_at, None);
        assert!(det.tick(t0 + ms(9_000)).is_none());
        det.spoke(t0 + ms(9_000));
        assert_eq!(det.state().last_spoken_at, None, "ignored while not listening");
        assert_relative_eq!(det.silence_progress(t0 + ms(9_000)), 0.0);
    }

    #[test]
    fn stop_then_start_inside_cooldown_triggers_again() {
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        det.mark_suggestion_delivered(t0);
        assert!(det.in_cooldown(t0 + ms(1_000)));

        det.set_listening(false);
        det.set_listening(true);
        assert!(!det.in_cooldown(t0 + ms(2_000)));
        assert_eq!(det.state().cooldown_until, None);

        det.spoke(t0 + ms(2_000));
        assert_eq!(run_ticks(&mut det, t0, 2_000, 8_000), vec![7_000]);
    }

    #[test]
    fn no_trigger_before_first_speech() {
        let t0 = Instant::now();
        let mut det = listening_detector(t0);
        assert!(run_ticks(&mut det, t0, 0, 60_000).is_empty());
    }
}
