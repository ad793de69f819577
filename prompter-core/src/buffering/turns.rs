//! Rolling, time-bounded log of finalized speech turns.
//!
//! Entries are evicted lazily on every insert and on the periodic sweep the
//! transcription service runs on its tick. After either operation every entry
//! lies within `[now - window, now]` and the log is in non-decreasing time
//! order.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// One finalized utterance of user speech.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    /// Trimmed recognized text. Never empty inside a `TurnBuffer`.
    pub text: String,
    /// Monotonic instant the result was finalized. Drives window eviction.
    pub at: Instant,
    /// Wall-clock time of the same moment, used on the wire.
    pub timestamp: DateTime<Utc>,
    /// Recognizer confidence for the chosen alternative, if reported.
    pub confidence: Option<f32>,
}

impl ConversationTurn {
    pub fn new(text: impl Into<String>, at: Instant, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            at,
            timestamp,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: Option<f32>) -> Self {
        self.confidence = confidence.map(|c| c.clamp(0.0, 1.0));
        self
    }
}

/// Ordered turn log bounded by a rolling time window.
#[derive(Debug, Clone)]
pub struct TurnBuffer {
    window: Duration,
    turns: VecDeque<ConversationTurn>,
}

impl TurnBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            turns: VecDeque::new(),
        }
    }

    /// Append a turn, trimming its text. Empty turns are dropped.
    ///
    /// A turn stamped earlier than the current tail is clamped to the tail's
    /// instant so the log never goes backwards in time.
    ///
    /// Returns `true` if the turn was stored.
    pub fn push(&mut self, mut turn: ConversationTurn) -> bool {
        let trimmed = turn.text.trim();
        if trimmed.is_empty() {
            return false;
        }
        if trimmed.len() != turn.text.len() {
            turn.text = trimmed.to_string();
        }

        if let Some(last) = self.turns.back() {
            if turn.at < last.at {
                turn.at = last.at;
            }
            if turn.timestamp < last.timestamp {
                turn.timestamp = last.timestamp;
            }
        }

        let now = turn.at;
        self.turns.push_back(turn);
        self.evict_expired(now);
        true
    }

    /// Drop every entry older than the window relative to `now`.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.turns.front() {
            if now.saturating_duration_since(front.at) > self.window {
                self.turns.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    pub fn turns(&self) -> impl DoubleEndedIterator<Item = &ConversationTurn> + ExactSizeIterator {
        self.turns.iter()
    }

    pub fn latest(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(text: &str, at: Instant) -> ConversationTurn {
        ConversationTurn::new(text, at, Utc::now())
    }

    #[test]
    fn push_trims_and_drops_empty_text() {
        let mut buf = TurnBuffer::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(buf.push(turn("  hello there  ", now)));
        assert!(!buf.push(turn("   ", now)));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.latest().map(|t| t.text.as_str()), Some("hello there"));
    }

    #[test]
    fn insert_evicts_entries_older_than_window() {
        let mut buf = TurnBuffer::new(Duration::from_secs(10));
        let t0 = Instant::now();
        buf.push(turn("one", t0));
        buf.push(turn("two", t0 + Duration::from_secs(5)));
        buf.push(turn("three", t0 + Duration::from_secs(12)));

        let texts: Vec<_> = buf.turns().map(|t| t.text.clone()).collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[test]
    fn sweep_evicts_without_insert() {
        let mut buf = TurnBuffer::new(Duration::from_secs(10));
        let t0 = Instant::now();
        buf.push(turn("one", t0));
        assert_eq!(buf.evict_expired(t0 + Duration::from_secs(10)), 0);
        assert_eq!(buf.evict_expired(t0 + Duration::from_secs(11)), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn out_of_order_instants_are_clamped_to_tail() {
        let mut buf = TurnBuffer::new(Duration::from_secs(60));
        let t0 = Instant::now();
        buf.push(turn("late", t0 + Duration::from_secs(3)));
        buf.push(turn("early", t0));

        let instants: Vec<_> = buf.turns().map(|t| t.at).collect();
        assert!(instants.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn arbitrary_sequences_stay_bounded_and_ordered() {
        let window = Duration::from_secs(30);
        let mut buf = TurnBuffer::new(window);
        let t0 = Instant::now();
        // Deterministic jittered arrival offsets (seconds), some going backwards.
        let offsets = [0u64, 4, 2, 9, 31, 30, 45, 44, 80, 81, 79, 120];
        for (i, off) in offsets.iter().enumerate() {
            buf.push(turn(&format!("t{i}"), t0 + Duration::from_secs(*off)));
            let newest = buf.latest().map(|t| t.at).unwrap();
            assert!(buf.turns().all(|t| newest.duration_since(t.at) <= window));
            let instants: Vec<_> = buf.turns().map(|t| t.at).collect();
            assert!(instants.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn confidence_is_clamped() {
        let t = turn("hi", Instant::now()).with_confidence(Some(1.7));
        assert_eq!(t.confidence, Some(1.0));
    }
}
