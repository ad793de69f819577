//! Conversation snapshots and their minimized wire form.
//!
//! Minimization happens here, at the transport boundary, so no caller can
//! send more than the service is meant to see: lower-cased text with filler
//! words removed, at most [`MAX_WIRE_TURNS`] non-empty turns, and
//! whole-second timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::buffering::ConversationTurn;
use crate::transcription::Language;

pub const MAX_WIRE_TURNS: usize = 4;

/// Filler tokens dropped before sending.
const FILLERS: &[&str] = &[
    "um", "umm", "uh", "uhh", "uhm", "hmm", "hm", "mm", "mhm", "er", "erm", "ah", "ahh", "eh",
    "like", "basically", "actually", "literally", "matlab",
];

const POSITIVE_WORDS: &[&str] = &["great", "nice", "awesome", "good", "love", "like", "fun", "happy"];
const NEGATIVE_WORDS: &[&str] = &["bad", "boring", "awkward", "sad", "angry", "hate", "tired"];

/// Everything known about the conversation at the moment a pause fires.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    pub turns: Vec<ConversationTurn>,
    pub last_spoken_at: Option<DateTime<Utc>>,
    pub language: Language,
    /// Caller-supplied confidence; estimated when absent.
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTurn {
    pub text: String,
    /// Unix seconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSnapshot {
    pub last_turns: Vec<WireTurn>,
    /// Unix seconds.
    pub last_spoken_at: Option<i64>,
    pub detected_language: Language,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f32>,
}

/// Lower-case `text` and drop filler tokens. Punctuation attached to a filler
/// ("um," / "uh...") does not save it.
pub fn clean_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .filter(|word| {
            let bare = word.trim_matches(|c: char| !c.is_alphanumeric());
            !bare.is_empty() && !FILLERS.contains(&bare)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reduce a snapshot to what goes on the wire.
pub fn minimize(snapshot: &ConversationSnapshot) -> WireSnapshot {
    let mut kept: Vec<(&ConversationTurn, String)> = snapshot
        .turns
        .iter()
        .rev()
        .filter_map(|turn| {
            let cleaned = clean_text(&turn.text);
            (!cleaned.is_empty()).then_some((turn, cleaned))
        })
        .take(MAX_WIRE_TURNS)
        .collect();
    kept.reverse();

    let confidence = snapshot
        .confidence
        .map(|c| c.clamp(0.0, 1.0))
        .or_else(|| mean_confidence(kept.iter().map(|(turn, _)| *turn)))
        .unwrap_or_else(|| estimate_confidence(kept.iter().map(|(_, text)| text.as_str())));

    WireSnapshot {
        last_turns: kept
            .into_iter()
            .map(|(turn, text)| WireTurn {
                text,
                timestamp: turn.timestamp.timestamp(),
            })
            .collect(),
        last_spoken_at: snapshot.last_spoken_at.map(|t| t.timestamp()),
        detected_language: snapshot.language,
        confidence_score: Some(confidence),
    }
}

fn mean_confidence<'a>(turns: impl Iterator<Item = &'a ConversationTurn>) -> Option<f32> {
    let known: Vec<f32> = turns.filter_map(|t| t.confidence).collect();
    if known.is_empty() {
        return None;
    }
    Some((known.iter().sum::<f32>() / known.len() as f32).clamp(0.0, 1.0))
}

/// Sentiment in `[-1, 1]`: (positive - negative word count) / 5, clamped.
pub fn sentiment_score<'a>(texts: impl Iterator<Item = &'a str>) -> f32 {
    let mut score = 0i32;
    for text in texts {
        for word in text.split_whitespace() {
            let bare = word.trim_matches(|c: char| !c.is_alphanumeric());
            if POSITIVE_WORDS.contains(&bare) {
                score += 1;
            } else if NEGATIVE_WORDS.contains(&bare) {
                score -= 1;
            }
        }
    }
    (score as f32 / 5.0).clamp(-1.0, 1.0)
}

/// Fallback confidence when the recognizer reported none.
pub fn estimate_confidence<'a>(texts: impl Iterator<Item = &'a str>) -> f32 {
    (0.7 + 0.15 * sentiment_score(texts)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use tokio::time::Instant;

    fn turn(text: &str, secs: i64) -> ConversationTurn {
        let ts = Utc.timestamp_opt(1_700_000_000 + secs, 250_000_000).unwrap();
        ConversationTurn::new(text, Instant::now(), ts)
    }

    fn snapshot(turns: Vec<ConversationTurn>) -> ConversationSnapshot {
        ConversationSnapshot {
            turns,
            last_spoken_at: None,
            language: Language::English,
            confidence: None,
        }
    }

    #[test]
    fn clean_text_lowercases_and_strips_fillers() {
        assert_eq!(clean_text("Um, I LIKE uh the Beach"), "i the beach");
        assert_eq!(clean_text("uhh... hmm"), "");
    }

    #[test]
    fn keeps_last_four_non_empty_turns_in_order() {
        let snap = snapshot(vec![
            turn("We went hiking", 0),
            turn("It was Cold", 1),
            turn("um", 2),
            turn("The view was great", 3),
            turn("uh hmm", 4),
            turn("Basically I loved it", 5),
        ]);
        let wire = minimize(&snap);
        let texts: Vec<&str> = wire.last_turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["we went hiking", "it was cold", "the view was great", "i loved it"]);
        assert_eq!(wire.last_turns[0].timestamp, 1_700_000_000);
    }

    #[test]
    fn at_most_four_turns_even_when_all_are_meaningful() {
        let snap = snapshot((0..6).map(|i| turn(&format!("turn {i}"), i)).collect());
        let wire = minimize(&snap);
        assert_eq!(wire.last_turns.len(), MAX_WIRE_TURNS);
        assert_eq!(wire.last_turns[0].text, "turn 2");
    }

    #[test]
    fn last_spoken_at_is_whole_seconds() {
        let mut snap = snapshot(vec![turn("hello", 0)]);
        snap.last_spoken_at = Some(Utc.timestamp_opt(1_700_000_042, 999_000_000).unwrap());
        assert_eq!(minimize(&snap).last_spoken_at, Some(1_700_000_042));
    }

    #[test]
    fn confidence_prefers_measured_mean() {
        let snap = snapshot(vec![
            turn("one", 0).with_confidence(Some(0.6)),
            turn("two", 1).with_confidence(Some(0.8)),
            turn("three", 2),
        ]);
        assert_relative_eq!(minimize(&snap).confidence_score.unwrap(), 0.7, epsilon = 1e-6);
    }

    #[test]
    fn confidence_falls_back_to_sentiment_estimate() {
        let snap = snapshot(vec![turn("that was great fun", 0)]);
        // sentiment = 2 / 5 = 0.4 -> 0.7 + 0.06
        assert_relative_eq!(minimize(&snap).confidence_score.unwrap(), 0.76, epsilon = 1e-6);

        let neutral = snapshot(vec![turn("we talked", 0)]);
        assert_relative_eq!(minimize(&neutral).confidence_score.unwrap(), 0.7);
    }

    #[test]
    fn caller_supplied_confidence_wins() {
        let mut snap = snapshot(vec![turn("fine", 0).with_confidence(Some(0.2))]);
        snap.confidence = Some(1.5);
        assert_relative_eq!(minimize(&snap).confidence_score.unwrap(), 1.0);
    }

    #[test]
    fn sentiment_is_clamped() {
        let texts = ["bad sad angry hate tired boring awkward"];
        assert_relative_eq!(sentiment_score(texts.iter().copied()), -1.0);
    }
}
