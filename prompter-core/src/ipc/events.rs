//! Event types broadcast by the engine and its components.
//!
//! | Event | Producer | Subscribe via |
//! |-------|----------|---------------|
//! | `AppStateEvent` | orchestrator | `PrompterEngine::subscribe_state` |
//! | `TranscriptEvent` | transcription service | `subscribe_transcripts` |
//! | `TranscriptionStatusEvent` | transcription service | `subscribe_transcription_status` |
//! | `PauseProgressEvent` | orchestrator tick | `subscribe_pause` |
//! | `ConnectionEvent` | session transport | `subscribe_connection` |
//! | `PlaybackEvent` | playback scheduler | `subscribe_playback` |
//! | `SuggestionEvent` | orchestrator | `subscribe_suggestions` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

/// The single externally observed summary of the whole client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl AppStatus {
    pub fn label(self) -> &'static str {
        match self {
            AppStatus::Idle => "idle",
            AppStatus::Listening => "listening",
            AppStatus::Thinking => "thinking",
            AppStatus::Speaking => "speaking",
        }
    }
}

/// Emitted whenever `AppStatus` changes, or a terminal error is raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateEvent {
    pub status: AppStatus,
    /// Human-readable detail, e.g. a terminal error message.
    pub detail: Option<String>,
    /// True when `detail` describes a failure that will not recover on its own.
    pub terminal: bool,
}

// ---------------------------------------------------------------------------
// Transcription
// ---------------------------------------------------------------------------

/// Distinguishes live interim hypotheses from committed finals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    /// Interim hypothesis; replaced by the next interim or final.
    Interim,
    /// Committed turn; already appended to the turn buffer.
    Final,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub kind: TranscriptKind,
    pub text: String,
    /// Confidence in [0.0, 1.0], if the recognizer reported one.
    pub confidence: Option<f32>,
}

/// Lifecycle phase of the transcription controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionPhase {
    #[default]
    Idle,
    Starting,
    Active,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionStatusEvent {
    pub phase: TranscriptionPhase,
    /// Session generation the phase refers to.
    pub generation: u64,
    pub detail: Option<String>,
    pub terminal: bool,
}

// ---------------------------------------------------------------------------
// Pause detection
// ---------------------------------------------------------------------------

/// Emitted on every detector tick while listening.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseProgressEvent {
    pub silence_ms: u64,
    /// `min(silence / threshold, 1)`, forced to 0 during cooldown.
    pub progress: f32,
    pub in_cooldown: bool,
    pub cooldown_remaining_ms: u64,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub status: ConnectionStatus,
    pub attempt: u32,
    /// Delay until the next automatic retry, when one is scheduled.
    pub next_retry_ms: Option<u64>,
    pub detail: Option<String>,
    pub terminal: bool,
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PlaybackEvent {
    /// First chunk of a response has been scheduled.
    Started,
    /// A chunk failed to decode and was skipped.
    #[serde(rename_all = "camelCase")]
    ChunkSkipped { seq: u64, reason: String },
    /// Queue drained, stream finished, and all scheduled audio has played.
    #[serde(rename_all = "camelCase")]
    Ended { chunks_played: u64 },
    /// Playback was halted by `stop()`.
    Stopped,
}

// ---------------------------------------------------------------------------
// Suggestions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionEvent {
    pub text: String,
    pub language: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_state_event_serializes_with_camel_case_and_lowercase_status() {
        let event = AppStateEvent {
            status: AppStatus::Thinking,
            detail: Some("waiting".into()),
            terminal: false,
        };
        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["status"], "thinking");
        assert_eq!(json["detail"], "waiting");
        assert_eq!(json["terminal"], false);
    }

    #[test]
    fn transcript_kind_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<TranscriptKind>(r#""Final""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn pause_progress_uses_camel_case_fields() {
        let event = PauseProgressEvent {
            silence_ms: 2_500,
            progress: 0.5,
            in_cooldown: false,
            cooldown_remaining_ms: 0,
        };
        let json = serde_json::to_value(&event).expect("serialize pause event");
        assert_eq!(json["silenceMs"], 2_500);
        assert_eq!(json["inCooldown"], false);
        assert_eq!(json["cooldownRemainingMs"], 0);
    }

    #[test]
    fn playback_event_is_internally_tagged() {
        let json = serde_json::to_value(PlaybackEvent::ChunkSkipped {
            seq: 4,
            reason: "bad header".into(),
        })
        .expect("serialize playback event");
        assert_eq!(json["kind"], "chunkSkipped");
        assert_eq!(json["seq"], 4);

        let ended: PlaybackEvent =
            serde_json::from_str(r#"{"kind":"ended","chunksPlayed":3}"#).expect("deserialize");
        assert_eq!(ended, PlaybackEvent::Ended { chunks_played: 3 });
    }

    #[test]
    fn connection_status_serializes_lowercase() {
        let event = ConnectionEvent {
            status: ConnectionStatus::Connecting,
            attempt: 2,
            next_retry_ms: None,
            detail: None,
            terminal: false,
        };
        let json = serde_json::to_value(&event).expect("serialize connection event");
        assert_eq!(json["status"], "connecting");
        assert_eq!(json["nextRetryMs"], serde_json::Value::Null);
    }
}
