//! Transcription capability and lifecycle.
//!
//! The `SpeechRecognizer` trait is the seam to whatever engine actually turns
//! speech into text (platform dictation API, cloud streaming STT, a scripted
//! stub). The rest of this module keeps one live session of that engine
//! running despite faults:
//!
//! ```text
//! Idle ─start─► Starting ─first event─► Active ─fault─► Restarting ─delay─► Starting
//!   any ─stop─► Stopped            Active ─preventive / stall─► Restarting
//! ```
//!
//! Sessions are never resumed. Every restart tears the old session down,
//! neutralizes its sink (events carrying a superseded generation are
//! ignored), and opens a fresh one.

pub mod controller;
pub mod language;
pub mod service;
pub mod stub;

pub use controller::{ControllerAction, ControllerInput, TranscriptionController};
pub use language::{detect_language, Language};
pub use service::TranscriptionService;
pub use stub::{ScriptedRecognizer, ScriptedSessions};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// One hypothesis for an utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: Option<f32>,
}

/// An incremental recognition result.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub is_final: bool,
    /// Alternatives ordered best-first. The first is the one committed.
    pub alternatives: Vec<Alternative>,
}

impl RecognitionResult {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            is_final: false,
            alternatives: vec![Alternative {
                transcript: text.into(),
                confidence: None,
            }],
        }
    }

    pub fn final_text(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            is_final: true,
            alternatives: vec![Alternative {
                transcript: text.into(),
                confidence,
            }],
        }
    }

    pub fn best(&self) -> Option<&Alternative> {
        self.alternatives.first()
    }
}

/// Fixed vocabulary of errors a recognizer can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecognitionErrorClass {
    NotAllowed,
    ServiceNotAllowed,
    LanguageNotSupported,
    NoSpeech,
    Aborted,
    AudioCapture,
    Network,
    Unknown,
}

/// How the lifecycle controller treats an error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Not retried; the controller stops and surfaces a terminal error.
    Terminal,
    /// Counts toward the restart budget; the session is replaced.
    Fault,
    /// Ignored for restart accounting.
    Benign,
}

impl RecognitionErrorClass {
    pub fn kind(self) -> FaultKind {
        match self {
            Self::NotAllowed | Self::ServiceNotAllowed | Self::LanguageNotSupported => {
                FaultKind::Terminal
            }
            Self::Network | Self::AudioCapture | Self::Unknown => FaultKind::Fault,
            Self::NoSpeech | Self::Aborted => FaultKind::Benign,
        }
    }

    pub fn is_permission(self) -> bool {
        matches!(self, Self::NotAllowed | Self::ServiceNotAllowed)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NotAllowed => "not-allowed",
            Self::ServiceNotAllowed => "service-not-allowed",
            Self::LanguageNotSupported => "language-not-supported",
            Self::NoSpeech => "no-speech",
            Self::Aborted => "aborted",
            Self::AudioCapture => "audio-capture",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RecognitionErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything a recognizer session can report.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    /// The engine is capturing audio.
    Started,
    Result(RecognitionResult),
    Error(RecognitionErrorClass),
    /// The session ended. Distinct from `Error`; usually follows one.
    Ended,
}

/// Event tagged with the generation of the session that produced it.
pub type TaggedEvent = (u64, RecognizerEvent);

/// Callback handle given to each recognizer session.
///
/// Every event is tagged with the session's generation, so a sink that
/// outlives its session cannot disturb the one that replaced it.
#[derive(Debug, Clone)]
pub struct RecognizerSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl RecognizerSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: RecognizerEvent) {
        // The service may already be gone during shutdown.
        let _ = self.tx.send((self.generation, event));
    }

    pub fn started(&self) {
        self.emit(RecognizerEvent::Started);
    }

    pub fn result(&self, result: RecognitionResult) {
        self.emit(RecognizerEvent::Result(result));
    }

    pub fn error(&self, class: RecognitionErrorClass) {
        self.emit(RecognizerEvent::Error(class));
    }

    pub fn ended(&self) {
        self.emit(RecognizerEvent::Ended);
    }
}

/// Contract for speech recognition engines.
pub trait SpeechRecognizer: Send + Sync + 'static {
    /// Begin a continuous, interim-enabled session reporting into `sink`.
    ///
    /// # Errors
    /// Returns an error if the engine cannot start at all. The controller
    /// treats this like an `Unknown` fault.
    fn open_session(&self, sink: RecognizerSink) -> Result<Box<dyn RecognizerSession>>;
}

/// A live recognizer session.
pub trait RecognizerSession: Send {
    /// Tear the session down. Must not return until the engine has released
    /// the session; the controller opens the next one right after.
    fn stop(&mut self);
}

/// Configuration for the transcription lifecycle controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TranscriptionConfig {
    /// Fixed delay between tearing a faulted session down and opening the next.
    pub restart_delay_ms: u64,
    /// Period of the preventive restart that pre-empts engine session limits.
    pub preventive_restart_ms: u64,
    /// A session with no result for this long may be stalled.
    pub stall_window_ms: u64,
    /// The stall watchdog only fires within `stall_window * multiple` of the
    /// last speech, so genuine silence is left alone.
    pub recent_speech_multiple: u32,
    /// Consecutive `network` faults tolerated before giving up.
    pub max_network_retries: u32,
    /// Consecutive faults of any other class tolerated before giving up.
    pub max_fault_retries: u32,
    /// Watchdog / sweep tick.
    pub tick_ms: u64,
    /// Rolling window of the turn buffer.
    pub turn_window_ms: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 150,
            preventive_restart_ms: 50_000,
            stall_window_ms: 5_000,
            recent_speech_multiple: 3,
            max_network_retries: 3,
            max_fault_retries: 5,
            tick_ms: 250,
            turn_window_ms: 120_000,
        }
    }
}

impl TranscriptionConfig {
    pub fn normalize(&mut self) {
        self.restart_delay_ms = self.restart_delay_ms.clamp(50, 2_000);
        self.preventive_restart_ms = self.preventive_restart_ms.clamp(5_000, 600_000);
        self.stall_window_ms = self.stall_window_ms.clamp(1_000, 60_000);
        self.recent_speech_multiple = self.recent_speech_multiple.clamp(1, 10);
        self.tick_ms = self.tick_ms.clamp(20, 2_000);
        self.turn_window_ms = self.turn_window_ms.max(1_000);
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn preventive_restart(&self) -> Duration {
        Duration::from_millis(self.preventive_restart_ms)
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_millis(self.stall_window_ms)
    }

    pub fn recent_speech_window(&self) -> Duration {
        self.stall_window() * self.recent_speech_multiple
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn turn_window(&self) -> Duration {
        Duration::from_millis(self.turn_window_ms)
    }

    pub fn retry_budget(&self, class: RecognitionErrorClass) -> u32 {
        if class == RecognitionErrorClass::Network {
            self.max_network_retries
        } else {
            self.max_fault_retries
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_map_to_fault_kinds() {
        assert_eq!(RecognitionErrorClass::NotAllowed.kind(), FaultKind::Terminal);
        assert_eq!(RecognitionErrorClass::Network.kind(), FaultKind::Fault);
        assert_eq!(RecognitionErrorClass::Unknown.kind(), FaultKind::Fault);
        assert_eq!(RecognitionErrorClass::NoSpeech.kind(), FaultKind::Benign);
    }

    #[test]
    fn error_class_uses_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&RecognitionErrorClass::NoSpeech).unwrap();
        assert_eq!(json, r#""no-speech""#);
    }

    #[test]
    fn sink_tags_events_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = RecognizerSink::new(7, tx);
        sink.result(RecognitionResult::interim("hel"));
        sink.ended();
        assert_eq!(
            rx.try_recv().unwrap(),
            (7, RecognizerEvent::Result(RecognitionResult::interim("hel")))
        );
        assert_eq!(rx.try_recv().unwrap(), (7, RecognizerEvent::Ended));
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut cfg = TranscriptionConfig {
            restart_delay_ms: 0,
            tick_ms: 1,
            ..TranscriptionConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.restart_delay_ms, 50);
        assert_eq!(cfg.tick_ms, 20);
    }
}
