//! # prompter-core
//!
//! Real-time turn-taking voice client SDK.
//!
//! ## Architecture
//!
//! ```text
//! SpeechRecognizer → TranscriptionService → TurnBuffer + last_spoken_at
//!                                                    │
//!                                          PauseDetector (tick)
//!                                                    │
//!                                       Orchestrator ─► SessionTransport ⇄ server
//!                                                    │
//!                                 PlaybackScheduler → AudioOutput (cpal / simulated)
//! ```
//!
//! Each stateful component is a pure state machine driven by one tokio task.
//! Stale callbacks are neutralised with generation tags rather than locks.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod pause;
pub mod playback;
pub mod transcription;
pub mod transport;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::CpalOutput;
pub use engine::{EngineConfig, PrompterEngine};
pub use error::{PrompterError, Result};
pub use ipc::events::{
    AppStateEvent, AppStatus, ConnectionEvent, ConnectionStatus, PauseProgressEvent, PlaybackEvent,
    SuggestionEvent, TranscriptEvent, TranscriptKind, TranscriptionStatusEvent,
};
pub use playback::{AudioOutput, PlaySource, PlaybackScheduler, SimulatedOutput};
pub use transcription::{
    RecognitionErrorClass, RecognitionResult, RecognizerSession, RecognizerSink,
    ScriptedRecognizer, SpeechRecognizer,
};
pub use vad::InterruptionPolicy;
