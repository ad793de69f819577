//! `Orchestrator`: the application state machine.
//!
//! ```text
//!          start                pause (transport open)        audio / text
//!   Idle ─────────► Listening ─────────────────────► Thinking ─────────────► Speaking
//!    ▲    ◄─────────    ▲                               │                        │
//!    │      stop        └──── response failed ──────────┘                        │
//!    └────────────────────────── playback ended (back to Listening or Idle) ◄───┘
//! ```
//!
//! Like the transcription controller, the orchestrator is pure: it never
//! touches a component. [`Orchestrator::handle`] returns the effects the
//! engine task must apply, in order.

use tracing::{debug, info, warn};

use crate::ipc::events::AppStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorInput {
    /// User asked to start listening.
    Start,
    /// User asked to stop listening. Pre-empts any response in flight.
    Stop,
    PauseDetected {
        transport_open: bool,
    },
    /// First audio of a response reached the player.
    ResponseArrived,
    /// The server will send no more audio for this response.
    ResponseComplete,
    PlaybackEnded,
    /// Manual stop button: abandon the response, keep listening.
    ManualStop,
    /// The interruption detector heard sustained speech over playback.
    Interruption,
    ResponseFailed {
        detail: String,
    },
    /// The clip behind a suggestion URL could not be fetched.
    AudioFetchFailed {
        detail: String,
    },
    SendFailed {
        detail: String,
    },
    ConnectionClosed {
        detail: Option<String>,
        terminal: bool,
    },
    TranscriptionFailed {
        detail: String,
    },
}

/// Side effects requested by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartTranscription,
    StopTranscription,
    SetPauseListening(bool),
    SendSnapshot,
    StopPlayback,
    FinishPlayback,
    ResetPause,
    MarkSuggestionDelivered,
    Publish {
        status: AppStatus,
        detail: Option<String>,
        terminal: bool,
    },
}

#[derive(Debug, Default)]
pub struct Orchestrator {
    status: AppStatus,
    /// The user wants transcription on. Decides where a response returns to.
    listening: bool,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> AppStatus {
        self.status
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Whether inbound response audio should be played right now.
    pub fn accepts_response(&self) -> bool {
        matches!(self.status, AppStatus::Thinking | AppStatus::Speaking)
    }

    pub fn handle(&mut self, input: OrchestratorInput) -> Vec<Effect> {
        match input {
            OrchestratorInput::Start => self.on_start(),
            OrchestratorInput::Stop => self.on_stop(),
            OrchestratorInput::PauseDetected { transport_open } => {
                if self.status != AppStatus::Listening {
                    debug!(status = self.status.label(), "pause ignored outside listening");
                    return Vec::new();
                }
                if !transport_open {
                    warn!("pause detected but the transport is not open; no suggestion requested");
                    return Vec::new();
                }
                let mut effects = vec![Effect::SendSnapshot];
                effects.push(self.transition(AppStatus::Thinking, None, false));
                effects
            }
            OrchestratorInput::ResponseArrived => match self.status {
                AppStatus::Thinking => vec![self.transition(AppStatus::Speaking, None, false)],
                AppStatus::Speaking => Vec::new(),
                _ => {
                    debug!(status = self.status.label(), "response audio outside a request");
                    Vec::new()
                }
            },
            OrchestratorInput::ResponseComplete => match self.status {
                // Nothing was played: the response was text only.
                AppStatus::Thinking => self.finish_response(None),
                AppStatus::Speaking => vec![Effect::FinishPlayback],
                _ => Vec::new(),
            },
            OrchestratorInput::PlaybackEnded => {
                if self.status != AppStatus::Speaking {
                    return Vec::new();
                }
                self.finish_response(None)
            }
            OrchestratorInput::ManualStop => self.abandon_response("manual stop", None),
            OrchestratorInput::Interruption => {
                if self.status != AppStatus::Speaking {
                    return Vec::new();
                }
                self.abandon_response("user interrupted", None)
            }
            OrchestratorInput::ResponseFailed { detail } | OrchestratorInput::SendFailed { detail } => {
                self.response_failed(detail)
            }
            // Nothing was heard, so nothing counts as delivered.
            OrchestratorInput::AudioFetchFailed { detail } => {
                warn!(%detail, "suggestion audio unavailable");
                self.abandon_response("audio fetch failed", Some(detail))
            }
            OrchestratorInput::ConnectionClosed { detail, terminal } => match self.status {
                AppStatus::Thinking => {
                    let detail = detail.unwrap_or_else(|| "connection closed".into());
                    warn!(%detail, "connection lost while waiting for a suggestion");
                    vec![self.transition(self.resume(), Some(detail), terminal)]
                }
                // Whatever already arrived still plays out.
                AppStatus::Speaking => {
                    let mut effects = vec![Effect::FinishPlayback];
                    if terminal {
                        effects.push(Effect::Publish {
                            status: AppStatus::Speaking,
                            detail,
                            terminal: true,
                        });
                    }
                    effects
                }
                status if terminal => vec![Effect::Publish {
                    status,
                    detail,
                    terminal: true,
                }],
                _ => Vec::new(),
            },
            OrchestratorInput::TranscriptionFailed { detail } => {
                warn!(%detail, "transcription failed terminally");
                let mut effects = Vec::new();
                if self.accepts_response() {
                    effects.push(Effect::StopPlayback);
                }
                self.listening = false;
                effects.push(Effect::SetPauseListening(false));
                self.status = AppStatus::Idle;
                effects.push(Effect::Publish {
                    status: AppStatus::Idle,
                    detail: Some(detail),
                    terminal: true,
                });
                effects
            }
        }
    }

    fn on_start(&mut self) -> Vec<Effect> {
        if self.listening {
            debug!("start ignored, already listening");
            return Vec::new();
        }
        self.listening = true;
        info!("listening started");
        let mut effects = vec![Effect::StartTranscription, Effect::SetPauseListening(true)];
        if self.status == AppStatus::Idle {
            effects.push(self.transition(AppStatus::Listening, None, false));
        }
        effects
    }

    fn on_stop(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.accepts_response() {
            effects.push(Effect::StopPlayback);
        }
        effects.push(Effect::ResetPause);
        if self.listening {
            self.listening = false;
            info!("listening stopped");
            effects.push(Effect::StopTranscription);
            effects.push(Effect::SetPauseListening(false));
        }
        if self.status != AppStatus::Idle {
            effects.push(self.transition(AppStatus::Idle, None, false));
        }
        effects
    }

    /// Response delivered: start the cooldown and go back.
    fn finish_response(&mut self, detail: Option<String>) -> Vec<Effect> {
        vec![
            Effect::MarkSuggestionDelivered,
            self.transition(self.resume(), detail, false),
        ]
    }

    fn abandon_response(&mut self, why: &'static str, detail: Option<String>) -> Vec<Effect> {
        let mut effects = vec![Effect::ResetPause];
        if self.accepts_response() {
            info!(why, "response abandoned");
            effects.insert(0, Effect::StopPlayback);
            effects.push(self.transition(self.resume(), detail, false));
        }
        effects
    }

    fn response_failed(&mut self, detail: String) -> Vec<Effect> {
        match self.status {
            AppStatus::Thinking => {
                warn!(%detail, "suggestion request failed");
                vec![self.transition(self.resume(), Some(detail), false)]
            }
            AppStatus::Speaking => {
                warn!(%detail, "error during response playback");
                vec![
                    Effect::FinishPlayback,
                    Effect::Publish {
                        status: AppStatus::Speaking,
                        detail: Some(detail),
                        terminal: false,
                    },
                ]
            }
            _ => {
                debug!(%detail, "remote error outside a request");
                Vec::new()
            }
        }
    }

    fn resume(&self) -> AppStatus {
        if self.listening {
            AppStatus::Listening
        } else {
            AppStatus::Idle
        }
    }

    fn transition(&mut self, to: AppStatus, detail: Option<String>, terminal: bool) -> Effect {
        if self.status != to {
            info!(from = self.status.label(), to = to.label(), "app state changed");
        }
        self.status = to;
        Effect::Publish {
            status: to,
            detail,
            terminal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published(effects: &[Effect]) -> Option<AppStatus> {
        effects.iter().rev().find_map(|e| match e {
            Effect::Publish { status, .. } => Some(*status),
            _ => None,
        })
    }

    fn speaking() -> Orchestrator {
        let mut orch = Orchestrator::new();
        orch.handle(OrchestratorInput::Start);
        orch.handle(OrchestratorInput::PauseDetected { transport_open: true });
        orch.handle(OrchestratorInput::ResponseArrived);
        assert_eq!(orch.status(), AppStatus::Speaking);
        orch
    }

    #[test]
    fn full_turn_returns_to_listening_with_cooldown() {
        let mut orch = Orchestrator::new();
        let fx = orch.handle(OrchestratorInput::Start);
        assert_eq!(
            &fx[..2],
            &[Effect::StartTranscription, Effect::SetPauseListening(true)]
        );
        assert_eq!(published(&fx), Some(AppStatus::Listening));

        let fx = orch.handle(OrchestratorInput::PauseDetected { transport_open: true });
        assert_eq!(fx[0], Effect::SendSnapshot);
        assert_eq!(orch.status(), AppStatus::Thinking);

        orch.handle(OrchestratorInput::ResponseArrived);
        assert_eq!(orch.status(), AppStatus::Speaking);

        assert_eq!(
            orch.handle(OrchestratorInput::ResponseComplete),
            vec![Effect::FinishPlayback]
        );
        let fx = orch.handle(OrchestratorInput::PlaybackEnded);
        assert_eq!(fx[0], Effect::MarkSuggestionDelivered);
        assert_eq!(orch.status(), AppStatus::Listening);
    }

    #[test]
    fn pause_needs_an_open_transport_and_listening_state() {
        let mut orch = Orchestrator::new();
        assert!(orch
            .handle(OrchestratorInput::PauseDetected { transport_open: true })
            .is_empty());
        orch.handle(OrchestratorInput::Start);
        assert!(orch
            .handle(OrchestratorInput::PauseDetected { transport_open: false })
            .is_empty());
        assert_eq!(orch.status(), AppStatus::Listening);
    }

    #[test]
    fn second_pause_while_thinking_sends_nothing() {
        let mut orch = Orchestrator::new();
        orch.handle(OrchestratorInput::Start);
        orch.handle(OrchestratorInput::PauseDetected { transport_open: true });
        assert!(orch
            .handle(OrchestratorInput::PauseDetected { transport_open: true })
            .is_empty());
    }

    #[test]
    fn text_only_response_completes_from_thinking() {
        let mut orch = Orchestrator::new();
        orch.handle(OrchestratorInput::Start);
        orch.handle(OrchestratorInput::PauseDetected { transport_open: true });
        let fx = orch.handle(OrchestratorInput::ResponseComplete);
        assert_eq!(fx[0], Effect::MarkSuggestionDelivered);
        assert_eq!(orch.status(), AppStatus::Listening);
    }

    #[test]
    fn manual_stop_clears_cooldown_and_playback() {
        let mut orch = speaking();
        let fx = orch.handle(OrchestratorInput::ManualStop);
        assert_eq!(fx[0], Effect::StopPlayback);
        assert!(fx.contains(&Effect::ResetPause));
        assert_eq!(orch.status(), AppStatus::Listening);
        assert!(!orch.accepts_response());
    }

    #[test]
    fn stop_always_resets_the_pause_detector() {
        let mut orch = Orchestrator::new();
        orch.handle(OrchestratorInput::Start);
        orch.handle(OrchestratorInput::PauseDetected { transport_open: true });
        orch.handle(OrchestratorInput::ResponseComplete);
        assert_eq!(orch.status(), AppStatus::Listening);

        let fx = orch.handle(OrchestratorInput::Stop);
        assert!(fx.contains(&Effect::ResetPause), "cooldown must not outlive a stop");
        assert!(!fx.contains(&Effect::StopPlayback));
        assert_eq!(orch.status(), AppStatus::Idle);

        // Already idle: still nothing left armed.
        assert_eq!(orch.handle(OrchestratorInput::Stop), vec![Effect::ResetPause]);
    }

    #[test]
    fn failed_audio_fetch_abandons_without_cooldown() {
        let mut orch = speaking();
        let fx = orch.handle(OrchestratorInput::AudioFetchFailed {
            detail: "audio fetch failed: 404".into(),
        });
        assert_eq!(
            fx,
            vec![
                Effect::StopPlayback,
                Effect::ResetPause,
                Effect::Publish {
                    status: AppStatus::Listening,
                    detail: Some("audio fetch failed: 404".into()),
                    terminal: false,
                },
            ]
        );
        assert!(!fx.contains(&Effect::MarkSuggestionDelivered));
        assert!(!fx.contains(&Effect::FinishPlayback));

        // A late failure after the user moved on changes nothing visible.
        assert_eq!(
            orch.handle(OrchestratorInput::AudioFetchFailed { detail: "late".into() }),
            vec![Effect::ResetPause]
        );
    }

    #[test]
    fn stop_during_speech_goes_idle() {
        let mut orch = speaking();
        let fx = orch.handle(OrchestratorInput::Stop);
        assert!(fx.contains(&Effect::StopPlayback));
        assert!(fx.contains(&Effect::StopTranscription));
        assert_eq!(orch.status(), AppStatus::Idle);
        assert!(!orch.is_listening());
    }

    #[test]
    fn interruption_only_applies_while_speaking() {
        let mut orch = Orchestrator::new();
        orch.handle(OrchestratorInput::Start);
        assert!(orch.handle(OrchestratorInput::Interruption).is_empty());

        let mut orch = speaking();
        orch.handle(OrchestratorInput::Interruption);
        assert_eq!(orch.status(), AppStatus::Listening);
    }

    #[test]
    fn failures_while_thinking_return_to_listening() {
        let mut orch = Orchestrator::new();
        orch.handle(OrchestratorInput::Start);
        orch.handle(OrchestratorInput::PauseDetected { transport_open: true });
        let fx = orch.handle(OrchestratorInput::ResponseFailed {
            detail: "Server error".into(),
        });
        assert_eq!(
            fx,
            vec![Effect::Publish {
                status: AppStatus::Listening,
                detail: Some("Server error".into()),
                terminal: false,
            }]
        );

        orch.handle(OrchestratorInput::PauseDetected { transport_open: true });
        orch.handle(OrchestratorInput::ConnectionClosed {
            detail: None,
            terminal: false,
        });
        assert_eq!(orch.status(), AppStatus::Listening);
    }

    #[test]
    fn terminal_connection_loss_is_flagged_in_any_state() {
        let mut orch = Orchestrator::new();
        orch.handle(OrchestratorInput::Start);
        let fx = orch.handle(OrchestratorInput::ConnectionClosed {
            detail: Some("reconnect gave up".into()),
            terminal: true,
        });
        assert_eq!(
            fx,
            vec![Effect::Publish {
                status: AppStatus::Listening,
                detail: Some("reconnect gave up".into()),
                terminal: true,
            }]
        );
    }

    #[test]
    fn terminal_transcription_failure_goes_idle() {
        let mut orch = speaking();
        let fx = orch.handle(OrchestratorInput::TranscriptionFailed {
            detail: "microphone permission denied".into(),
        });
        assert_eq!(fx[0], Effect::StopPlayback);
        assert_eq!(orch.status(), AppStatus::Idle);
        assert!(matches!(
            fx.last(),
            Some(Effect::Publish { terminal: true, .. })
        ));
    }
}
