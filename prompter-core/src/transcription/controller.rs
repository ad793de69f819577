//! `TranscriptionController`: pure lifecycle state machine.
//!
//! The controller never touches the engine, timers, or channels itself. Each
//! call to [`TranscriptionController::handle`] takes the current instant and
//! one input and returns the side effects the service must perform, in order.
//! That keeps every transition testable without a runtime.
//!
//! ## Restart discipline
//!
//! A restart always emits `CloseSession` for the old generation before the
//! `ScheduleRestart` that will eventually produce `OpenSession` for the new
//! one. The old session is dropped from the controller at close time, so any
//! late event it sends carries a superseded generation and is ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    detect_language, FaultKind, Language, RecognitionErrorClass, RecognitionResult,
    RecognizerEvent, TranscriptionConfig,
};
use crate::error::PrompterError;
use crate::ipc::events::{TranscriptKind, TranscriptionPhase};

/// Inputs driving the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerInput {
    Start,
    Stop,
    Refresh,
    Engine {
        generation: u64,
        event: RecognizerEvent,
    },
    /// The recognizer refused to open the session for `generation`.
    OpenFailed {
        generation: u64,
        reason: String,
    },
    /// The restart delay for `generation` has elapsed.
    RestartDue {
        generation: u64,
    },
    Tick,
}

/// Side effects requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    OpenSession {
        generation: u64,
    },
    CloseSession {
        generation: u64,
    },
    ScheduleRestart {
        generation: u64,
        delay: Duration,
    },
    /// Append a finalized turn to the turn buffer.
    CommitTurn {
        text: String,
        at: Instant,
        confidence: Option<f32>,
    },
    Transcript {
        kind: TranscriptKind,
        text: String,
        confidence: Option<f32>,
    },
    Status {
        phase: TranscriptionPhase,
        generation: u64,
        detail: Option<String>,
        terminal: bool,
    },
}

/// Error state exposed to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionError {
    pub message: String,
    pub terminal: bool,
}

/// Why a restart was requested. Only faults count toward the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartReason {
    Fault(RecognitionErrorClass),
    EngineEnded,
    Preventive,
    Stalled,
    Manual,
}

impl RestartReason {
    fn label(self) -> String {
        match self {
            RestartReason::Fault(class) => format!("fault ({class})"),
            RestartReason::EngineEnded => "session ended".into(),
            RestartReason::Preventive => "preventive cycle".into(),
            RestartReason::Stalled => "stall watchdog".into(),
            RestartReason::Manual => "manual refresh".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Starting,
    Active,
}

/// The one live engine session. Replaced, never mutated into a new session.
#[derive(Debug, Clone)]
struct RecognitionSession {
    generation: u64,
    state: SessionState,
    opened_at: Instant,
    last_result_at: Option<Instant>,
}

pub struct TranscriptionController {
    config: TranscriptionConfig,
    phase: TranscriptionPhase,
    session: Option<RecognitionSession>,
    /// Generation awaiting `RestartDue`.
    pending_restart: Option<u64>,
    last_generation: u64,
    /// Consecutive faults per class; cleared by any result.
    fault_counts: HashMap<RecognitionErrorClass, u32>,
    /// Class of the fault behind the current restart cycle. Cleared once the
    /// replacement session starts or produces a result.
    last_fault: Option<RecognitionErrorClass>,
    error: Option<TranscriptionError>,
    last_spoken_at: Option<Instant>,
    /// Last interim or final result from any session.
    last_activity_at: Option<Instant>,
    interim_text: String,
    language: Language,
}

impl TranscriptionController {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self {
            config,
            phase: TranscriptionPhase::Idle,
            session: None,
            pending_restart: None,
            last_generation: 0,
            fault_counts: HashMap::new(),
            last_fault: None,
            error: None,
            last_spoken_at: None,
            last_activity_at: None,
            interim_text: String::new(),
            language: Language::English,
        }
    }

    pub fn phase(&self) -> TranscriptionPhase {
        self.phase
    }

    pub fn config(&self) -> &TranscriptionConfig {
        &self.config
    }

    /// Generation of the live session, if any.
    pub fn current_generation(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.generation)
    }

    pub fn last_spoken_at(&self) -> Option<Instant> {
        self.last_spoken_at
    }

    pub fn interim_text(&self) -> &str {
        &self.interim_text
    }

    pub fn detected_language(&self) -> Language {
        self.language
    }

    pub fn error(&self) -> Option<&TranscriptionError> {
        self.error.as_ref()
    }

    pub fn fault_count(&self, class: RecognitionErrorClass) -> u32 {
        self.fault_counts.get(&class).copied().unwrap_or(0)
    }

    /// Whether the controller wants a session to exist.
    pub fn is_running(&self) -> bool {
        matches!(
            self.phase,
            TranscriptionPhase::Starting | TranscriptionPhase::Active | TranscriptionPhase::Restarting
        )
    }

    pub fn handle(&mut self, now: Instant, input: ControllerInput) -> Vec<ControllerAction> {
        match input {
            ControllerInput::Start => self.on_start(now),
            ControllerInput::Stop => self.on_stop(),
            ControllerInput::Refresh => {
                if !self.is_running() || self.phase == TranscriptionPhase::Restarting {
                    debug!(phase = ?self.phase, "refresh ignored");
                    return Vec::new();
                }
                self.restart(RestartReason::Manual)
            }
            ControllerInput::Engine { generation, event } => {
                if self.current_generation() != Some(generation) {
                    debug!(
                        generation,
                        current = ?self.current_generation(),
                        ?event,
                        "ignoring event from superseded session"
                    );
                    return Vec::new();
                }
                self.on_engine_event(now, event)
            }
            ControllerInput::OpenFailed { generation, reason } => {
                if self.current_generation() != Some(generation) {
                    return Vec::new();
                }
                warn!(generation, %reason, "recognizer refused to open session");
                self.on_fault(RecognitionErrorClass::Unknown)
            }
            ControllerInput::RestartDue { generation } => {
                if self.pending_restart != Some(generation)
                    || self.phase != TranscriptionPhase::Restarting
                {
                    debug!(generation, "stale restart timer ignored");
                    return Vec::new();
                }
                self.pending_restart = None;
                self.open(now, generation)
            }
            ControllerInput::Tick => self.on_tick(now),
        }
    }

    // ── Inputs ───────────────────────────────────────────────────────────

    fn on_start(&mut self, now: Instant) -> Vec<ControllerAction> {
        if self.is_running() {
            debug!(phase = ?self.phase, "start ignored, already running");
            return Vec::new();
        }
        self.fault_counts.clear();
        self.last_fault = None;
        self.error = None;
        self.interim_text.clear();
        self.language = Language::English;
        self.pending_restart = None;

        let generation = self.next_generation();
        info!(generation, "transcription starting");
        self.open(now, generation)
    }

    fn on_stop(&mut self) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        self.pending_restart = None;
        self.interim_text.clear();
        if let Some(session) = self.session.take() {
            actions.push(ControllerAction::CloseSession {
                generation: session.generation,
            });
        }
        if self.phase != TranscriptionPhase::Stopped {
            info!("transcription stopped");
            self.phase = TranscriptionPhase::Stopped;
            actions.push(self.status(None, false));
        }
        actions
    }

    fn on_engine_event(&mut self, now: Instant, event: RecognizerEvent) -> Vec<ControllerAction> {
        match event {
            RecognizerEvent::Started => {
                let mut actions = Vec::new();
                if let Some(session) = self.session.as_mut() {
                    if session.state == SessionState::Starting {
                        session.state = SessionState::Active;
                        self.phase = TranscriptionPhase::Active;
                        if let Some(class) = self.last_fault.take() {
                            info!(%class, "recognizer recovered after restart");
                            self.error = None;
                        }
                        actions.push(self.status(None, false));
                    }
                }
                actions
            }
            RecognizerEvent::Result(result) => self.on_result(now, result),
            RecognizerEvent::Error(class) => match class.kind() {
                FaultKind::Benign => {
                    debug!(%class, "benign recognizer error");
                    Vec::new()
                }
                FaultKind::Terminal => self.stop_terminal(terminal_message(class)),
                FaultKind::Fault => self.on_fault(class),
            },
            // A replacement that ends before starting repeats the fault it replaced.
            RecognizerEvent::Ended => match self.last_fault {
                Some(class) => {
                    warn!(%class, "restarted session ended before starting");
                    self.on_fault(class)
                }
                None => {
                    info!(
                        generation = ?self.current_generation(),
                        "recognizer session ended on its own, restarting"
                    );
                    self.restart(RestartReason::EngineEnded)
                }
            },
        }
    }

    fn on_result(&mut self, now: Instant, result: RecognitionResult) -> Vec<ControllerAction> {
        let mut actions = Vec::new();

        if let Some(session) = self.session.as_mut() {
            session.last_result_at = Some(now);
            if session.state == SessionState::Starting {
                session.state = SessionState::Active;
                self.phase = TranscriptionPhase::Active;
            }
        }
        self.last_activity_at = Some(now);

        // A working session ends the fault streak and any transient message.
        self.fault_counts.clear();
        self.last_fault = None;
        if self.error.as_ref().is_some_and(|e| !e.terminal) {
            self.error = None;
            actions.push(self.status(None, false));
        }

        let Some(best) = result.best() else {
            return actions;
        };
        let text = best.transcript.trim();

        if result.is_final {
            self.interim_text.clear();
            if text.is_empty() {
                return actions;
            }
            self.last_spoken_at = Some(now);
            self.language = detect_language(text, self.language);
            actions.push(ControllerAction::CommitTurn {
                text: text.to_string(),
                at: now,
                confidence: best.confidence,
            });
            actions.push(ControllerAction::Transcript {
                kind: TranscriptKind::Final,
                text: text.to_string(),
                confidence: best.confidence,
            });
        } else {
            self.interim_text = text.to_string();
            actions.push(ControllerAction::Transcript {
                kind: TranscriptKind::Interim,
                text: text.to_string(),
                confidence: best.confidence,
            });
        }
        actions
    }

    fn on_fault(&mut self, class: RecognitionErrorClass) -> Vec<ControllerAction> {
        let count = {
            let entry = self.fault_counts.entry(class).or_insert(0);
            *entry += 1;
            *entry
        };
        let budget = self.config.retry_budget(class);
        if count > budget {
            warn!(%class, count, budget, "restart budget exhausted");
            let exhausted = PrompterError::RestartBudgetExhausted {
                class: class.to_string(),
                attempts: count,
            };
            return self.stop_terminal(exhausted.to_string());
        }

        warn!(%class, count, budget, "recognizer fault, restarting session");
        self.last_fault = Some(class);
        self.error = Some(TranscriptionError {
            message: format!("Speech recognition interrupted ({class}), restarting."),
            terminal: false,
        });
        self.restart(RestartReason::Fault(class))
    }

    fn on_tick(&mut self, now: Instant) -> Vec<ControllerAction> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };

        if now.saturating_duration_since(session.opened_at) >= self.config.preventive_restart() {
            return self.restart(RestartReason::Preventive);
        }

        let quiet_since = session.last_result_at.unwrap_or(session.opened_at);
        let stalled = now.saturating_duration_since(quiet_since) >= self.config.stall_window();
        let recently_speaking = self.last_activity_at.is_some_and(|t| {
            now.saturating_duration_since(t) <= self.config.recent_speech_window()
        });
        if stalled && recently_speaking {
            warn!(
                generation = session.generation,
                quiet_ms = now.saturating_duration_since(quiet_since).as_millis() as u64,
                "no results while user recently spoke, forcing restart"
            );
            return self.restart(RestartReason::Stalled);
        }
        Vec::new()
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    fn open(&mut self, now: Instant, generation: u64) -> Vec<ControllerAction> {
        self.session = Some(RecognitionSession {
            generation,
            state: SessionState::Starting,
            opened_at: now,
            last_result_at: None,
        });
        self.phase = TranscriptionPhase::Starting;
        let detail = self.error.as_ref().map(|e| e.message.clone());
        vec![
            ControllerAction::OpenSession { generation },
            self.status(detail, false),
        ]
    }

    fn restart(&mut self, reason: RestartReason) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        if let Some(session) = self.session.take() {
            actions.push(ControllerAction::CloseSession {
                generation: session.generation,
            });
        }
        self.interim_text.clear();

        let generation = self.next_generation();
        self.pending_restart = Some(generation);
        self.phase = TranscriptionPhase::Restarting;

        info!(generation, reason = %reason.label(), "scheduling recognizer restart");
        actions.push(ControllerAction::ScheduleRestart {
            generation,
            delay: self.config.restart_delay(),
        });
        let detail = match reason {
            RestartReason::Fault(_) => self.error.as_ref().map(|e| e.message.clone()),
            _ => None,
        };
        actions.push(self.status(detail, false));
        actions
    }

    fn stop_terminal(&mut self, message: String) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        if let Some(session) = self.session.take() {
            actions.push(ControllerAction::CloseSession {
                generation: session.generation,
            });
        }
        self.pending_restart = None;
        self.interim_text.clear();
        self.phase = TranscriptionPhase::Stopped;
        self.error = Some(TranscriptionError {
            message: message.clone(),
            terminal: true,
        });
        actions.push(self.status(Some(message), true));
        actions
    }

    fn status(&self, detail: Option<String>, terminal: bool) -> ControllerAction {
        ControllerAction::Status {
            phase: self.phase,
            generation: self
                .current_generation()
                .or(self.pending_restart)
                .unwrap_or(self.last_generation),
            detail,
            terminal,
        }
    }
}

fn terminal_message(class: RecognitionErrorClass) -> String {
    let error = if class.is_permission() {
        PrompterError::PermissionDenied(class.to_string())
    } else {
        PrompterError::Recognizer(format!("{class}, cannot continue"))
    };
    error.to_string()
}
