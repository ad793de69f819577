//! `TranscriptionService`: async driver around [`TranscriptionController`].
//!
//! ## Threading
//!
//! One tokio task owns the controller and the single live
//! `RecognizerSession`. Commands, engine callbacks, the watchdog tick, and the
//! restart timer are all funnelled into that task through `select!`, so the
//! controller only ever sees one input at a time no matter which callback
//! fired. Readers get a copy of the exposed state through a
//! `parking_lot::Mutex` that the task refreshes after every input.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn};

use super::controller::{ControllerAction, ControllerInput, TranscriptionController, TranscriptionError};
use super::{
    Language, RecognizerSession, RecognizerSink, SpeechRecognizer, TaggedEvent,
    TranscriptionConfig,
};
use crate::buffering::{ConversationTurn, SharedTurns};
use crate::ipc::events::{TranscriptEvent, TranscriptionPhase, TranscriptionStatusEvent};

/// Broadcast channel capacity for transcript and status events.
const BROADCAST_CAP: usize = 256;

/// Read-only copy of the controller state.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionView {
    pub phase: TranscriptionPhase,
    pub generation: Option<u64>,
    pub last_spoken_at: Option<Instant>,
    pub interim_text: String,
    pub language: Language,
    pub error: Option<TranscriptionError>,
}

/// Handle to the transcription task. Dropping it stops the task and tears
/// down any live session.
pub struct TranscriptionService {
    cmd_tx: mpsc::UnboundedSender<ControllerInput>,
    view: Arc<Mutex<TranscriptionView>>,
    turns: SharedTurns,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    status_tx: broadcast::Sender<TranscriptionStatusEvent>,
    task: JoinHandle<()>,
}

impl TranscriptionService {
    /// Spawn the service task on the current tokio runtime.
    pub fn spawn(
        config: TranscriptionConfig,
        recognizer: Arc<dyn SpeechRecognizer>,
        turns: SharedTurns,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let view = Arc::new(Mutex::new(TranscriptionView::default()));

        let ctx = ServiceContext {
            controller: TranscriptionController::new(config),
            recognizer,
            session: None,
            restart_at: None,
            event_tx,
            turns: Arc::clone(&turns),
            view: Arc::clone(&view),
            transcript_tx: transcript_tx.clone(),
            status_tx: status_tx.clone(),
            seq: 0,
        };
        let task = tokio::spawn(run(ctx, cmd_rx, event_rx));

        Self {
            cmd_tx,
            view,
            turns,
            transcript_tx,
            status_tx,
            task,
        }
    }

    /// Begin continuous transcription. Each run starts with an empty turn log.
    pub fn start(&self) {
        self.turns.lock().clear();
        self.send(ControllerInput::Start);
    }

    /// End transcription and suppress auto-restart. Idempotent.
    pub fn stop(&self) {
        self.send(ControllerInput::Stop);
    }

    /// Force a hard restart of the live session.
    pub fn refresh(&self) {
        self.send(ControllerInput::Refresh);
    }

    pub fn view(&self) -> TranscriptionView {
        self.view.lock().clone()
    }

    pub fn phase(&self) -> TranscriptionPhase {
        self.view.lock().phase
    }

    pub fn last_spoken_at(&self) -> Option<Instant> {
        self.view.lock().last_spoken_at
    }

    pub fn interim_text(&self) -> String {
        self.view.lock().interim_text.clone()
    }

    pub fn detected_language(&self) -> Language {
        self.view.lock().language
    }

    pub fn error(&self) -> Option<TranscriptionError> {
        self.view.lock().error.clone()
    }

    /// The turn buffer finalized results are appended to.
    pub fn turns(&self) -> &SharedTurns {
        &self.turns
    }

    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcript_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<TranscriptionStatusEvent> {
        self.status_tx.subscribe()
    }

    fn send(&self, input: ControllerInput) {
        if self.cmd_tx.send(input).is_err() {
            warn!("transcription task is gone, command dropped");
        }
    }
}

impl Drop for TranscriptionService {
    fn drop(&mut self) {
        // The task also exits once the command channel closes.
        let _ = self.cmd_tx.send(ControllerInput::Stop);
        debug!(finished = self.task.is_finished(), "transcription service dropped");
    }
}

struct ServiceContext {
    controller: TranscriptionController,
    recognizer: Arc<dyn SpeechRecognizer>,
    /// The one live session, tagged with its generation.
    session: Option<(u64, Box<dyn RecognizerSession>)>,
    restart_at: Option<(Instant, u64)>,
    event_tx: mpsc::UnboundedSender<TaggedEvent>,
    turns: SharedTurns,
    view: Arc<Mutex<TranscriptionView>>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    status_tx: broadcast::Sender<TranscriptionStatusEvent>,
    seq: u64,
}

async fn run(
    mut ctx: ServiceContext,
    mut cmd_rx: mpsc::UnboundedReceiver<ControllerInput>,
    mut event_rx: mpsc::UnboundedReceiver<TaggedEvent>,
) {
    info!("transcription service started");
    let mut tick = tokio::time::interval(ctx.controller.config().tick());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let restart_deadline = ctx.restart_at.map(|(at, _)| at);
        let input = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
            Some((generation, event)) = event_rx.recv() => {
                ControllerInput::Engine { generation, event }
            }
            _ = tick.tick() => {
                let evicted = ctx.turns.lock().evict_expired(Instant::now());
                if evicted > 0 {
                    debug!(evicted, "swept expired turns");
                }
                ControllerInput::Tick
            }
            _ = sleep_until_opt(restart_deadline) => {
                let Some((_, generation)) = ctx.restart_at.take() else {
                    continue;
                };
                ControllerInput::RestartDue { generation }
            }
        };
        ctx.step(input);
    }

    if let Some((generation, mut session)) = ctx.session.take() {
        session.stop();
        debug!(generation, "session torn down on service exit");
    }
    info!("transcription service stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ServiceContext {
    /// Feed one input through the controller and apply every resulting action,
    /// including follow-up inputs an action produces (a failed open).
    fn step(&mut self, input: ControllerInput) {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            let now = Instant::now();
            for action in self.controller.handle(now, input) {
                if let Some(follow_up) = self.apply(now, action) {
                    inputs.push_back(follow_up);
                }
            }
        }
        self.refresh_view();
    }

    fn apply(&mut self, now: Instant, action: ControllerAction) -> Option<ControllerInput> {
        match action {
            ControllerAction::OpenSession { generation } => {
                if let Some((old, mut session)) = self.session.take() {
                    warn!(old, generation, "live session found at open, tearing it down first");
                    session.stop();
                }
                let span = info_span!("recognizer_session", generation);
                let _entered = span.enter();
                let sink = RecognizerSink::new(generation, self.event_tx.clone());
                match self.recognizer.open_session(sink) {
                    Ok(session) => {
                        info!(generation, "recognizer session opened");
                        self.session = Some((generation, session));
                        None
                    }
                    Err(e) => Some(ControllerInput::OpenFailed {
                        generation,
                        reason: e.to_string(),
                    }),
                }
            }
            ControllerAction::CloseSession { generation } => {
                match self.session.take() {
                    Some((live, mut session)) if live == generation => {
                        let _entered = info_span!("recognizer_session", generation).entered();
                        session.stop();
                        debug!(generation, "recognizer session closed");
                    }
                    other => {
                        // Keep whatever is live; the close targets a session that is already gone.
                        self.session = other;
                    }
                }
                None
            }
            ControllerAction::ScheduleRestart { generation, delay } => {
                self.restart_at = Some((now + delay, generation));
                None
            }
            ControllerAction::CommitTurn {
                text,
                at,
                confidence,
            } => {
                let turn = ConversationTurn::new(text, at, Utc::now()).with_confidence(confidence);
                self.turns.lock().push(turn);
                None
            }
            ControllerAction::Transcript {
                kind,
                text,
                confidence,
            } => {
                let seq = self.seq;
                self.seq = self.seq.wrapping_add(1);
                let _ = self.transcript_tx.send(TranscriptEvent {
                    seq,
                    kind,
                    text,
                    confidence,
                });
                None
            }
            ControllerAction::Status {
                phase,
                generation,
                detail,
                terminal,
            } => {
                let _ = self.status_tx.send(TranscriptionStatusEvent {
                    phase,
                    generation,
                    detail,
                    terminal,
                });
                None
            }
        }
    }

    fn refresh_view(&self) {
        let mut view = self.view.lock();
        view.phase = self.controller.phase();
        view.generation = self.controller.current_generation();
        view.last_spoken_at = self.controller.last_spoken_at();
        view.interim_text.clear();
        view.interim_text.push_str(self.controller.interim_text());
        view.language = self.controller.detected_language();
        view.error = self.controller.error().cloned();
    }
}
