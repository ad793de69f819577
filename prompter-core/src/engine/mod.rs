//! `PrompterEngine`: top-level wiring of the turn-taking client.
//!
//! ## Lifecycle
//!
//! ```text
//! PrompterEngine::new()
//!     ├─► connect()          → transport dials, reconnects with backoff
//!     └─► start()            → transcription on, status = Listening
//!             pause          → snapshot sent, status = Thinking
//!             response audio → playback scheduled, status = Speaking
//!             playback ended → cooldown armed, status = Listening
//!         └─► stop()         → transcription off, status = Idle
//! ```
//!
//! ## Threading
//!
//! One tokio task owns the [`Orchestrator`] and the [`PauseDetector`]. It
//! selects over user commands, transcription status, transport events,
//! playback events and the pause tick, so every state transition happens on
//! that task one input at a time. The public methods only enqueue commands or
//! read shared snapshots, and never block.

pub mod state;

pub use state::{Effect, Orchestrator, OrchestratorInput};

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::buffering::{ConversationTurn, PcmBuffer, TurnBuffer};
use crate::error::{PrompterError, Result};
use crate::ipc::events::{
    AppStateEvent, AppStatus, ConnectionEvent, ConnectionStatus, PauseProgressEvent, PlaybackEvent,
    SuggestionEvent, TranscriptEvent, TranscriptionStatusEvent,
};
use crate::pause::{PauseConfig, PauseDetector};
use crate::playback::{AudioOutput, PlaySource, PlaybackConfig, PlaybackScheduler};
use crate::transcription::{SpeechRecognizer, TranscriptionConfig, TranscriptionService};
use crate::transport::{ConversationSnapshot, SessionTransport, TransportConfig, TransportEvent};
use crate::vad::{InterruptionDetector, InterruptionPolicy, SpeechVerdict};

/// Broadcast channel capacity for engine-level events.
const BROADCAST_CAP: usize = 256;

/// Configuration for `PrompterEngine`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub transcription: TranscriptionConfig,
    pub pause: PauseConfig,
    pub transport: TransportConfig,
    pub playback: PlaybackConfig,
    pub interruption: InterruptionPolicy,
}

impl EngineConfig {
    pub fn normalize(&mut self) {
        self.transcription.normalize();
        self.pause.normalize();
        self.transport.normalize();
        self.playback.normalize();
        self.interruption.normalize();
    }
}

enum EngineCommand {
    Input(OrchestratorInput),
    Shutdown,
}

/// The top-level engine handle.
///
/// `PrompterEngine` is `Send + Sync`; wrap it in an `Arc` to share it between
/// a UI bridge and event-forwarding tasks.
pub struct PrompterEngine {
    config: EngineConfig,
    transcription: Arc<TranscriptionService>,
    transport: Arc<SessionTransport>,
    playback: Arc<PlaybackScheduler>,
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    status: Arc<Mutex<AppStatus>>,
    progress: Arc<Mutex<PauseProgressEvent>>,
    state_tx: broadcast::Sender<AppStateEvent>,
    pause_tx: broadcast::Sender<PauseProgressEvent>,
    connection_tx: broadcast::Sender<ConnectionEvent>,
    suggestion_tx: broadcast::Sender<SuggestionEvent>,
    /// `Some` only under the auto-stop interruption policy.
    interruption: Mutex<Option<InterruptionDetector>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PrompterEngine {
    /// Build every component and spawn the orchestrator task.
    ///
    /// Must be called from within a tokio runtime. `output` is the
    /// process-wide audio output; it is shared, never reopened.
    pub fn new(
        mut config: EngineConfig,
        recognizer: Arc<dyn SpeechRecognizer>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        config.normalize();

        let turns = Arc::new(Mutex::new(TurnBuffer::new(config.transcription.turn_window())));
        let transcription = Arc::new(TranscriptionService::spawn(
            config.transcription.clone(),
            recognizer,
            turns,
        ));
        let transport = Arc::new(SessionTransport::new(config.transport.clone()));
        let playback = Arc::new(PlaybackScheduler::new(output, &config.playback));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (pause_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (connection_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (suggestion_tx, _) = broadcast::channel(BROADCAST_CAP);
        let status = Arc::new(Mutex::new(AppStatus::Idle));
        let progress = Arc::new(Mutex::new(PauseProgressEvent::default()));

        let streams = EngineStreams {
            commands: cmd_rx,
            transcription: transcription.subscribe_status(),
            transport: transport.subscribe(),
            playback: playback.subscribe(),
        };
        let task = EngineTask {
            orchestrator: Orchestrator::new(),
            pause: PauseDetector::new(config.pause.clone()),
            listening_since: None,
            transcription: Arc::clone(&transcription),
            transport: Arc::clone(&transport),
            playback: Arc::clone(&playback),
            feedback: cmd_tx.clone(),
            status: Arc::clone(&status),
            progress: Arc::clone(&progress),
            state_tx: state_tx.clone(),
            pause_tx: pause_tx.clone(),
            connection_tx: connection_tx.clone(),
            suggestion_tx: suggestion_tx.clone(),
        };
        let handle = tokio::spawn(run(task, streams));

        let interruption = config
            .interruption
            .auto_stop()
            .map(|cfg| InterruptionDetector::new(cfg.clone()));
        info!(
            auto_interrupt = interruption.is_some(),
            endpoint = %config.transport.url,
            "engine created"
        );

        Self {
            config,
            transcription,
            transport,
            playback,
            cmd_tx,
            status,
            progress,
            state_tx,
            pause_tx,
            connection_tx,
            suggestion_tx,
            interruption: Mutex::new(interruption),
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start listening. Idempotent.
    ///
    /// # Errors
    /// `PrompterError::NotRunning` after `shutdown()`.
    pub fn start(&self) -> Result<()> {
        self.command(EngineCommand::Input(OrchestratorInput::Start))
    }

    /// Stop listening and abandon any response in flight. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.command(EngineCommand::Input(OrchestratorInput::Stop))
    }

    /// Manual stop button: halt playback, clear the cooldown, keep listening.
    pub fn interrupt(&self) -> Result<()> {
        self.command(EngineCommand::Input(OrchestratorInput::ManualStop))
    }

    /// Force a fresh transcription session.
    pub fn refresh_transcription(&self) {
        self.transcription.refresh();
    }

    /// Dial the suggestion service. Resets the reconnect budget.
    pub fn connect(&self) -> Result<()> {
        self.transport.connect()
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Feed captured microphone audio to the interruption detector.
    ///
    /// Frames are only analysed while speaking under the auto-stop policy;
    /// otherwise the detector is kept reset.
    pub fn push_audio_frame(&self, frame: &PcmBuffer) {
        let mut guard = self.interruption.lock();
        let Some(detector) = guard.as_mut() else {
            return;
        };
        if *self.status.lock() != AppStatus::Speaking {
            detector.reset();
            return;
        }
        match detector.push(frame) {
            Some(SpeechVerdict::Interruption) => {
                info!("sustained speech over playback, interrupting");
                let _ = self.cmd_tx.send(EngineCommand::Input(OrchestratorInput::Interruption));
            }
            Some(verdict) => debug!(?verdict, "speech over playback ignored"),
            None => {}
        }
    }

    pub fn set_volume(&self, volume: f32) {
        self.playback.set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.playback.volume()
    }

    /// Current application state (snapshot).
    pub fn status(&self) -> AppStatus {
        *self.status.lock()
    }

    /// Pause progress as of the last detector tick.
    pub fn pause_progress(&self) -> PauseProgressEvent {
        self.progress.lock().clone()
    }

    pub fn transcription(&self) -> &TranscriptionService {
        &self.transcription
    }

    pub fn transport(&self) -> &SessionTransport {
        &self.transport
    }

    pub fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<AppStateEvent> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcription.subscribe_transcripts()
    }

    pub fn subscribe_transcription_status(&self) -> broadcast::Receiver<TranscriptionStatusEvent> {
        self.transcription.subscribe_status()
    }

    pub fn subscribe_pause(&self) -> broadcast::Receiver<PauseProgressEvent> {
        self.pause_tx.subscribe()
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_tx.subscribe()
    }

    pub fn subscribe_playback(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.playback.subscribe()
    }

    pub fn subscribe_suggestions(&self) -> broadcast::Receiver<SuggestionEvent> {
        self.suggestion_tx.subscribe()
    }

    /// Stop everything and end the orchestrator task. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
        self.transcription.stop();
        self.transport.disconnect();
        self.playback.stop();
        if self.task.lock().take().is_some() {
            info!("engine shut down");
        }
    }

    fn command(&self, cmd: EngineCommand) -> Result<()> {
        if self.task.lock().is_none() {
            return Err(PrompterError::NotRunning);
        }
        self.cmd_tx.send(cmd).map_err(|_| PrompterError::NotRunning)
    }
}

impl Drop for PrompterEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct EngineStreams {
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    transcription: broadcast::Receiver<TranscriptionStatusEvent>,
    transport: broadcast::Receiver<TransportEvent>,
    playback: broadcast::Receiver<PlaybackEvent>,
}

struct EngineTask {
    orchestrator: Orchestrator,
    pause: PauseDetector,
    /// Speech older than this belongs to a previous listening session.
    listening_since: Option<Instant>,
    transcription: Arc<TranscriptionService>,
    transport: Arc<SessionTransport>,
    playback: Arc<PlaybackScheduler>,
    /// Completions of spawned work re-enter the task through here.
    feedback: mpsc::UnboundedSender<EngineCommand>,
    status: Arc<Mutex<AppStatus>>,
    progress: Arc<Mutex<PauseProgressEvent>>,
    state_tx: broadcast::Sender<AppStateEvent>,
    pause_tx: broadcast::Sender<PauseProgressEvent>,
    connection_tx: broadcast::Sender<ConnectionEvent>,
    suggestion_tx: broadcast::Sender<SuggestionEvent>,
}

async fn run(mut task: EngineTask, mut streams: EngineStreams) {
    let mut tick = tokio::time::interval(task.pause.config().tick());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = streams.commands.recv() => match cmd {
                Some(EngineCommand::Input(input)) => task.feed(input),
                Some(EngineCommand::Shutdown) | None => break,
            },
            event = streams.transcription.recv() => match event {
                Ok(event) => task.on_transcription_status(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "transcription status lagged"),
                Err(RecvError::Closed) => break,
            },
            event = streams.transport.recv() => match event {
                Ok(event) => task.on_transport_event(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "transport events lagged"),
                Err(RecvError::Closed) => break,
            },
            event = streams.playback.recv() => match event {
                Ok(event) => task.on_playback_event(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "playback events lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tick.tick() => task.on_tick(Instant::now()),
        }
    }
    debug!("engine task exiting");
}

impl EngineTask {
    /// Run one input and every follow-up it causes to completion.
    fn feed(&mut self, input: OrchestratorInput) {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            for effect in self.orchestrator.handle(input) {
                if let Some(follow_up) = self.apply(effect) {
                    pending.push_back(follow_up);
                }
            }
        }
    }

    fn apply(&mut self, effect: Effect) -> Option<OrchestratorInput> {
        let now = Instant::now();
        match effect {
            Effect::StartTranscription => self.transcription.start(),
            Effect::StopTranscription => self.transcription.stop(),
            Effect::SetPauseListening(on) => {
                self.pause.set_listening(on);
                self.listening_since = on.then_some(now);
            }
            Effect::SendSnapshot => {
                let snapshot = self.snapshot(now);
                debug!(turns = snapshot.turns.len(), "sending pause snapshot");
                if let Err(e) = self.transport.send_snapshot(&snapshot) {
                    return Some(OrchestratorInput::SendFailed {
                        detail: e.to_string(),
                    });
                }
            }
            Effect::StopPlayback => self.playback.stop(),
            Effect::FinishPlayback => self.playback.finish_stream(),
            Effect::ResetPause => self.pause.reset_pause(now),
            Effect::MarkSuggestionDelivered => self.pause.mark_suggestion_delivered(now),
            Effect::Publish {
                status,
                detail,
                terminal,
            } => {
                *self.status.lock() = status;
                let _ = self.state_tx.send(AppStateEvent {
                    status,
                    detail,
                    terminal,
                });
            }
        }
        None
    }

    fn snapshot(&self, now: Instant) -> ConversationSnapshot {
        let turns: Vec<ConversationTurn> = self.transcription.turns().lock().turns().cloned().collect();
        ConversationSnapshot {
            turns,
            last_spoken_at: self
                .transcription
                .last_spoken_at()
                .map(|at| wall_clock(at, now)),
            language: self.transcription.detected_language(),
            confidence: None,
        }
    }

    fn on_tick(&mut self, now: Instant) {
        if let (Some(at), Some(since)) = (self.transcription.last_spoken_at(), self.listening_since) {
            if at >= since {
                self.pause.spoke(at);
            }
        }
        if self.pause.tick(now).is_some() {
            let transport_open = self.transport.is_open();
            self.feed(OrchestratorInput::PauseDetected { transport_open });
        }
        if self.pause.is_listening() {
            let progress = self.pause.progress(now);
            *self.progress.lock() = progress.clone();
            let _ = self.pause_tx.send(progress);
        }
    }

    fn on_transcription_status(&mut self, event: TranscriptionStatusEvent) {
        if event.terminal {
            let detail = event
                .detail
                .unwrap_or_else(|| "transcription stopped".into());
            self.feed(OrchestratorInput::TranscriptionFailed { detail });
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connection(conn) => {
                let _ = self.connection_tx.send(conn.clone());
                if conn.status == ConnectionStatus::Closed {
                    self.feed(OrchestratorInput::ConnectionClosed {
                        detail: conn.detail,
                        terminal: conn.terminal,
                    });
                }
            }
            TransportEvent::Suggestion {
                audio_url,
                audio,
                text,
                language,
            } => {
                if !self.orchestrator.accepts_response() {
                    warn!("suggestion arrived without a pending request; ignored");
                    return;
                }
                if let Some(text) = text {
                    info!(%text, "suggestion received");
                    let _ = self.suggestion_tx.send(SuggestionEvent { text, language });
                }
                if let Some(bytes) = audio {
                    self.feed(OrchestratorInput::ResponseArrived);
                    self.playback.queue_chunk(bytes);
                    self.feed(OrchestratorInput::ResponseComplete);
                } else if let Some(url) = audio_url {
                    self.feed(OrchestratorInput::ResponseArrived);
                    self.play_url(url);
                } else {
                    self.feed(OrchestratorInput::ResponseComplete);
                }
            }
            TransportEvent::AudioChunk(bytes) => {
                if !self.orchestrator.accepts_response() {
                    warn!(bytes = bytes.len(), "audio chunk without a pending request; ignored");
                    return;
                }
                self.feed(OrchestratorInput::ResponseArrived);
                self.playback.queue_chunk(bytes);
            }
            TransportEvent::SuggestionEnd => self.feed(OrchestratorInput::ResponseComplete),
            TransportEvent::RemoteError { message } => {
                self.feed(OrchestratorInput::ResponseFailed { detail: message })
            }
        }
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Ended { chunks_played } => {
                debug!(chunks_played, "response playback finished");
                self.feed(OrchestratorInput::PlaybackEnded);
            }
            other => debug!(?other, "playback event"),
        }
    }

    /// Fetch and play a clip without blocking the task. A failed fetch comes
    /// back as `AudioFetchFailed`.
    fn play_url(&self, url: String) {
        let playback = Arc::clone(&self.playback);
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            if let Err(e) = playback.play(PlaySource::Url(url)).await {
                warn!(error = %e, "suggestion audio fetch failed");
                let _ = feedback.send(EngineCommand::Input(OrchestratorInput::AudioFetchFailed {
                    detail: e.to_string(),
                }));
            }
        });
    }
}

/// Wall-clock time of a monotonic instant in the past.
fn wall_clock(at: Instant, now: Instant) -> DateTime<Utc> {
    let ago = chrono::Duration::from_std(now.saturating_duration_since(at))
        .unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() - ago
}
