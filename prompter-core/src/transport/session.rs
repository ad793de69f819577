//! `SessionTransport`: reconnecting websocket client.
//!
//! ## Threading
//!
//! `connect()` spawns one connection task per manual connect. The task dials,
//! pumps frames while open, and on an involuntary close sleeps for the
//! backoff delay before dialling again. Every task carries the generation it
//! was spawned for; `connect()` and `disconnect()` bump the generation, and a
//! task that finds itself superseded exits without touching shared state.
//!
//! A close with code 1000 from the server counts as intentional and is not
//! retried. Anything else (other codes, dropped TCP, failed dial) is.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{decode_audio_field, InboundFrame, OutboundMessage, ServerMessage};
use super::snapshot::{minimize, ConversationSnapshot};
use super::{decode_frame, ConnectionState, ReconnectPolicy, TransportConfig, TransportEvent};
use crate::error::{PrompterError, Result};
use crate::ipc::events::{ConnectionEvent, ConnectionStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAP: usize = 256;
const NORMAL_CLOSE: u16 = 1000;

struct Inner {
    state: ConnectionState,
    policy: ReconnectPolicy,
    generation: u64,
    /// Queue into the live pump; `Some` only while open.
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl Inner {
    fn set_status(
        &mut self,
        events: &broadcast::Sender<TransportEvent>,
        status: ConnectionStatus,
        next_retry: Option<Duration>,
        detail: Option<String>,
        terminal: bool,
    ) {
        self.state.status = status;
        self.state.attempt = self.policy.attempt();
        self.state.next_retry_at = next_retry.map(|d| Instant::now() + d);
        let _ = events.send(TransportEvent::Connection(ConnectionEvent {
            status,
            attempt: self.state.attempt,
            next_retry_ms: next_retry.map(|d| d.as_millis() as u64),
            detail,
            terminal,
        }));
    }

    /// Supersede the current connection task. A live pump is asked to send a
    /// normal close; a task still dialling or backing off is aborted.
    fn retire_task(&mut self, reason: &'static str) {
        self.generation += 1;
        let pump_notified = self
            .outbound
            .take()
            .is_some_and(|tx| tx.send(close_message(reason)).is_ok());
        if let Some(task) = self.task.take() {
            if !pump_notified {
                task.abort();
            }
        }
    }
}

pub struct SessionTransport {
    config: TransportConfig,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<TransportEvent>,
}

impl SessionTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAP);
        let inner = Inner {
            state: ConnectionState::default(),
            policy: config.reconnect_policy(),
            generation: 0,
            outbound: None,
            task: None,
        };
        Self {
            config,
            inner: Arc::new(Mutex::new(inner)),
            events,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open (or re-open) the connection. Resets the retry budget.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns `ConnectionFailed` if the configured URL is unusable. Dial
    /// failures are retried in the background and reported as events.
    pub fn connect(&self) -> Result<()> {
        let endpoint = self.config.endpoint()?;
        let mut inner = self.inner.lock();
        inner.retire_task("reconnecting");
        inner.policy.on_manual_connect();
        inner.set_status(&self.events, ConnectionStatus::Connecting, None, None, false);

        let ctx = ConnectionTask {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
            endpoint,
            generation: inner.generation,
        };
        info!(endpoint = %ctx.endpoint, generation = ctx.generation, "session transport connecting");
        inner.task = Some(tokio::spawn(ctx.run()));
        Ok(())
    }

    /// Close intentionally. No reconnect follows. Idempotent.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.retire_task("client disconnect");
        if !matches!(
            inner.state.status,
            ConnectionStatus::Idle | ConnectionStatus::Closed
        ) || inner.state.next_retry_at.is_some()
        {
            info!("session transport disconnected");
            inner.set_status(
                &self.events,
                ConnectionStatus::Closed,
                None,
                Some("disconnected".into()),
                false,
            );
        }
    }

    /// Send a pause-detected message carrying the minimized snapshot.
    ///
    /// # Errors
    /// `NotConnected` unless the connection is open.
    pub fn send_snapshot(&self, snapshot: &ConversationSnapshot) -> Result<()> {
        let wire = minimize(snapshot);
        let turns = wire.last_turns.len();
        let message = OutboundMessage::PauseDetected {
            conversation_snapshot: wire,
        }
        .to_message()?;

        let inner = self.inner.lock();
        if inner.state.status != ConnectionStatus::Open {
            return Err(PrompterError::NotConnected);
        }
        let tx = inner.outbound.as_ref().ok_or(PrompterError::NotConnected)?;
        tx.send(message).map_err(|_| PrompterError::NotConnected)?;
        debug!(turns, "pause snapshot queued");
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().state.status
    }

    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.inner.lock().retire_task("client shutdown");
    }
}

fn close_message(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    }))
}

/// How a pump ended.
enum PumpExit {
    /// We sent the close.
    Local,
    /// Server closed with 1000.
    RemoteNormal(String),
    /// Anything that should be retried.
    Dropped(String),
}

struct ConnectionTask {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<TransportEvent>,
    endpoint: String,
    generation: u64,
}

impl ConnectionTask {
    async fn run(self) {
        loop {
            let exit = match connect_async(self.endpoint.as_str()).await {
                Ok((ws, _response)) => {
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    {
                        let mut inner = self.inner.lock();
                        if inner.generation != self.generation {
                            return;
                        }
                        inner.policy.on_open();
                        inner.outbound = Some(out_tx);
                        inner.set_status(&self.events, ConnectionStatus::Open, None, None, false);
                    }
                    info!(generation = self.generation, "session transport open");
                    pump(ws, out_rx, &self.events).await
                }
                Err(e) => PumpExit::Dropped(format!("connect failed: {e}")),
            };

            let delay = {
                let mut inner = self.inner.lock();
                if inner.generation != self.generation {
                    return;
                }
                inner.outbound = None;
                match exit {
                    PumpExit::Local => {
                        inner.set_status(&self.events, ConnectionStatus::Closed, None, None, false);
                        return;
                    }
                    PumpExit::RemoteNormal(reason) => {
                        info!(%reason, "server closed the session normally");
                        let detail = (!reason.is_empty()).then_some(reason);
                        inner.set_status(&self.events, ConnectionStatus::Closed, None, detail, false);
                        return;
                    }
                    PumpExit::Dropped(detail) => match inner.policy.on_involuntary_close() {
                        Some(delay) => {
                            warn!(
                                %detail,
                                attempt = inner.policy.attempt(),
                                delay_ms = delay.as_millis() as u64,
                                "session transport closed, reconnecting"
                            );
                            inner.set_status(
                                &self.events,
                                ConnectionStatus::Closed,
                                Some(delay),
                                Some(detail),
                                false,
                            );
                            delay
                        }
                        None => {
                            let attempts = inner.policy.attempt();
                            warn!(%detail, attempts, "session transport giving up");
                            inner.set_status(
                                &self.events,
                                ConnectionStatus::Closed,
                                None,
                                Some(PrompterError::ReconnectExhausted { attempts }.to_string()),
                                true,
                            );
                            return;
                        }
                    },
                }
            };

            tokio::time::sleep(delay).await;

            let mut inner = self.inner.lock();
            if inner.generation != self.generation {
                return;
            }
            inner.set_status(&self.events, ConnectionStatus::Connecting, None, None, false);
        }
    }
}

async fn pump(
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    events: &broadcast::Sender<TransportEvent>,
) -> PumpExit {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(message) = outbound else {
                    let _ = sink.send(close_message("client disconnect")).await;
                    return PumpExit::Local;
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    if closing {
                        return PumpExit::Local;
                    }
                    return PumpExit::Dropped(format!("send failed: {e}"));
                }
                if closing {
                    return PumpExit::Local;
                }
            }
            inbound = stream.next() => match inbound {
                None => return PumpExit::Dropped("stream ended without a close frame".into()),
                Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
                Some(Ok(message)) => match decode_frame(message) {
                    InboundFrame::Closed { code, reason } => {
                        if code == Some(NORMAL_CLOSE) {
                            return PumpExit::RemoteNormal(reason);
                        }
                        return PumpExit::Dropped(format!("closed by server (code {code:?}) {reason}"));
                    }
                    frame => dispatch(frame, events),
                },
            },
        }
    }
}

fn dispatch(frame: InboundFrame, events: &broadcast::Sender<TransportEvent>) {
    let event = match frame {
        InboundFrame::Control(ServerMessage::VoiceSuggestion {
            audio_url,
            audio_stream,
            suggestion_text,
            language,
        }) => {
            let audio = audio_stream.and_then(|encoded| match decode_audio_field(&encoded) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(error = %e, "voice_suggestion audio_stream is not valid base64, ignoring audio");
                    None
                }
            });
            TransportEvent::Suggestion {
                audio_url,
                audio,
                text: suggestion_text.filter(|t| !t.trim().is_empty()),
                language,
            }
        }
        InboundFrame::Control(ServerMessage::AudioChunk { audio_chunk }) => {
            match decode_audio_field(&audio_chunk) {
                Ok(bytes) => TransportEvent::AudioChunk(bytes),
                Err(e) => {
                    warn!(error = %e, "audio_chunk is not valid base64, ignored");
                    return;
                }
            }
        }
        InboundFrame::Control(ServerMessage::SuggestionEnd) => TransportEvent::SuggestionEnd,
        InboundFrame::Control(ServerMessage::Error { message, details }) => {
            let mut message = message.unwrap_or_else(|| "remote error".into());
            if let Some(details) = details {
                let details = match details {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                message = format!("{message}: {details}");
            }
            warn!(%message, "suggestion service reported an error");
            TransportEvent::RemoteError { message }
        }
        InboundFrame::Audio(bytes) => {
            if bytes.is_empty() {
                debug!("empty binary frame ignored");
                return;
            }
            TransportEvent::AudioChunk(bytes)
        }
        InboundFrame::Malformed(reason) => {
            warn!(%reason, "ignoring malformed message");
            return;
        }
        InboundFrame::Ignored | InboundFrame::Closed { .. } => return,
    };
    let _ = events.send(event);
}
