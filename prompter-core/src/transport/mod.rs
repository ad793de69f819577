//! Reconnecting duplex session with the suggestion service.
//!
//! ```text
//! SessionTransport::connect
//!   └─ connection task ── connect_async ──► pump (inbound frames / outbound queue)
//!        ▲                                      │ involuntary close
//!        └──── sleep(min(base·2^n, cap)) ◄──────┘
//! ```
//!
//! Inbound frames are demultiplexed into [`TransportEvent`]s on a broadcast
//! channel; outbound traffic is limited to minimized pause snapshots.

pub mod backoff;
pub mod protocol;
pub mod session;
pub mod snapshot;

pub use backoff::ReconnectPolicy;
pub use protocol::{decode_frame, InboundFrame, OutboundMessage, ServerMessage};
pub use session::SessionTransport;
pub use snapshot::{minimize, ConversationSnapshot, WireSnapshot, WireTurn};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{PrompterError, Result};
use crate::ipc::events::{ConnectionEvent, ConnectionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Websocket endpoint, e.g. `ws://127.0.0.1:8000/ws`.
    pub url: String,
    /// Sent as the `session_id` query parameter when set.
    pub session_id: Option<String>,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws".into(),
            session_id: None,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 8,
        }
    }
}

impl TransportConfig {
    pub fn normalize(&mut self) {
        self.url = self.url.trim().to_string();
        self.session_id = self
            .session_id
            .take()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.reconnect_base_ms = self.reconnect_base_ms.clamp(50, 60_000);
        self.reconnect_cap_ms = self.reconnect_cap_ms.max(self.reconnect_base_ms);
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_cap_ms),
            self.max_reconnect_attempts,
        )
    }

    /// The URL actually dialled, with `session_id` appended.
    pub fn endpoint(&self) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.url)
            .map_err(|e| PrompterError::ConnectionFailed(format!("invalid url {:?}: {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(PrompterError::ConnectionFailed(format!(
                "unsupported scheme {:?}",
                url.scheme()
            )));
        }
        if let Some(id) = &self.session_id {
            url.query_pairs_mut().append_pair("session_id", id);
        }
        Ok(url.to_string())
    }
}

/// Connection bookkeeping owned by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub attempt: u32,
    pub next_retry_at: Option<Instant>,
}

/// Everything the transport reports to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connection(ConnectionEvent),
    /// `voice_suggestion` with any inline audio already base64-decoded.
    Suggestion {
        audio_url: Option<String>,
        audio: Option<Vec<u8>>,
        text: Option<String>,
        language: Option<String>,
    },
    /// Binary frame or decoded `audio_chunk`.
    AudioChunk(Vec<u8>),
    SuggestionEnd,
    RemoteError { message: String },
}
