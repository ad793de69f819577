//! Wire protocol between the client and the suggestion service.
//!
//! Outbound:
//!
//! ```json
//! {"type":"pause_detected","conversation_snapshot":{"lastTurns":[...],"lastSpokenAt":1718000000,"detectedLanguage":"english","confidenceScore":0.8}}
//! ```
//!
//! Inbound text frames are tagged JSON (`voice_suggestion`, `audio_chunk`,
//! `suggestion_end`, `error`); binary frames are raw audio chunk bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use super::snapshot::WireSnapshot;
use crate::error::PrompterError;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    PauseDetected { conversation_snapshot: WireSnapshot },
}

impl OutboundMessage {
    pub fn to_message(&self) -> serde_json::Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    VoiceSuggestion {
        #[serde(default)]
        audio_url: Option<String>,
        /// Base64-encoded complete audio.
        #[serde(default)]
        audio_stream: Option<String>,
        #[serde(default, alias = "text")]
        suggestion_text: Option<String>,
        #[serde(default)]
        language: Option<String>,
    },
    AudioChunk {
        /// Base64-encoded audio fragment.
        audio_chunk: String,
    },
    SuggestionEnd,
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        details: Option<serde_json::Value>,
    },
}

/// One websocket frame after demultiplexing.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ServerMessage),
    Audio(Vec<u8>),
    Closed { code: Option<u16>, reason: String },
    /// Ping/pong and raw frames; the websocket layer answers pings itself.
    Ignored,
    Malformed(String),
}

/// Parse one JSON control message.
pub fn parse_server_message(text: &str) -> crate::Result<ServerMessage> {
    serde_json::from_str(text)
        .map_err(|e| PrompterError::Protocol(format!("{e}: {}", preview(text))))
}

pub fn decode_frame(message: Message) -> InboundFrame {
    match message {
        Message::Text(text) => match parse_server_message(&text) {
            Ok(msg) => InboundFrame::Control(msg),
            Err(e) => InboundFrame::Malformed(e.to_string()),
        },
        Message::Binary(bytes) => InboundFrame::Audio(bytes.to_vec()),
        Message::Close(frame) => match frame {
            Some(frame) => InboundFrame::Closed {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.to_string(),
            },
            None => InboundFrame::Closed {
                code: None,
                reason: String::new(),
            },
        },
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => InboundFrame::Ignored,
    }
}

/// Decode a base64 audio field.
pub fn decode_audio_field(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(encoded.trim())
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    fn text(json: &str) -> InboundFrame {
        decode_frame(Message::Text(json.to_string()))
    }

    #[test]
    fn voice_suggestion_accepts_text_alias_and_language() {
        let frame = text(r#"{"type":"voice_suggestion","text":"Ask about the trip","language":"hindi"}"#);
        assert_eq!(
            frame,
            InboundFrame::Control(ServerMessage::VoiceSuggestion {
                audio_url: None,
                audio_stream: None,
                suggestion_text: Some("Ask about the trip".into()),
                language: Some("hindi".into()),
            })
        );
    }

    #[test]
    fn audio_chunk_and_end_decode() {
        assert_eq!(
            text(r#"{"type":"audio_chunk","audio_chunk":"AAEC"}"#),
            InboundFrame::Control(ServerMessage::AudioChunk {
                audio_chunk: "AAEC".into()
            })
        );
        assert_eq!(
            text(r#"{"type":"suggestion_end"}"#),
            InboundFrame::Control(ServerMessage::SuggestionEnd)
        );
        assert_eq!(decode_audio_field("AAEC").unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn error_details_may_be_any_json() {
        let frame = text(r#"{"type":"error","message":"Server error","details":{"code":5}}"#);
        let InboundFrame::Control(ServerMessage::Error { message, details }) = frame else {
            panic!("expected error message");
        };
        assert_eq!(message.as_deref(), Some("Server error"));
        assert_eq!(details.unwrap()["code"], 5);
    }

    #[test]
    fn garbage_and_unknown_types_are_malformed() {
        assert!(matches!(text("not json"), InboundFrame::Malformed(_)));
        assert!(matches!(text(r#"{"type":"mystery"}"#), InboundFrame::Malformed(_)));

        let err = parse_server_message(r#"{"type":"audio_chunk"}"#).unwrap_err();
        assert!(matches!(err, PrompterError::Protocol(_)));
        assert!(err.to_string().starts_with("protocol error: "));
    }

    #[test]
    fn binary_and_close_frames() {
        assert_eq!(
            decode_frame(Message::Binary(vec![9, 8, 7])),
            InboundFrame::Audio(vec![9, 8, 7])
        );
        let close = decode_frame(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        })));
        assert_eq!(
            close,
            InboundFrame::Closed {
                code: Some(1000),
                reason: "bye".into()
            }
        );
    }

    #[test]
    fn outbound_uses_snake_case_type_tag() {
        let msg = OutboundMessage::PauseDetected {
            conversation_snapshot: WireSnapshot {
                last_turns: Vec::new(),
                last_spoken_at: None,
                detected_language: crate::transcription::Language::English,
                confidence_score: Some(0.7),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "pause_detected");
        assert_eq!(json["conversation_snapshot"]["detectedLanguage"], "english");
        assert!(json["conversation_snapshot"]["lastSpokenAt"].is_null());
    }
}
