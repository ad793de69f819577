use thiserror::Error;

/// All errors produced by prompter-core.
#[derive(Debug, Error)]
pub enum PrompterError {
    #[error("speech recognition permission denied: {0}")]
    PermissionDenied(String),

    #[error("speech recognizer error: {0}")]
    Recognizer(String),

    #[error("speech recognition gave up after {attempts} consecutive {class} faults")]
    RestartBudgetExhausted { class: String, attempts: u32 },

    #[error("session transport is not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("audio output error: {0}")]
    AudioOutput(String),

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("engine is not running")]
    NotRunning,

    #[error("audio fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PrompterError>;
