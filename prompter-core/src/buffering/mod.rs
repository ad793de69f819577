//! Owned data buffers shared between components.
//!
//! - [`chunk::PcmBuffer`]: decoded mono PCM for the VAD and the output mixer.
//! - [`turns::TurnBuffer`]: rolling log of finalized speech turns, written by
//!   the transcription service and read when a pause snapshot is built.

pub mod chunk;
pub mod turns;

use std::sync::Arc;

use parking_lot::Mutex;

pub use chunk::PcmBuffer;
pub use turns::{ConversationTurn, TurnBuffer};

/// Shared handle to the turn log. Lock scopes are kept to single operations so
/// any callback entry point can read or append safely.
pub type SharedTurns = Arc<Mutex<TurnBuffer>>;
