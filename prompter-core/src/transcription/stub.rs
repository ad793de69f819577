//! `ScriptedRecognizer`: placeholder engine driven by test code or a host.
//!
//! Sessions report whatever the paired [`ScriptedSessions`] handle tells them
//! to. The handle also records how many sessions were opened and how many are
//! live at once, so callers can check that restarts never overlap sessions.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    RecognitionErrorClass, RecognitionResult, RecognizerSession, RecognizerSink, SpeechRecognizer,
};
use crate::error::{PrompterError, Result};

#[derive(Default)]
struct ScriptedState {
    sinks: Vec<RecognizerSink>,
    live: usize,
    max_live: usize,
    stopped: Vec<u64>,
    failing_opens: u32,
}

/// Control handle for sessions opened by a [`ScriptedRecognizer`].
#[derive(Clone, Default)]
pub struct ScriptedSessions {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedSessions {
    /// Sink of the most recently opened session.
    pub fn latest(&self) -> Option<RecognizerSink> {
        self.state.lock().sinks.last().cloned()
    }

    /// Sink of the session with the given generation.
    pub fn sink(&self, generation: u64) -> Option<RecognizerSink> {
        self.state
            .lock()
            .sinks
            .iter()
            .find(|s| s.generation() == generation)
            .cloned()
    }

    pub fn opened_count(&self) -> usize {
        self.state.lock().sinks.len()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    /// Highest number of simultaneously live sessions ever observed.
    pub fn max_live(&self) -> usize {
        self.state.lock().max_live
    }

    pub fn stopped_generations(&self) -> Vec<u64> {
        self.state.lock().stopped.clone()
    }

    /// Make the next `n` `open_session` calls fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().failing_opens = n;
    }

    pub fn say_interim(&self, text: &str) {
        if let Some(sink) = self.latest() {
            sink.result(RecognitionResult::interim(text));
        }
    }

    pub fn say_final(&self, text: &str, confidence: Option<f32>) {
        if let Some(sink) = self.latest() {
            sink.result(RecognitionResult::final_text(text, confidence));
        }
    }

    pub fn fail(&self, class: RecognitionErrorClass) {
        if let Some(sink) = self.latest() {
            sink.error(class);
            sink.ended();
        }
    }
}

/// Scripted speech engine.
pub struct ScriptedRecognizer {
    sessions: ScriptedSessions,
}

impl ScriptedRecognizer {
    pub fn new() -> (Self, ScriptedSessions) {
        let sessions = ScriptedSessions::default();
        (
            Self {
                sessions: sessions.clone(),
            },
            sessions,
        )
    }
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn open_session(&self, sink: RecognizerSink) -> Result<Box<dyn RecognizerSession>> {
        let generation = sink.generation();
        {
            let mut state = self.sessions.state.lock();
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(PrompterError::Recognizer("scripted open failure".into()));
            }
            state.sinks.push(sink.clone());
            state.live += 1;
            state.max_live = state.max_live.max(state.live);
        }
        debug!(generation, "ScriptedRecognizer::open_session");
        sink.started();
        Ok(Box::new(ScriptedSession {
            generation,
            sessions: self.sessions.clone(),
            stopped: false,
        }))
    }
}

struct ScriptedSession {
    generation: u64,
    sessions: ScriptedSessions,
    stopped: bool,
}

impl RecognizerSession for ScriptedSession {
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut state = self.sessions.state.lock();
        state.live = state.live.saturating_sub(1);
        state.stopped.push(self.generation);
        debug!(generation = self.generation, "ScriptedRecognizer session stopped");
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.stop();
    }
}
