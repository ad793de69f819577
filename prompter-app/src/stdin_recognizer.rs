//! Line-based `SpeechRecognizer` for headless use.
//!
//! The host reads stdin and hands every non-command line to
//! [`StdinRecognizer::say`], which reports it as a finalized utterance on
//! whichever session is currently open. Lines typed while no session is
//! open are dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use prompter_core::{
    RecognitionResult, RecognizerSession, RecognizerSink, Result, SpeechRecognizer,
};
use tracing::debug;

#[derive(Clone, Default)]
pub struct StdinRecognizer {
    current: Arc<Mutex<Option<RecognizerSink>>>,
}

impl StdinRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `line` as a final result. Returns `false` when no session is open.
    pub fn say(&self, line: &str) -> bool {
        let text = line.trim();
        if text.is_empty() {
            return false;
        }
        match self.current.lock().as_ref() {
            Some(sink) => {
                sink.result(RecognitionResult::final_text(text, None));
                true
            }
            None => false,
        }
    }

    /// Report `line` as an interim hypothesis.
    pub fn say_interim(&self, line: &str) -> bool {
        match self.current.lock().as_ref() {
            Some(sink) => {
                sink.result(RecognitionResult::interim(line.trim()));
                true
            }
            None => false,
        }
    }
}

impl SpeechRecognizer for StdinRecognizer {
    fn open_session(&self, sink: RecognizerSink) -> Result<Box<dyn RecognizerSession>> {
        let generation = sink.generation();
        debug!(generation, "stdin session opened");
        sink.started();
        *self.current.lock() = Some(sink);
        Ok(Box::new(StdinSession {
            generation,
            current: Arc::clone(&self.current),
            stopped: false,
        }))
    }
}

struct StdinSession {
    generation: u64,
    current: Arc<Mutex<Option<RecognizerSink>>>,
    stopped: bool,
}

impl RecognizerSession for StdinSession {
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut current = self.current.lock();
        // A newer session may already own the slot.
        if current.as_ref().map(RecognizerSink::generation) == Some(self.generation) {
            if let Some(sink) = current.take() {
                sink.ended();
            }
        }
        debug!(generation = self.generation, "stdin session stopped");
    }
}

impl Drop for StdinSession {
    fn drop(&mut self) {
        self.stop();
    }
}
