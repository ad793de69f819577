//! Prompter headless host.
//!
//! Wires the core engine to a terminal: typed lines stand in for recognised
//! speech, slash commands drive the engine, and every engine event is logged.

mod settings;
mod stdin_recognizer;

use std::sync::Arc;

use prompter_core::audio::device::list_output_devices;
use prompter_core::playback::AudioOutput;
use prompter_core::{CpalOutput, PrompterEngine, SimulatedOutput, TranscriptKind};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use stdin_recognizer::StdinRecognizer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

/// Rate of the fallback output when no audio device can be opened.
const SIMULATED_OUTPUT_RATE: u32 = 48_000;

const HELP: &str = "commands: /start /stop /interrupt /refresh /connect /disconnect \
/volume <0..1> /status /devices /help /quit; ~text sends an interim result; any other line is a finished utterance";

/// One parsed line of terminal input.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Start,
    Stop,
    Interrupt,
    Refresh,
    Connect,
    Disconnect,
    Volume(f32),
    Status,
    Devices,
    Help,
    Quit,
    Interim(String),
    Utterance(String),
    Invalid(String),
    Empty,
}

fn parse_line(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    if let Some(rest) = line.strip_prefix('~') {
        return Command::Interim(rest.trim().to_string());
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Utterance(line.to_string());
    };
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    match name.as_str() {
        "start" => Command::Start,
        "stop" => Command::Stop,
        "interrupt" => Command::Interrupt,
        "refresh" => Command::Refresh,
        "connect" => Command::Connect,
        "disconnect" => Command::Disconnect,
        "status" => Command::Status,
        "devices" => Command::Devices,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "volume" => match parts.next().map(str::parse::<f32>) {
            Some(Ok(v)) if v.is_finite() => Command::Volume(v),
            _ => Command::Invalid("usage: /volume <0..1>".into()),
        },
        other => Command::Invalid(format!("unknown command /{other}")),
    }
}

/// Open the real output device, or fall back to a silent simulated clock.
fn open_output(settings: &AppSettings) -> Arc<dyn AudioOutput> {
    match CpalOutput::open(&settings.engine.playback) {
        Ok(output) => {
            info!(sample_rate = output.sample_rate(), "audio output opened");
            Arc::new(output)
        }
        Err(e) => {
            warn!("audio output unavailable, responses will not be audible: {e}");
            Arc::new(SimulatedOutput::new(SIMULATED_OUTPUT_RATE))
        }
    }
}

/// Log every event of one broadcast stream until the engine goes away.
fn forward<T, F>(label: &'static str, mut rx: broadcast::Receiver<T>, log: F)
where
    T: Clone + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log(event),
                Err(RecvError::Lagged(n)) => {
                    warn!("{label} receiver lagged by {n} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_event_logging(engine: &PrompterEngine, echo_interim: bool) {
    forward("state", engine.subscribe_state(), |e| {
        if e.terminal {
            error!(status = e.status.label(), detail = ?e.detail, "engine stopped");
        } else {
            info!(status = e.status.label(), detail = ?e.detail, "state");
        }
    });
    forward("transcript", engine.subscribe_transcripts(), move |e| {
        match e.kind {
            TranscriptKind::Final => info!(seq = e.seq, confidence = ?e.confidence, "heard: {}", e.text),
            TranscriptKind::Interim if echo_interim => info!(seq = e.seq, "hearing: {}", e.text),
            TranscriptKind::Interim => debug!(seq = e.seq, "hearing: {}", e.text),
        }
    });
    forward("transcription", engine.subscribe_transcription_status(), |e| {
        if e.terminal {
            error!(phase = ?e.phase, generation = e.generation, detail = ?e.detail, "transcription gave up");
        } else {
            debug!(phase = ?e.phase, generation = e.generation, detail = ?e.detail, "transcription");
        }
    });
    forward("pause", engine.subscribe_pause(), |e| {
        tracing::trace!(
            silence_ms = e.silence_ms,
            progress = e.progress,
            cooldown_remaining_ms = e.cooldown_remaining_ms,
            "pause"
        );
    });
    forward("connection", engine.subscribe_connection(), |e| {
        info!(
            status = ?e.status,
            attempt = e.attempt,
            next_retry_ms = ?e.next_retry_ms,
            detail = ?e.detail,
            terminal = e.terminal,
            "connection"
        );
    });
    forward("playback", engine.subscribe_playback(), |e| {
        info!(event = ?e, "playback");
    });
    forward("suggestion", engine.subscribe_suggestions(), |e| {
        info!(language = ?e.language, "suggestion: {}", e.text);
    });
}

/// Apply one command. Returns `false` when the host should exit.
fn dispatch(engine: &PrompterEngine, recognizer: &StdinRecognizer, command: Command) -> bool {
    let result = match command {
        Command::Empty => Ok(()),
        Command::Quit => return false,
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Start => engine.start(),
        Command::Stop => engine.stop(),
        Command::Interrupt => engine.interrupt(),
        Command::Refresh => {
            engine.refresh_transcription();
            Ok(())
        }
        Command::Connect => engine.connect(),
        Command::Disconnect => {
            engine.disconnect();
            Ok(())
        }
        Command::Volume(v) => {
            engine.set_volume(v);
            info!(volume = engine.volume(), "volume set");
            Ok(())
        }
        Command::Status => {
            let progress = engine.pause_progress();
            println!(
                "status={} connection={:?} volume={:.2} silence_ms={} cooldown_remaining_ms={}",
                engine.status().label(),
                engine.transport().status(),
                engine.volume(),
                progress.silence_ms,
                progress.cooldown_remaining_ms,
            );
            Ok(())
        }
        Command::Devices => {
            for device in list_output_devices() {
                let marker = if device.is_default { "*" } else { " " };
                println!("{marker} {}", device.name);
            }
            Ok(())
        }
        Command::Interim(text) => {
            if !recognizer.say_interim(&text) {
                warn!("not listening; use /start first");
            }
            Ok(())
        }
        Command::Utterance(text) => {
            if !recognizer.say(&text) {
                warn!("not listening; use /start first");
            }
            Ok(())
        }
        Command::Invalid(message) => {
            println!("{message}");
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("command failed: {e}");
    }
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("prompter=info,prompter_core=info")),
        )
        .init();

    let settings_path = std::env::args_os()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    if !settings_path.exists() {
        match save_settings(&settings_path, &settings) {
            Ok(()) => info!(path = %settings_path.display(), "wrote default settings"),
            Err(e) => warn!(path = %settings_path.display(), "could not write default settings: {e}"),
        }
    }
    settings.apply_env_overrides();
    info!(settings = %settings_path.display(), endpoint = %settings.engine.transport.url, "Prompter starting");

    let recognizer = StdinRecognizer::new();
    let output = open_output(&settings);
    let engine = PrompterEngine::new(
        settings.engine.clone(),
        Arc::new(recognizer.clone()),
        Arc::clone(&output),
    );
    spawn_event_logging(&engine, settings.echo_interim);

    if settings.auto_connect {
        engine.connect()?;
    }
    if settings.auto_start {
        engine.start()?;
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !dispatch(&engine, &recognizer, parse_line(&line)) {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    engine.shutdown();
    drop(engine);
    drop(output);
    info!("Prompter stopped");
    Ok(())
}
