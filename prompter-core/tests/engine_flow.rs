//! End-to-end turn taking: scripted speech in, a local suggestion server,
//! and a simulated output device.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::{accept, bind, recv_json, send_json, wait_for};
use futures_util::SinkExt;
use prompter_core::playback::simulated::wav_fixture;
use prompter_core::buffering::PcmBuffer;
use prompter_core::transcription::ScriptedSessions;
use prompter_core::vad::{InterruptionConfig, InterruptionPolicy};
use prompter_core::{
    AppStatus, ConnectionStatus, EngineConfig, PlaybackEvent, PrompterEngine, ScriptedRecognizer,
    SimulatedOutput,
};
use serde_json::json;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const RATE: u32 = 48_000;

fn engine_config(url: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transport.url = url.to_string();
    config.transport.reconnect_base_ms = 50;
    config.pause.silence_threshold_ms = 500;
    config.pause.tick_ms = 20;
    config
}

fn engine(url: &str) -> (PrompterEngine, ScriptedSessions, Arc<SimulatedOutput>) {
    engine_with(engine_config(url))
}

fn engine_with(config: EngineConfig) -> (PrompterEngine, ScriptedSessions, Arc<SimulatedOutput>) {
    let (recognizer, sessions) = ScriptedRecognizer::new();
    let output = Arc::new(SimulatedOutput::new(RATE));
    let engine = PrompterEngine::new(config, Arc::new(recognizer), output.clone());
    (engine, sessions, output)
}

/// 100 ms of microphone audio at 16 kHz.
fn mic_frame(amplitude: f32) -> PcmBuffer {
    PcmBuffer::new(vec![amplitude; 1_600], 16_000)
}

fn push_frames(engine: &PrompterEngine, amplitude: f32, frames: usize) {
    for _ in 0..frames {
        engine.push_audio_frame(&mic_frame(amplitude));
    }
}

/// The recognizer session opens on the service task shortly after start.
async fn wait_for_session(sessions: &ScriptedSessions) {
    tokio::time::timeout(common::WAIT, async {
        while sessions.live_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("recognizer session never opened");
}

fn is_status(status: AppStatus) -> impl FnMut(&prompter_core::AppStateEvent) -> bool {
    move |e| e.status == status
}

#[tokio::test]
async fn pause_sends_snapshot_and_plays_the_suggestion() {
    let (listener, url) = bind().await;
    let (engine, sessions, output) = engine(&url);
    let mut states = engine.subscribe_state();
    let mut connection = engine.subscribe_connection();
    let mut suggestions = engine.subscribe_suggestions();
    let mut playback = engine.subscribe_playback();
    let mut pause = engine.subscribe_pause();

    engine.connect().expect("connect");
    let mut ws = accept(&listener).await;
    wait_for(&mut connection, |e| e.status == ConnectionStatus::Open).await;

    engine.start().expect("start");
    wait_for(&mut states, is_status(AppStatus::Listening)).await;
    wait_for_session(&sessions).await;
    sessions.say_final("hello  there", Some(0.9));

    let message = recv_json(&mut ws).await;
    assert_eq!(message["type"], "pause_detected");
    let snapshot = &message["conversation_snapshot"];
    assert_eq!(snapshot["lastTurns"][0]["text"], "hello there");
    assert_eq!(snapshot["detectedLanguage"], "english");
    let confidence = snapshot["confidenceScore"].as_f64().expect("confidence");
    assert!((confidence - 0.9).abs() < 1e-3);
    wait_for(&mut states, is_status(AppStatus::Thinking)).await;

    let audio = wav_fixture(4_800, RATE).expect("fixture");
    send_json(
        &mut ws,
        json!({
            "type": "voice_suggestion",
            "audio_stream": BASE64.encode(audio),
            "suggestion_text": "Ask about their weekend",
            "language": "english"
        }),
    )
    .await;

    let suggestion = wait_for(&mut suggestions, |_| true).await;
    assert_eq!(suggestion.text, "Ask about their weekend");
    wait_for(&mut states, is_status(AppStatus::Speaking)).await;
    wait_for(&mut playback, |e| matches!(e, PlaybackEvent::Ended { chunks_played: 1 })).await;
    wait_for(&mut states, is_status(AppStatus::Listening)).await;

    assert_eq!(output.voices().len(), 1);
    let cooling = wait_for(&mut pause, |p| p.in_cooldown).await;
    assert!(cooling.cooldown_remaining_ms > 25_000);
}

#[tokio::test]
async fn streamed_chunks_play_until_suggestion_end() {
    let (listener, url) = bind().await;
    let (engine, sessions, output) = engine(&url);
    let mut states = engine.subscribe_state();
    let mut connection = engine.subscribe_connection();
    let mut playback = engine.subscribe_playback();

    engine.connect().expect("connect");
    let mut ws = accept(&listener).await;
    wait_for(&mut connection, |e| e.status == ConnectionStatus::Open).await;
    engine.start().expect("start");
    wait_for_session(&sessions).await;
    sessions.say_final("so what should I say", None);
    assert_eq!(recv_json(&mut ws).await["type"], "pause_detected");
    wait_for(&mut states, is_status(AppStatus::Thinking)).await;

    let chunk = wav_fixture(2_400, RATE).expect("fixture");
    ws.send(Message::Binary(chunk.clone())).await.expect("send");
    send_json(
        &mut ws,
        json!({"type": "audio_chunk", "audio_chunk": BASE64.encode(&chunk)}),
    )
    .await;
    wait_for(&mut states, is_status(AppStatus::Speaking)).await;
    send_json(&mut ws, json!({"type": "suggestion_end"})).await;

    let ended = wait_for(&mut playback, |e| matches!(e, PlaybackEvent::Ended { .. })).await;
    assert_eq!(ended, PlaybackEvent::Ended { chunks_played: 2 });
    wait_for(&mut states, is_status(AppStatus::Listening)).await;

    let voices = output.voices();
    assert_eq!(voices.len(), 2);
    assert_eq!(voices[1].start_frame, voices[0].end_frame(), "chunks are gapless");
}

#[tokio::test]
async fn remote_error_returns_to_listening() {
    let (listener, url) = bind().await;
    let (engine, sessions, _output) = engine(&url);
    let mut states = engine.subscribe_state();
    let mut connection = engine.subscribe_connection();

    engine.connect().expect("connect");
    let mut ws = accept(&listener).await;
    wait_for(&mut connection, |e| e.status == ConnectionStatus::Open).await;
    engine.start().expect("start");
    wait_for_session(&sessions).await;
    sessions.say_final("anything", None);
    recv_json(&mut ws).await;
    wait_for(&mut states, is_status(AppStatus::Thinking)).await;

    send_json(&mut ws, json!({"type": "error", "message": "model overloaded"})).await;
    let back = wait_for(&mut states, is_status(AppStatus::Listening)).await;
    assert_eq!(back.detail.as_deref(), Some("model overloaded"));
    assert!(!back.terminal);
}

#[tokio::test]
async fn dropped_connection_while_thinking_resumes_and_reconnects() {
    let (listener, url) = bind().await;
    let (engine, sessions, _output) = engine(&url);
    let mut states = engine.subscribe_state();
    let mut connection = engine.subscribe_connection();

    engine.connect().expect("connect");
    let mut ws = accept(&listener).await;
    wait_for(&mut connection, |e| e.status == ConnectionStatus::Open).await;
    engine.start().expect("start");
    wait_for_session(&sessions).await;
    sessions.say_final("are you there", None);
    recv_json(&mut ws).await;
    wait_for(&mut states, is_status(AppStatus::Thinking)).await;

    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "restarting".into(),
    })))
    .await
    .expect("close");

    wait_for(&mut states, is_status(AppStatus::Listening)).await;
    let _again = accept(&listener).await;
    wait_for(&mut connection, |e| e.status == ConnectionStatus::Open).await;
    assert_eq!(engine.status(), AppStatus::Listening);
}

#[tokio::test]
async fn manual_stop_while_speaking_halts_playback() {
    let (listener, url) = bind().await;
    let (engine, sessions, output) = engine(&url);
    let mut states = engine.subscribe_state();
    let mut connection = engine.subscribe_connection();
    let mut playback = engine.subscribe_playback();

    engine.connect().expect("connect");
    let mut ws = accept(&listener).await;
    wait_for(&mut connection, |e| e.status == ConnectionStatus::Open).await;
    engine.start().expect("start");
    wait_for_session(&sessions).await;
    sessions.say_final("tell me something long", None);
    recv_json(&mut ws).await;

    // Ten seconds of audio, far longer than the test waits.
    let audio = wav_fixture(480_000, RATE).expect("fixture");
    send_json(
        &mut ws,
        json!({"type": "voice_suggestion", "audio_stream": BASE64.encode(audio)}),
    )
    .await;
    wait_for(&mut states, is_status(AppStatus::Speaking)).await;
    wait_for(&mut playback, |e| *e == PlaybackEvent::Started).await;

    engine.interrupt().expect("interrupt");
    wait_for(&mut playback, |e| *e == PlaybackEvent::Stopped).await;
    wait_for(&mut states, is_status(AppStatus::Listening)).await;
    assert_eq!(output.playing_count(), 0);
    assert!(
        !engine.pause_progress().in_cooldown,
        "an interrupted suggestion was never delivered"
    );
}

#[tokio::test]
async fn auto_stop_lets_backchannels_pass_and_halts_on_sustained_speech() {
    let (listener, url) = bind().await;
    let mut config = engine_config(&url);
    config.interruption = InterruptionPolicy::AutoStop(InterruptionConfig::default());
    let (engine, sessions, output) = engine_with(config);
    let mut states = engine.subscribe_state();
    let mut connection = engine.subscribe_connection();
    let mut playback = engine.subscribe_playback();

    engine.connect().expect("connect");
    let mut ws = accept(&listener).await;
    wait_for(&mut connection, |e| e.status == ConnectionStatus::Open).await;
    engine.start().expect("start");
    wait_for_session(&sessions).await;
    sessions.say_final("go on then", None);
    recv_json(&mut ws).await;

    let audio = wav_fixture(480_000, RATE).expect("fixture");
    send_json(
        &mut ws,
        json!({"type": "voice_suggestion", "audio_stream": BASE64.encode(audio)}),
    )
    .await;
    wait_for(&mut states, is_status(AppStatus::Speaking)).await;
    wait_for(&mut playback, |e| *e == PlaybackEvent::Started).await;

    // Quiet room, then a 400 ms "mm-hm" followed by silence.
    push_frames(&engine, 0.0, 3);
    push_frames(&engine, 0.3, 4);
    push_frames(&engine, 0.0, 4);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.status(), AppStatus::Speaking, "a backchannel must not stop playback");
    assert_eq!(output.playing_count(), 1);

    // 1.5 s of continuous speech talks over the suggestion.
    push_frames(&engine, 0.3, 15);
    wait_for(&mut playback, |e| *e == PlaybackEvent::Stopped).await;
    wait_for(&mut states, is_status(AppStatus::Listening)).await;
    assert_eq!(output.playing_count(), 0);
    assert!(!engine.pause_progress().in_cooldown);
}

#[tokio::test]
async fn unreachable_suggestion_audio_returns_to_listening_without_cooldown() {
    let (listener, url) = bind().await;
    let (engine, sessions, output) = engine(&url);
    let mut states = engine.subscribe_state();
    let mut connection = engine.subscribe_connection();
    let mut playback = engine.subscribe_playback();

    // A port nobody listens on.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let clip_url = format!("http://{}/clip.wav", dead.local_addr().expect("addr"));
    drop(dead);

    engine.connect().expect("connect");
    let mut ws = accept(&listener).await;
    wait_for(&mut connection, |e| e.status == ConnectionStatus::Open).await;
    engine.start().expect("start");
    wait_for_session(&sessions).await;
    sessions.say_final("what now", None);
    recv_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "voice_suggestion", "audio_url": clip_url, "suggestion_text": "Try this"}),
    )
    .await;
    wait_for(&mut states, is_status(AppStatus::Speaking)).await;
    let back = wait_for(&mut states, is_status(AppStatus::Listening)).await;
    assert!(back
        .detail
        .as_deref()
        .is_some_and(|d| d.contains("audio fetch failed")));
    assert!(!back.terminal);

    assert!(output.voices().is_empty());
    assert!(!engine.pause_progress().in_cooldown);
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = playback.try_recv() {
        assert!(
            !matches!(event, PlaybackEvent::Ended { .. }),
            "nothing played, so nothing ended"
        );
    }
}
