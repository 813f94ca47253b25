//! Replays a scripted conversation through the full session stack
//!
//! Run with `cargo run --example offline_session [config.toml]`. Ctrl-C ends the
//! session early.

use anyhow::Result;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use voxrelay::audio::format::pcm16_from_f32;
use voxrelay::runtime::{CancelSource, ShutdownReport};
use voxrelay::session::{ConversationShell, ConversationUpdate, MockClient, MockSession, SessionConsole};
use voxrelay::{logging, SessionConfig};

fn script(reply_audio: Vec<u8>) -> Vec<ConversationUpdate> {
    let item = "item_agent_1".to_string();
    let mut updates = vec![
        ConversationUpdate::SessionStarted {
            session_id: "sess_offline".into(),
        },
        ConversationUpdate::SessionConfigured,
        ConversationUpdate::InputSpeechStarted {
            item_id: "item_user_1".into(),
            audio_start_ms: 120,
        },
        ConversationUpdate::InputSpeechFinished {
            item_id: "item_user_1".into(),
            audio_end_ms: 980,
        },
        ConversationUpdate::InputAudioCommitted {
            item_id: "item_user_1".into(),
        },
        ConversationUpdate::InputTranscriptionFinished {
            item_id: "item_user_1".into(),
            transcript: "What is a ring buffer?".into(),
        },
        ConversationUpdate::ResponseStarted {
            response_id: "resp_1".into(),
        },
        ConversationUpdate::ItemStreamingStarted {
            item_id: item.clone(),
            function_name: None,
        },
    ];

    let words = ["A fixed-size ", "queue that ", "wraps around."];
    let chunk = reply_audio.len() / words.len();
    for (index, word) in words.iter().enumerate() {
        updates.push(ConversationUpdate::ItemStreamingPartDelta {
            item_id: item.clone(),
            audio: Some(reply_audio[index * chunk..(index + 1) * chunk].to_vec()),
            transcript: Some((*word).to_string()),
            text: None,
        });
    }

    updates.extend([
        ConversationUpdate::ItemStreamingAudioFinished {
            item_id: item.clone(),
        },
        ConversationUpdate::ItemStreamingFinished { item_id: item },
        ConversationUpdate::ResponseFinished {
            response_id: "resp_1".into(),
        },
    ]);
    updates
}

fn tone(rate: u32, millis: u32, frequency: f32) -> Vec<f32> {
    let count = rate * millis / 1000;
    (0..count)
        .map(|i| (i as f32 * frequency * TAU / rate as f32).sin() * 0.2)
        .collect()
}

fn main() -> Result<()> {
    logging::init(logging::DEFAULT_DIRECTIVE);

    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let rate = config.audio_format.sample_rate;

    let interrupt = Arc::new(CancelSource::new("ctrl-c"));
    let handler_source = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        handler_source.cancel();
    })?;

    let shell = ConversationShell::new(config.clone(), SessionConsole::stdout(), Some(&interrupt.token()))?;
    let session = MockSession::new();
    shell.connect(&MockClient::new(Arc::clone(&session)))?;
    let receive = shell.run_background()?;

    // One second of "user speech" waiting in the microphone
    shell
        .devices()
        .microphone()
        .write(&pcm16_from_f32(&tone(rate, 1000, 220.0)));

    let player = session.play_script(
        script(pcm16_from_f32(&tone(rate, 600, 440.0))),
        Duration::from_millis(40),
    );
    player
        .join()
        .map_err(|_| anyhow::anyhow!("script thread panicked"))?;

    // The scripted user is done talking
    interrupt.cancel();
    receive.wait(config.shutdown_timeout());

    let snapshot = shell.snapshot();
    info!(
        "Responses finished: {}, transcriptions: {}, audio sent: {} bytes",
        snapshot.responses_finished,
        snapshot.transcriptions_finished,
        session.sent_audio_len()
    );

    match shell.finish_session(config.shutdown_timeout())? {
        ShutdownReport::Completed { elapsed } => {
            println!("It took {} ms to finish the session.", elapsed.as_millis())
        }
        ShutdownReport::TimedOut { pending } => {
            eprintln!("Failed to cleanly stop: {}", pending.join(", "))
        }
    }
    Ok(())
}
