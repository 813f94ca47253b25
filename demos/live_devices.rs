//! Runs a session on the default microphone and speaker
//!
//! Run with `cargo run --example live_devices --features audio-io`. Whatever the
//! microphone picks up is streamed to an in-process session, which answers with a
//! short tone once the user has had a few seconds to speak. Ctrl-C ends early.

use anyhow::Result;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use voxrelay::audio::device::{MicrophoneDevice, SpeakerDevice};
use voxrelay::audio::format::pcm16_from_f32;
use voxrelay::runtime::{CancelSource, ShutdownReport};
use voxrelay::session::{ConversationShell, ConversationUpdate, MockClient, MockSession, SessionConsole};
use voxrelay::{logging, SessionConfig};

const LISTEN_SECONDS: u64 = 4;

fn reply(rate: u32) -> Vec<ConversationUpdate> {
    let samples: Vec<f32> = (0..rate)
        .map(|i| (i as f32 * 330.0 * TAU / rate as f32).sin() * 0.2)
        .collect();
    let item = "item_agent_1".to_string();
    vec![
        ConversationUpdate::ResponseStarted {
            response_id: "resp_1".into(),
        },
        ConversationUpdate::ItemStreamingStarted {
            item_id: item.clone(),
            function_name: None,
        },
        ConversationUpdate::ItemStreamingPartDelta {
            item_id: item.clone(),
            audio: Some(pcm16_from_f32(&samples)),
            transcript: Some("I heard you.".into()),
            text: None,
        },
        ConversationUpdate::ItemStreamingFinished { item_id: item },
        ConversationUpdate::ResponseFinished {
            response_id: "resp_1".into(),
        },
    ]
}

fn main() -> Result<()> {
    logging::init(logging::DEFAULT_DIRECTIVE);

    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let format = config.audio_format;

    let interrupt = Arc::new(CancelSource::new("ctrl-c"));
    let handler_source = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        handler_source.cancel();
    })?;

    let shell = ConversationShell::new(config.clone(), SessionConsole::stdout(), Some(&interrupt.token()))?;

    let mut microphone = MicrophoneDevice::new(format)?;
    microphone.start(shell.devices().microphone().clone())?;
    let mut speaker = SpeakerDevice::new(format)?;
    speaker.start(shell.devices().speaker().clone())?;

    let session = MockSession::new();
    shell.connect(&MockClient::new(Arc::clone(&session)))?;
    let receive = shell.run_background()?;
    session.push(ConversationUpdate::SessionStarted {
        session_id: "sess_live".into(),
    });

    // Speak now
    if !interrupt.token().wait_timeout(Duration::from_secs(LISTEN_SECONDS)) {
        session
            .play_script(reply(format.sample_rate), Duration::from_millis(20))
            .join()
            .map_err(|_| anyhow::anyhow!("script thread panicked"))?;
        while shell.devices().buffered_ms() > 0 && !interrupt.is_cancelled() {
            thread::sleep(Duration::from_millis(50));
        }
    }

    interrupt.cancel();
    receive.wait(config.shutdown_timeout());
    info!("Streamed {} bytes of microphone audio", session.sent_audio_len());

    let report = shell.finish_session(config.shutdown_timeout())?;
    microphone.stop();
    speaker.stop();
    match report {
        ShutdownReport::Completed { elapsed } => {
            println!("It took {} ms to finish the session.", elapsed.as_millis())
        }
        ShutdownReport::TimedOut { pending } => {
            eprintln!("Failed to cleanly stop: {}", pending.join(", "))
        }
    }
    Ok(())
}
