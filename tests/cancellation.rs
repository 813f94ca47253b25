//! Cancellation tree of a conversation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use voxrelay::runtime::{CancelSource, WorkerTask};
use voxrelay::session::ConversationCancellation;

#[test]
fn test_interrupt_reaches_workers_linked_below_the_shell() {
    let interrupt = CancelSource::new("ctrl-c");
    let cancellation = ConversationCancellation::new(Some(&interrupt.token()));

    let capture = WorkerTask::linked("capture-audio", &cancellation.microphone_token(), |token| {
        token.wait();
        Ok(())
    });
    let playback = WorkerTask::linked("playback", &cancellation.speech_token(), |token| {
        token.wait();
        Ok(())
    });
    capture.start().unwrap();
    playback.start().unwrap();

    interrupt.cancel();
    assert!(capture.wait(Duration::from_secs(5)));
    assert!(!playback.wait(Duration::from_millis(30)));

    cancellation.cancel_speech();
    assert!(playback.wait(Duration::from_secs(5)));
    assert!(!cancellation.websocket_token().is_cancelled());
}

#[test]
fn test_registration_runs_once_and_can_be_dropped() {
    let cancellation = ConversationCancellation::default();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let _kept = cancellation.microphone_token().on_cancel(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&fired);
    let dropped = cancellation.microphone_token().on_cancel(move || {
        counter.fetch_add(100, Ordering::SeqCst);
    });
    drop(dropped);

    cancellation.cancel_shell();
    cancellation.cancel_shell();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Registering on a canceled token runs the callback immediately
    let counter = Arc::clone(&fired);
    let _late = cancellation.microphone_token().on_cancel(move || {
        counter.fetch_add(10, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 11);
}
