//! Audio-task fan-in
//!
//! However capture and send finish, the "audio input finished" step must run
//! exactly once and the microphone signal must be canceled exactly once.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use voxrelay::audio::MicrophoneStream;
use voxrelay::runtime::{cancel_stop_dispose_all, CancelRegistration, WorkerTask};
use voxrelay::session::{
    AudioInputFinished, ConversationCancellation, MockClient, MockSession, ReceiverState,
    UpdatesReceiver,
};
use voxrelay::SessionConfig;

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// A receiver with audio input running against a mock session
struct AudioRig {
    receiver: UpdatesReceiver,
    cancellation: Arc<ConversationCancellation>,
    microphone: MicrophoneStream,
    session: Arc<MockSession>,
    receive: WorkerTask,
    finished: Arc<AtomicUsize>,
    microphone_cancels: Arc<AtomicUsize>,
    _watch: CancelRegistration,
}

impl AudioRig {
    fn start(label: &str, configure: impl FnOnce(&MockSession)) -> Self {
        let config = SessionConfig::default().with_relay_label(label);
        let cancellation = Arc::new(ConversationCancellation::default());
        let microphone = MicrophoneStream::new(config.audio_format, cancellation.microphone_token());
        let receiver =
            UpdatesReceiver::new(config, Arc::clone(&cancellation), microphone.clone()).unwrap();

        let session = MockSession::new();
        configure(&session);
        receiver.connect(&MockClient::new(Arc::clone(&session))).unwrap();

        let finished = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&finished);
        receiver
            .events()
            .subscribe::<AudioInputFinished, _>(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let microphone_cancels = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&microphone_cancels);
        let watch = cancellation.microphone_token().on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let receive = receiver.run_background().unwrap();
        receiver.start_audio_input().unwrap();
        Self {
            receiver,
            cancellation,
            microphone,
            session,
            receive,
            finished,
            microphone_cancels,
            _watch: watch,
        }
    }

    fn audio_tasks(&self) -> Vec<WorkerTask> {
        [self.receiver.send_task(), self.receiver.capture_task()]
            .into_iter()
            .flatten()
            .collect()
    }

    fn assert_finished_once(&self) {
        assert!(wait_until(Duration::from_secs(5), || {
            self.finished.load(Ordering::SeqCst) == 1
        }));
        for task in self.audio_tasks() {
            assert!(task.wait(Duration::from_secs(5)), "'{}' still running", task.label());
        }
        assert!(self.receive.wait(Duration::from_secs(5)));

        // Late or duplicate notifications would have been relayed by now
        thread::sleep(Duration::from_millis(20));
        assert_eq!(self.finished.load(Ordering::SeqCst), 1);
        assert_eq!(self.microphone_cancels.load(Ordering::SeqCst), 1);
        assert!(self.cancellation.is_microphone_cancelled());
    }

    fn stop(self) {
        let report = cancel_stop_dispose_all(&self.receiver.task_list(), Duration::from_secs(5)).unwrap();
        assert!(report.is_clean());
    }
}

#[test]
fn test_random_finish_orders_end_audio_input_once() {
    let mut rng = rand::thread_rng();
    for round in 0..20 {
        let send_faults = rng.gen_bool(0.5);
        let capture_faults = rng.gen_bool(0.5);
        let audio_delay = Duration::from_millis(rng.gen_range(0..4));
        let stop_delay = Duration::from_millis(rng.gen_range(0..4));

        let rig = AudioRig::start(&format!("fan-in-relay-{round}"), |session| {
            if send_faults {
                session.panic_on_send();
            }
        });

        let microphone = rig.microphone.clone();
        let feeder = thread::spawn(move || {
            thread::sleep(audio_delay);
            microphone.write(&vec![0u8; 9600]);
        });
        let microphone = rig.microphone.clone();
        let cancellation = Arc::clone(&rig.cancellation);
        let stopper = thread::spawn(move || {
            thread::sleep(stop_delay);
            if capture_faults {
                microphone.close();
            } else {
                cancellation.cancel_microphone();
            }
        });
        feeder.join().unwrap();
        stopper.join().unwrap();

        rig.assert_finished_once();
        rig.stop();
    }
}

#[test]
fn test_capture_and_send_both_faulting_finish_once() {
    let rig = AudioRig::start("fan-in-faults", |session| session.panic_on_send());
    rig.microphone.write(&vec![0u8; 9600]);

    let send = rig.receiver.send_task().unwrap();
    assert!(send.wait(Duration::from_secs(5)));
    assert_eq!(send.fault().as_deref(), Some("audio encoder crashed"));
    assert_eq!(rig.finished.load(Ordering::SeqCst), 0);
    assert!(!rig.cancellation.is_microphone_cancelled());

    // The device goes away under a live capture
    rig.microphone.close();
    let capture = rig.receiver.capture_task().unwrap();
    assert!(capture.wait(Duration::from_secs(5)));
    assert!(capture
        .fault()
        .is_some_and(|message| message.starts_with("microphone stream closed")));

    rig.assert_finished_once();
    assert_eq!(rig.session.sent_audio_len(), 0);
    rig.stop();
}

#[test]
fn test_failed_sends_end_audio_input_once() {
    let config = SessionConfig::default().with_relay_label("fan-in-relay");
    let cancellation = Arc::new(ConversationCancellation::default());
    let microphone = MicrophoneStream::new(config.audio_format, cancellation.microphone_token());
    let receiver = UpdatesReceiver::new(config, Arc::clone(&cancellation), microphone.clone()).unwrap();

    let session = MockSession::new();
    session.fail_sends();
    receiver.connect(&MockClient::new(Arc::clone(&session))).unwrap();

    let finished = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&finished);
    receiver
        .events()
        .subscribe::<AudioInputFinished, _>(move |_| *sink.lock() += 1)
        .unwrap();

    let task = receiver.run_background().unwrap();
    receiver.start_audio_input().unwrap();
    microphone.write(&vec![0u8; 4096 * 4]);

    // The send worker gives up on the first failed send; capture keeps going
    let send = receiver.send_task().unwrap();
    assert!(send.wait(Duration::from_secs(5)));
    assert_eq!(*finished.lock(), 0);

    cancellation.cancel_microphone();
    assert!(receiver.capture_task().unwrap().wait(Duration::from_secs(5)));
    assert!(wait_until(Duration::from_secs(5), || *finished.lock() == 1));
    assert!(task.wait(Duration::from_secs(5)));
    assert_eq!(receiver.state(), ReceiverState::Disconnected);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(*finished.lock(), 1);
    assert_eq!(session.sent_audio_len(), 0);
}
