//! Relay ordering across producer threads
//!
//! Events published from many threads must run on the relay worker in the order
//! their enqueue succeeded, and the close message must let earlier events through
//! while refusing later ones.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use voxrelay::runtime::{EventRegistry, EventRelay, RelayWorker};

#[derive(Clone, Debug)]
struct Sample {
    producer: usize,
    sequence: usize,
}

#[derive(Clone, Debug)]
struct Marker(&'static str);

#[test]
fn test_per_producer_order_survives_relay() {
    let relay = RelayWorker::new("ordering-relay").unwrap();
    let registry = Arc::new(EventRegistry::new());
    registry.enable::<Sample>().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    registry
        .connect(EventRelay::to_handler(relay.queue(), move |sample: &Sample| {
            let name = thread::current().name().map(str::to_string);
            sink.lock().push((sample.clone(), name));
        }))
        .unwrap();
    relay.start().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for sequence in 0..250 {
                    registry.publish(Sample { producer, sequence }).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(relay.close());
    assert!(relay.wait(Duration::from_secs(10)));

    let seen = seen.lock();
    assert_eq!(seen.len(), 1000);
    let mut last: HashMap<usize, usize> = HashMap::new();
    for (sample, name) in seen.iter() {
        assert_eq!(name.as_deref(), Some("ordering-relay"));
        if let Some(previous) = last.insert(sample.producer, sample.sequence) {
            assert_eq!(sample.sequence, previous + 1);
        }
    }
}

#[test]
fn test_types_share_one_total_order() {
    let relay = RelayWorker::new("mixed-relay").unwrap();
    let upstream = EventRegistry::new();
    upstream.enable::<Sample>().unwrap();
    upstream.enable::<Marker>().unwrap();
    let downstream = Arc::new(EventRegistry::new());
    downstream.forward_all_from(&upstream, relay.queue()).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    downstream
        .subscribe::<Sample, _>(move |sample| sink.lock().push(format!("sample {}", sample.sequence)))
        .unwrap();
    let sink = Arc::clone(&log);
    downstream
        .subscribe::<Marker, _>(move |marker| sink.lock().push(format!("marker {}", marker.0)))
        .unwrap();

    upstream.publish(Marker("begin")).unwrap();
    upstream
        .publish(Sample {
            producer: 0,
            sequence: 1,
        })
        .unwrap();
    upstream.publish(Marker("end")).unwrap();

    relay.start().unwrap();
    relay.close();
    assert!(relay.wait(Duration::from_secs(5)));

    assert_eq!(
        *log.lock(),
        vec!["marker begin", "sample 1", "marker end"]
    );
}

#[test]
fn test_close_delivers_earlier_and_drops_later() {
    let relay = RelayWorker::new("closing-relay").unwrap();
    let registry = EventRegistry::new();
    registry.enable::<Marker>().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    registry
        .connect(EventRelay::to_handler(relay.queue(), move |marker: &Marker| {
            sink.lock().push(marker.0)
        }))
        .unwrap();

    registry.publish(Marker("before")).unwrap();
    relay.close();
    registry.publish(Marker("after")).unwrap();

    relay.start().unwrap();
    assert!(relay.wait(Duration::from_secs(5)));
    assert_eq!(*log.lock(), vec!["before"]);
    assert!(relay.queue().is_complete());
}
