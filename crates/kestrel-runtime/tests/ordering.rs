//! Ordering and dependency scenarios
//!
//! Drives the full dispatch/completion machinery through the software
//! queue: FIFO completion, cross-stream event waits, dependency gating,
//! and automatic retry on slot exhaustion.

use kestrel_runtime::{
    Command, CommandState, Event, HwContext, ProfileListener, SoftwareQueue, Stream, StreamKind,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn software_ctx(slots: usize, latency: Duration) -> Arc<HwContext> {
    HwContext::with_backend(
        0,
        Box::new(SoftwareQueue::new(slots).with_latency(latency)),
    )
}

/// Records the uid of every command the moment it retires
#[derive(Default)]
struct CompletionLog {
    retired: Mutex<Vec<u64>>,
}

impl ProfileListener for CompletionLog {
    fn on_transition(&self, uid: u64, _kind: &'static str, state: CommandState) {
        if state.is_terminal() {
            self.retired.lock().push(uid);
        }
    }
}

#[test]
fn mixed_command_kinds_complete_in_enqueue_order() {
    let log = Arc::new(CompletionLog::default());
    let device = kestrel_runtime::Device::new(0);
    device.set_profile_listener(log.clone());
    let ctx = device.register_context_with_backend(Box::new(
        SoftwareQueue::new(8).with_latency(Duration::from_millis(5)),
    ));
    let stream = Stream::new(StreamKind::User, ctx);

    let a = Command::marker();
    let b = Command::kernel("scale", bytes::Bytes::from_static(&[1, 0, 0, 0]));
    let c = Command::copy(bytes::Bytes::from_static(b"payload"), 0x1000);

    stream.enqueue(&a).unwrap();
    stream.enqueue(&b).unwrap();
    stream.enqueue(&c).unwrap();
    stream.synchronize().unwrap();

    for cmd in [&a, &b, &c] {
        assert_eq!(cmd.state(), CommandState::Completed);
    }
    assert_eq!(*log.retired.lock(), vec![a.uid(), b.uid(), c.uid()]);
}

#[test]
fn earlier_command_terminal_before_later_dispatch() {
    let ctx = software_ctx(8, Duration::from_millis(100));
    let stream = Stream::new(StreamKind::User, ctx);

    let first = Command::marker();
    let second = Command::marker();
    stream.enqueue(&first).unwrap();
    stream.enqueue(&second).unwrap();

    // The stream serializes: while the first command occupies the queue,
    // the second must not have been dispatched
    assert_eq!(first.state(), CommandState::Running);
    assert_eq!(second.state(), CommandState::Queued);

    stream.synchronize().unwrap();
    assert!(first.is_complete() && second.is_complete());
}

#[test]
fn cross_stream_wait_gates_dispatch() {
    let ctx = software_ctx(8, Duration::from_millis(150));
    let s1 = Stream::new(StreamKind::User, Arc::clone(&ctx));
    let s2 = Stream::new(StreamKind::User, ctx);

    // A runs slowly on S1; E records its completion point
    let a = Command::marker();
    s1.enqueue(&a).unwrap();
    let e = Event::new();
    e.record(&s1).unwrap();

    // D on S2 must not dispatch until A (and the marker) completed,
    // regardless of S2 being otherwise empty
    s2.wait_on(&e).unwrap();
    let d = Command::marker();
    s2.enqueue(&d).unwrap();

    assert_eq!(a.state(), CommandState::Running);
    assert_eq!(d.state(), CommandState::Queued);

    s2.synchronize().unwrap();
    assert!(a.is_complete(), "dependency source must retire first");
    assert_eq!(d.state(), CommandState::Completed);
}

#[test]
fn same_stream_top_event_wait_is_elided() {
    let ctx = software_ctx(8, Duration::ZERO);
    let stream = Stream::new(StreamKind::User, ctx);

    let work = Command::marker();
    stream.enqueue(&work).unwrap();

    let e = Event::new();
    e.record(&stream).unwrap();

    // Fast path: waiting on our own top event injects nothing
    stream.wait_on(&e).unwrap();
    stream.synchronize().unwrap();

    // Both paths must produce the same ordering outcome: everything
    // recorded before the event is complete once the wait resolves
    assert!(work.is_complete());
    assert_eq!(e.query().unwrap(), true);
}

#[test]
fn explicit_dependency_gates_across_streams() {
    let ctx = software_ctx(8, Duration::from_millis(100));
    let s1 = Stream::new(StreamKind::User, Arc::clone(&ctx));
    let s2 = Stream::new(StreamKind::User, ctx);

    let producer = Command::marker();
    let consumer = Command::marker();
    consumer.add_dependency(&producer).unwrap();

    s2.enqueue(&consumer).unwrap();
    assert_eq!(
        consumer.state(),
        CommandState::Queued,
        "consumer must hold until its dependency even as queue front"
    );

    s1.enqueue(&producer).unwrap();
    s2.synchronize().unwrap();

    assert!(producer.is_complete());
    assert_eq!(consumer.state(), CommandState::Completed);
}

#[test]
fn one_slot_queue_retries_automatically() {
    // Two independent streams fight over a single hardware slot
    let ctx = software_ctx(1, Duration::from_millis(150));
    let s1 = Stream::new(StreamKind::User, Arc::clone(&ctx));
    let s2 = Stream::new(StreamKind::User, ctx);

    let first = Command::marker();
    let second = Command::marker();
    s1.enqueue(&first).unwrap();
    s2.enqueue(&second).unwrap();

    // The slot is occupied by the first command; the second stays queued
    // rather than failing the enqueue call
    assert_eq!(first.state(), CommandState::Running);
    assert_eq!(second.state(), CommandState::Queued);

    s1.synchronize().unwrap();
    s2.synchronize().unwrap();
    assert!(first.is_complete() && second.is_complete());
}

#[test]
fn retirement_order_matches_enqueue_order() {
    let log = Arc::new(CompletionLog::default());

    let device = kestrel_runtime::Device::new(0);
    device.set_profile_listener(log.clone());
    let ctx = device.register_context_with_backend(Box::new(
        SoftwareQueue::new(4).with_latency(Duration::from_millis(2)),
    ));
    let stream = Stream::new(StreamKind::User, ctx);

    let cmds: Vec<_> = (0..5).map(|_| Command::marker()).collect();
    for cmd in &cmds {
        stream.enqueue(cmd).unwrap();
    }
    stream.synchronize().unwrap();

    let expected: Vec<u64> = cmds.iter().map(|c| c.uid()).collect();
    assert_eq!(*log.retired.lock(), expected);
}

#[test]
fn concurrent_producers_all_complete() {
    let ctx = software_ctx(4, Duration::from_micros(200));
    let stream = Stream::new(StreamKind::User, ctx);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let stream = Arc::clone(&stream);
            std::thread::spawn(move || {
                let mut cmds = Vec::new();
                for _ in 0..16 {
                    let cmd = Command::marker();
                    stream.enqueue(&cmd).unwrap();
                    cmds.push(cmd);
                }
                cmds
            })
        })
        .collect();

    let all: Vec<_> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    stream.synchronize().unwrap();
    // synchronize() covers the snapshot; wait out every command explicitly
    for cmd in &all {
        cmd.synchronize().unwrap();
    }
    assert!(all.iter().all(|c| c.state() == CommandState::Completed));
}

#[test]
fn slot_error_does_not_poison_siblings() {
    let mut queue = SoftwareQueue::new(4);
    queue.inject_failures(1);
    let ctx = HwContext::with_backend(0, Box::new(queue));
    let stream = Stream::new(StreamKind::User, ctx);

    let bad = Command::marker();
    let good = Command::marker();
    stream.enqueue(&bad).unwrap();
    stream.enqueue(&good).unwrap();

    assert_eq!(bad.synchronize().unwrap(), CommandState::Error);
    // Sibling failure is independent: the next command still runs
    assert_eq!(good.synchronize().unwrap(), CommandState::Completed);
}

#[test]
fn dependency_on_failed_command_propagates_error() {
    let mut queue = SoftwareQueue::new(4);
    queue.inject_failures(1);
    let ctx = HwContext::with_backend(0, Box::new(queue));
    let s1 = Stream::new(StreamKind::User, Arc::clone(&ctx));
    let s2 = Stream::new(StreamKind::User, ctx);

    let doomed = Command::marker();
    let dependent = Command::marker();
    dependent.add_dependency(&doomed).unwrap();

    s1.enqueue(&doomed).unwrap();
    s2.enqueue(&dependent).unwrap();

    assert_eq!(doomed.synchronize().unwrap(), CommandState::Error);
    assert_eq!(dependent.synchronize().unwrap(), CommandState::Error);
}
