//! End-to-end scenarios covering concrete multi-stream scheduling behaviors.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use multiqueue_core::{DownstreamSink, FlowStatus, Item, MarkerKind, MultiQueue, Properties};

struct ChannelSink {
    tx: Sender<Arc<Item>>,
}

impl DownstreamSink for ChannelSink {
    fn push(&self, item: Arc<Item>) -> FlowStatus {
        let _ = self.tx.send(item);
        FlowStatus::Ok
    }
}

struct NotLinkedSink;

impl DownstreamSink for NotLinkedSink {
    fn push(&self, _item: Arc<Item>) -> FlowStatus {
        FlowStatus::NotLinked
    }
}

/// A sink that blocks every push until `open()` is called, modeling a
/// paused consumer.
struct GatedSink {
    tx: Sender<Arc<Item>>,
    gate: Mutex<bool>,
    cvar: Condvar,
}

impl GatedSink {
    fn new(tx: Sender<Arc<Item>>) -> Self {
        Self {
            tx,
            gate: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.gate.lock() = true;
        self.cvar.notify_all();
    }
}

impl DownstreamSink for GatedSink {
    fn push(&self, item: Arc<Item>) -> FlowStatus {
        let mut open = self.gate.lock();
        while !*open {
            self.cvar.wait(&mut open);
        }
        let _ = self.tx.send(item);
        FlowStatus::Ok
    }
}

fn recv_timeout<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(5)).expect("expected an item before the timeout")
}

#[test]
fn s1_two_queues_symmetric_delivery() {
    let mq = Arc::new(MultiQueue::new(Properties::default().with_max_size_items(10)));
    let (tx0, rx0) = crossbeam_channel::unbounded();
    let (tx1, rx1) = crossbeam_channel::unbounded();

    let q0 = mq.request_input(0, 0, false, None, Arc::new(ChannelSink { tx: tx0 })).unwrap();
    let q1 = mq.request_input(1, 1, false, None, Arc::new(ChannelSink { tx: tx1 })).unwrap();

    for i in 0..100i64 {
        mq.push_data(q0, Item::data(1000, Some(i), None)).unwrap();
        mq.push_data(q1, Item::data(1000, Some(i), None)).unwrap();
    }

    for i in 0..100i64 {
        let item0 = recv_timeout(&rx0);
        let item1 = recv_timeout(&rx1);
        assert!(item0.is_data());
        assert!(item1.is_data());
        assert_eq!(item0.timestamp_ns, Some(i));
        assert_eq!(item1.timestamp_ns, Some(i));
    }

    mq.release_input(q0).unwrap();
    mq.release_input(q1).unwrap();
}

#[test]
fn s2_unlinked_does_not_block_linked() {
    let mq = Arc::new(MultiQueue::new(Properties::default().with_max_size_items(20)));
    let (tx0, rx0) = crossbeam_channel::unbounded();

    let q0 = mq.request_input(0, 0, false, None, Arc::new(ChannelSink { tx: tx0 })).unwrap();
    let q1 = mq.request_input(0, 1, false, None, Arc::new(NotLinkedSink)).unwrap();

    let mq_producer = mq.clone();
    let producer = thread::spawn(move || {
        for i in 0..1000i64 {
            mq_producer.push_data(q0, Item::data(10, Some(i), None)).unwrap();
            mq_producer.push_data(q1, Item::data(10, Some(i), None)).unwrap();
        }
    });

    for i in 0..1000i64 {
        let item = recv_timeout(&rx0);
        assert_eq!(item.timestamp_ns, Some(i));
    }

    producer.join().unwrap();
    mq.release_input(q0).unwrap();
    mq.release_input(q1).unwrap();
}

#[test]
fn s3_grow_to_unstick() {
    let mq = Arc::new(MultiQueue::new(Properties::default().with_max_size_items(5)));
    let (tx0, rx0) = crossbeam_channel::unbounded();
    let (tx1, _rx1) = crossbeam_channel::unbounded();

    let sink0 = Arc::new(GatedSink::new(tx0));
    let q0 = mq.request_input(0, 0, false, None, sink0.clone()).unwrap();
    let q1 = mq.request_input(1, 1, false, None, Arc::new(ChannelSink { tx: tx1 })).unwrap();

    let mq_producer = mq.clone();
    let producer = thread::spawn(move || {
        for i in 0..100i64 {
            mq_producer.push_data(q0, Item::data(10, Some(i), None)).unwrap();
        }
    });

    // Q0's consumer stays gated shut while Q1 (linked, non-sparse) sits
    // empty, which should trigger the grow-to-avoid-deadlock rule instead
    // of letting the producer block forever.
    thread::sleep(Duration::from_millis(200));
    assert!(
        mq.stats(q0).unwrap().items > 5,
        "grow-to-unstick should have raised Q0's item cap past its original 5"
    );

    sink0.open();
    for i in 0..100i64 {
        let item = recv_timeout(&rx0);
        assert_eq!(item.timestamp_ns, Some(i));
    }

    producer.join().unwrap();
    mq.release_input(q0).unwrap();
    mq.release_input(q1).unwrap();
}

#[test]
fn s4_running_time_alignment_preserves_per_queue_order() {
    let props = Properties::default().with_max_size_items(10).with_sync_by_running_time(true);
    let mq = Arc::new(MultiQueue::new(props));
    let (tx0, rx0) = crossbeam_channel::unbounded();
    let (tx1, rx1) = crossbeam_channel::unbounded();

    let q0 = mq.request_input(0, 0, false, None, Arc::new(ChannelSink { tx: tx0 })).unwrap();
    let q1 = mq.request_input(0, 1, false, None, Arc::new(ChannelSink { tx: tx1 })).unwrap();

    let times0 = [0i64, 100_000_000, 200_000_000];
    let times1 = [50_000_000, 150_000_000, 250_000_000];

    let mq0 = mq.clone();
    let producer0 = thread::spawn(move || {
        for &t in &times0 {
            mq0.push_data(q0, Item::data(10, Some(t), None)).unwrap();
        }
    });
    let mq1 = mq.clone();
    let producer1 = thread::spawn(move || {
        for &t in &times1 {
            mq1.push_data(q1, Item::data(10, Some(t), None)).unwrap();
        }
    });
    producer0.join().unwrap();
    producer1.join().unwrap();

    let mut last0 = i64::MIN;
    for _ in 0..3 {
        let t = recv_timeout(&rx0).timestamp_ns.unwrap();
        assert!(t >= last0, "Q0's own delivery order must stay non-decreasing");
        last0 = t;
    }
    let mut last1 = i64::MIN;
    for _ in 0..3 {
        let t = recv_timeout(&rx1).timestamp_ns.unwrap();
        assert!(t >= last1, "Q1's own delivery order must stay non-decreasing");
        last1 = t;
    }

    mq.release_input(q0).unwrap();
    mq.release_input(q1).unwrap();
}

#[test]
fn s5_buffering_messages_have_no_duplicate_percents() {
    let percents: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let log_for_hook = percents.clone();

    let props = Properties::default()
        .with_use_buffering(true)
        .with_watermarks_ppm(100_000, 990_000)
        .with_max_size_bytes(1024 * 1024)
        .with_max_size_items(0)
        .with_max_size_time_ns(0);

    let mq = Arc::new(MultiQueue::with_hooks(
        props,
        None,
        None,
        Some(Box::new(move |pct| log_for_hook.lock().push(pct))),
    ));

    let (tx0, rx0) = crossbeam_channel::unbounded();
    let sink0 = Arc::new(GatedSink::new(tx0));
    let q0 = mq.request_input(0, 0, false, None, sink0.clone()).unwrap();

    mq.push_data(q0, Item::data(100 * 1024, None, None)).unwrap();
    thread::sleep(Duration::from_millis(100));

    for _ in 0..9 {
        mq.push_data(q0, Item::data(100 * 1024, None, None)).unwrap();
    }
    thread::sleep(Duration::from_millis(100));

    sink0.open();
    for _ in 0..10 {
        recv_timeout(&rx0);
    }

    let log = percents.lock();
    assert!(!log.is_empty(), "expected at least one buffering percent update");
    assert!(
        log.windows(2).all(|w| w[0] != w[1]),
        "no two consecutive buffering percents should be identical"
    );

    mq.release_input(q0).unwrap();
}

#[test]
fn s6_flush_mid_stream_resets_and_resumes() {
    let mq = Arc::new(MultiQueue::new(Properties::default().with_max_size_items(50)));
    let (tx0, rx0) = crossbeam_channel::unbounded();
    let q0 = mq.request_input(0, 0, false, None, Arc::new(ChannelSink { tx: tx0 })).unwrap();

    for i in 0..5i64 {
        mq.push_data(q0, Item::data(10, Some(i), None)).unwrap();
    }
    for i in 0..5i64 {
        assert_eq!(recv_timeout(&rx0).timestamp_ns, Some(i));
    }

    let flush_start_status = mq.push_event(q0, Item::marker(MarkerKind::FlushStart)).unwrap();
    assert_eq!(flush_start_status, FlowStatus::Ok);

    let during_flush = mq.push_data(q0, Item::data(10, Some(99), None)).unwrap();
    assert_eq!(during_flush, FlowStatus::Flushing, "pushes during a flush must return FLUSHING");

    mq.push_event(q0, Item::marker(MarkerKind::FlushStop)).unwrap();

    let stats = mq.stats(q0).unwrap();
    assert_eq!(stats.items, 0, "FlushStop must reset the FIFO");
    assert_eq!(stats.time_ns, 0, "FlushStop must reset cur_time_ns");

    for i in 100..103i64 {
        mq.push_data(q0, Item::data(10, Some(i), None)).unwrap();
    }
    for i in 100..103i64 {
        assert_eq!(recv_timeout(&rx0).timestamp_ns, Some(i));
    }

    mq.release_input(q0).unwrap();
}
