//! A multi-stream buffering and scheduling core: one bounded FIFO per
//! registered stream, a single shared scheduling lock, and a worker thread
//! per stream that reorders, throttles and forwards items to a host-supplied
//! [`DownstreamSink`].
//!
//! The cross-thread state lives in [`shared::MultiQueueShared`] behind
//! `qlock`; [`MultiQueue`] itself only owns the thread-management and
//! sink-registry bookkeeping that doesn't need to be visible to worker
//! threads.

mod bounded_queue;
mod core;
mod error;
mod flow;
mod item;
mod properties;
mod segment;
mod shared;
mod single_queue;
mod stats;
mod worker;

pub use error::MultiQueueError;
pub use flow::{DownstreamSink, FlowStatus};
pub use item::{Item, ItemKind, MarkerKind, Query, Segment};
pub use properties::{Properties, SizeLimits, BUFFERING_LEVEL_SCALE};
pub use segment::SegmentState;
pub use stats::QueueStats;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{info, trace};

use crate::bounded_queue::FifoEntry;
use crate::core::CoreState;
use crate::item::MarkerKind as MK;
use crate::shared::MultiQueueShared;
use crate::single_queue::{IdAllocator, QueueState};
use crate::worker::spawn_worker;

/// A single property value, keyed by a kebab-case property name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    U64(u64),
    U32(u32),
    Bool(bool),
}

/// The multi-stream buffering and scheduling core.
///
/// Holds the thread-safe registry ([`shared::MultiQueueShared`]) plus the
/// two pieces of bookkeeping that live outside `qlock` because they're only
/// ever touched from the `MultiQueue` handle itself: the worker
/// `JoinHandle`s (joined by [`MultiQueue::release_input`]) and the
/// per-queue sink registry used for the synchronous Flush/non-serialized
/// forwarding paths, which must return to the producer immediately.
pub struct MultiQueue {
    shared: Arc<MultiQueueShared>,
    workers: Mutex<HashMap<u32, JoinHandle<()>>>,
    sinks: Mutex<HashMap<u32, Arc<dyn DownstreamSink>>>,
}

impl MultiQueue {
    pub fn new(props: Properties) -> Self {
        Self {
            shared: Arc::new(MultiQueueShared::new(props)),
            workers: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Constructs a core with the overrun/underrun/buffering callbacks
    /// wired in.
    pub fn with_hooks(
        props: Properties,
        on_overrun: Option<Box<dyn Fn() + Send + Sync>>,
        on_underrun: Option<Box<dyn Fn() + Send + Sync>>,
        on_buffering: Option<Box<dyn Fn(u8) + Send + Sync>>,
    ) -> Self {
        let shared = MultiQueueShared {
            qlock: Mutex::new(CoreState::new(props)),
            reconf_lock: Mutex::new(()),
            buffering_publish_lock: Mutex::new(()),
            counter: AtomicU64::new(0),
            ids: IdAllocator::new(),
            on_overrun,
            on_underrun,
            on_buffering,
        };
        Self {
            shared: Arc::new(shared),
            workers: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new stream and starts its worker thread. `explicit_id`
    /// lets the host pin a stable id across
    /// a seek/relink; otherwise one is allocated.
    pub fn request_input(
        &self,
        group_id: u32,
        producer_group: u32,
        sparse: bool,
        explicit_id: Option<u32>,
        sink: Arc<dyn DownstreamSink>,
    ) -> Result<u32, MultiQueueError> {
        let _reconf = self.shared.reconf_lock.lock();

        let id = {
            let mut guard = self.shared.qlock.lock();
            let id = match explicit_id {
                Some(id) => {
                    if guard.find_index(id).is_some() {
                        return Err(MultiQueueError::DuplicateId(id));
                    }
                    self.shared.ids.observe(id);
                    id
                }
                None => self.shared.ids.alloc(),
            };

            let mut q = QueueState::new(id, group_id, producer_group, guard.props.max_size);
            q.flags.is_sparse = sparse;
            q.flags.active = true;

            // Kept ordered by id: several of `CoreState`'s scans (e.g.
            // `recompute_high_id`) don't depend on order, but ordered
            // insertion keeps `queues` a stable, debuggable sequence
            // matching the order ids were allocated in.
            let insert_at = guard.queues.partition_point(|existing| existing.id < id);
            guard.queues.insert(insert_at, q);
            guard.bump_epoch();
            info!(id, group_id, producer_group, sparse, "request_input");
            id
        };

        self.sinks.lock().insert(id, sink.clone());
        let handle = spawn_worker(self.shared.clone(), id, sink);
        self.workers.lock().insert(id, handle);
        Ok(id)
    }

    /// Unregisters a stream, waking anything parked on it, and joins its
    /// worker thread.
    pub fn release_input(&self, id: u32) -> Result<(), MultiQueueError> {
        let _reconf = self.shared.reconf_lock.lock();

        {
            let mut guard = self.shared.qlock.lock();
            let idx = guard.find_index(id).ok_or(MultiQueueError::UnknownHandle(id))?;
            let wait = guard.queues[idx].wait.clone();
            guard.queues.remove(idx);
            guard.recompute_high_id();
            if guard.props.sync_by_running_time {
                guard.recompute_high_time();
            }
            guard.wake_unlinked_if_unblocked();
            guard.bump_epoch();
            wait.turn_cv.notify_all();
            wait.query_cv.notify_all();
            info!(id, "release_input");
        }

        self.sinks.lock().remove(&id);
        if let Some(handle) = self.workers.lock().remove(&id) {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Pushes a data item, blocking while the stream's FIFO is full
    /// running the grow-to-avoid-deadlock rule before it does.
    pub fn push_data(&self, id: u32, item: Arc<Item>) -> Result<FlowStatus, MultiQueueError> {
        self.enqueue(id, item, false)
    }

    /// Pushes a marker. `FlushStart`/`FlushStop` and
    /// non-serialized markers are forwarded synchronously on the calling
    /// thread and never enter the FIFO; everything else is enqueued like
    /// data, with Gap/SegmentStart bypassing the capacity check.
    pub fn push_event(&self, id: u32, item: Arc<Item>) -> Result<FlowStatus, MultiQueueError> {
        let Some(marker) = item.marker_kind().cloned() else {
            return Err(MultiQueueError::InvariantViolation(
                "push_event called with a non-marker item".into(),
            ));
        };

        match marker {
            MK::FlushStart => self.push_flush_start(id, item),
            MK::FlushStop => self.push_flush_stop(id, item),
            MK::OtherNonSerialized => {
                let sink = self.sink_for(id)?;
                Ok(sink.push(item))
            }
            _ => {
                let force = item.bypasses_capacity();
                self.enqueue(id, item, force)
            }
        }
    }

    /// Pushes a query. Non-serialized queries bypass
    /// the FIFO and go straight to the sink; serialized ones are ordered
    /// with the data stream and block until the worker answers them, unless
    /// the core is buffering and this stream still has data queued.
    pub fn push_query(&self, id: u32, item: Arc<Item>) -> Result<bool, MultiQueueError> {
        let serialized = match &item.kind {
            ItemKind::Query(q) => q.serialized,
            _ => {
                return Err(MultiQueueError::InvariantViolation(
                    "push_query called with a non-query item".into(),
                ))
            }
        };

        if !serialized {
            let sink = self.sink_for(id)?;
            return Ok(sink.push_query(item));
        }

        let mut guard = self.shared.qlock.lock();
        let idx = guard.find_index(id).ok_or(MultiQueueError::UnknownHandle(id))?;
        if guard.buffering && !guard.queues[idx].fifo.is_empty() {
            trace!(id, "refusing serialized query while buffering");
            return Ok(false);
        }

        let counter_id = self.shared.next_counter();
        guard.queues[idx].fifo.push_back(FifoEntry {
            item: item.clone(),
            id: Some(counter_id),
        });
        guard.queues[idx].pending_query = Some(item);
        guard.queues[idx].query_result = None;
        let wait = guard.queues[idx].wait.clone();
        wait.turn_cv.notify_all();

        loop {
            let idx = guard.find_index(id).ok_or(MultiQueueError::UnknownHandle(id))?;
            if let Some(result) = guard.queues[idx].query_result.take() {
                guard.queues[idx].pending_query = None;
                return Ok(result);
            }
            let wait = guard.queues[idx].wait.clone();
            wait.query_cv.wait(&mut guard);
        }
    }

    /// The shared enqueue path for data and ordinary serialized markers:
    /// blocks on capacity unless `force`, tries the grow-to-avoid-deadlock
    /// rule before parking, and updates the producer-side segment/sticky
    /// bookkeeping once admitted.
    fn enqueue(&self, id: u32, item: Arc<Item>, force: bool) -> Result<FlowStatus, MultiQueueError> {
        let mut guard = self.shared.qlock.lock();

        loop {
            let idx = guard.find_index(id).ok_or(MultiQueueError::UnknownHandle(id))?;
            if guard.queues[idx].flow_status.is_terminal() {
                return Ok(guard.queues[idx].flow_status);
            }
            if guard.queues[idx].flags.flushing {
                return Ok(FlowStatus::Flushing);
            }

            let unlinked_cache_time_ns = guard.props.unlinked_cache_time_ns;
            let use_buffering = guard.props.use_buffering;
            if force || !guard.queues[idx].is_full(use_buffering, unlinked_cache_time_ns) {
                break;
            }
            if guard.try_grow_for_overrun(id) {
                continue;
            }

            self.shared.emit_overrun();
            let wait = guard.queues[idx].wait.clone();
            trace!(id, "producer parking on full queue");
            wait.turn_cv.wait(&mut guard);
        }

        let idx = guard.find_index(id).ok_or(MultiQueueError::UnknownHandle(id))?;
        let counter_id = self.shared.next_counter();

        if let Some(marker) = item.marker_kind() {
            match marker {
                MK::StreamStart { group_id, .. } => {
                    let changed = *group_id != guard.queues[idx].stream_group_id_in;
                    guard.queues[idx].stream_group_changed = changed;
                    guard.queues[idx].stream_group_id_in = *group_id;
                }
                MK::SegmentStart(segment) => {
                    let rebase = !guard.queues[idx].stream_group_changed;
                    let previous = guard.queues[idx].sink_segment;
                    guard.queues[idx].sink_segment.set_segment(*segment);
                    if rebase {
                        guard.queues[idx].sink_segment.rebase_onto(&previous);
                    }
                }
                MK::Gap { duration_ns, .. } => {
                    if let Some(span) = duration_ns {
                        guard.queues[idx].sink_segment.advance_position(*span);
                    }
                }
                _ => {}
            }
        }

        if let Some(pos) = item.timestamp_ns {
            if let Some(running_time) = guard.queues[idx].sink_segment.to_running_time(pos) {
                guard.queues[idx].observe_sink_time(running_time);
            }
        }
        if item.is_sticky() {
            guard.queues[idx].sticky.observe(&item);
        }

        guard.queues[idx].fifo.push_back(FifoEntry {
            item: item.clone(),
            id: Some(counter_id),
        });
        let wait = guard.queues[idx].wait.clone();
        wait.turn_cv.notify_all();

        let buffering_pct = if guard.props.use_buffering && guard.recompute_buffering() {
            guard.take_buffering_percent()
        } else {
            None
        };
        let status = guard.queues[idx].flow_status;
        drop(guard);
        if let Some(pct) = buffering_pct {
            self.shared.emit_buffering(pct);
        }

        Ok(status)
    }

    /// FlushStart: forward downstream first, then atomically
    /// mark the stream flushing and drop anything already queued, waking
    /// every parked worker/producer for it.
    fn push_flush_start(&self, id: u32, item: Arc<Item>) -> Result<FlowStatus, MultiQueueError> {
        let sink = self.sink_for(id)?;
        let status = sink.push(item);

        let mut guard = self.shared.qlock.lock();
        let idx = guard.find_index(id).ok_or(MultiQueueError::UnknownHandle(id))?;
        guard.queues[idx].flow_status = FlowStatus::Flushing;
        guard.queues[idx].flags.flushing = true;
        guard.queues[idx].fifo.flush();
        let wait = guard.queues[idx].wait.clone();
        guard.bump_epoch();
        wait.turn_cv.notify_all();
        wait.query_cv.notify_all();
        info!(id, "FlushStart");
        Ok(status)
    }

    /// FlushStop: forward downstream, reset the stream's
    /// scheduling state, then re-enqueue the sticky StreamStart/SegmentStart
    /// so the worker replays
    /// them ahead of any data admitted after this call returns. The replay
    /// is enqueued before the lock is released, so no producer can race it
    /// in ahead of the replay.
    fn push_flush_stop(&self, id: u32, item: Arc<Item>) -> Result<FlowStatus, MultiQueueError> {
        let sink = self.sink_for(id)?;
        let status = sink.push(item);

        let mut guard = self.shared.qlock.lock();
        let idx = guard.find_index(id).ok_or(MultiQueueError::UnknownHandle(id))?;
        let replay = guard.queues[idx].sticky.replay_order();
        guard.queues[idx].reset_after_flush();
        for marker in replay {
            let counter_id = self.shared.next_counter();
            guard.queues[idx].fifo.push_back(FifoEntry {
                item: marker,
                id: Some(counter_id),
            });
        }
        let wait = guard.queues[idx].wait.clone();
        guard.bump_epoch();
        wait.turn_cv.notify_all();
        info!(id, "FlushStop");
        Ok(status)
    }

    fn sink_for(&self, id: u32) -> Result<Arc<dyn DownstreamSink>, MultiQueueError> {
        self.sinks.lock().get(&id).cloned().ok_or(MultiQueueError::UnknownHandle(id))
    }

    /// Interleave computation, driven by the host once per producer-group
    /// scheduling tick (the core has no timer or wall-clock sync of its own).
    pub fn update_interleave(&self, producer_group: u32, cached_sink_times: &[(u32, i64)]) {
        self.shared.qlock.lock().update_interleave(producer_group, cached_sink_times);
    }

    /// Raises `min-interleave-time` to the
    /// pipeline's reported latency.
    pub fn on_latency_event(&self, latency_ns: u64) {
        self.shared.qlock.lock().on_latency_event(latency_ns);
    }

    /// Snapshots one stream's bookkeeping.
    pub fn stats(&self, id: u32) -> Option<QueueStats> {
        let guard = self.shared.qlock.lock();
        let idx = guard.find_index(id)?;
        let q = &guard.queues[idx];
        Some(QueueStats {
            id: q.id,
            group_id: q.group_id,
            items: q.fifo.cur_items(),
            bytes: q.fifo.cur_bytes(),
            time_ns: q.cur_time_ns(),
            is_eos: q.flags.is_eos,
            flow_status: q.flow_status,
        })
    }

    /// Whether every registered stream has reached a terminal flow status
    /// so the host can decide whether to tear the whole element down.
    pub fn all_terminal(&self) -> bool {
        self.shared.qlock.lock().all_terminal()
    }

    /// Sets a named property.
    pub fn set_property(&self, key: &str, value: PropertyValue) -> Result<(), MultiQueueError> {
        let _reconf = self.shared.reconf_lock.lock();
        let mut guard = self.shared.qlock.lock();

        macro_rules! expect_u64 {
            () => {
                match value {
                    PropertyValue::U64(v) => v,
                    _ => {
                        return Err(MultiQueueError::InvalidPropertyValue {
                            key: key.to_string(),
                            reason: "expected a u64".into(),
                        })
                    }
                }
            };
        }
        macro_rules! expect_u32 {
            () => {
                match value {
                    PropertyValue::U32(v) => v,
                    _ => {
                        return Err(MultiQueueError::InvalidPropertyValue {
                            key: key.to_string(),
                            reason: "expected a u32".into(),
                        })
                    }
                }
            };
        }
        macro_rules! expect_bool {
            () => {
                match value {
                    PropertyValue::Bool(v) => v,
                    _ => {
                        return Err(MultiQueueError::InvalidPropertyValue {
                            key: key.to_string(),
                            reason: "expected a bool".into(),
                        })
                    }
                }
            };
        }

        match key {
            "max-size-buffers" => guard.props.max_size.items = expect_u64!(),
            "max-size-bytes" => guard.props.max_size.bytes = expect_u64!(),
            "max-size-time" => guard.props.max_size.time_ns = expect_u64!(),
            "use-buffering" => guard.props.use_buffering = expect_bool!(),
            "low-watermark" => guard.props.low_watermark_ppm = expect_u32!(),
            "high-watermark" => guard.props.high_watermark_ppm = expect_u32!(),
            "sync-by-running-time" => guard.props.sync_by_running_time = expect_bool!(),
            "use-interleave" => guard.props.use_interleave = expect_bool!(),
            "min-interleave-time" => guard.props.min_interleave_ns = expect_u64!(),
            "unlinked-cache-time" => guard.props.unlinked_cache_time_ns = expect_u64!(),
            other => return Err(MultiQueueError::UnknownProperty(other.to_string())),
        }

        guard.bump_epoch();
        for q in guard.queues.iter() {
            q.wait.turn_cv.notify_all();
        }
        Ok(())
    }

    /// Reads a named property.
    pub fn get_property(&self, key: &str) -> Result<PropertyValue, MultiQueueError> {
        let guard = self.shared.qlock.lock();
        Ok(match key {
            "max-size-buffers" => PropertyValue::U64(guard.props.max_size.items),
            "max-size-bytes" => PropertyValue::U64(guard.props.max_size.bytes),
            "max-size-time" => PropertyValue::U64(guard.props.max_size.time_ns),
            "use-buffering" => PropertyValue::Bool(guard.props.use_buffering),
            "low-watermark" => PropertyValue::U32(guard.props.low_watermark_ppm),
            "high-watermark" => PropertyValue::U32(guard.props.high_watermark_ppm),
            "sync-by-running-time" => PropertyValue::Bool(guard.props.sync_by_running_time),
            "use-interleave" => PropertyValue::Bool(guard.props.use_interleave),
            "min-interleave-time" => PropertyValue::U64(guard.props.min_interleave_ns),
            "unlinked-cache-time" => PropertyValue::U64(guard.props.unlinked_cache_time_ns),
            other => return Err(MultiQueueError::UnknownProperty(other.to_string())),
        })
    }
}
