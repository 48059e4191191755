//! One stream's FIFO, segment state and scheduling cell.
//!
//! The scattered per-queue booleans (`is_eos`, `is_segment_done`,
//! `is_sparse`, `flushing`, `active`, `pushed`) are collapsed into
//! [`QueueFlags`], and the two condition
//! variables a worker/producer park on live behind an `Arc` so they can be
//! cloned out of a locked [`crate::core::CoreState`] guard before waiting
//! on them (parking_lot's `Condvar::wait` needs a `&mut MutexGuard`, which
//! would alias a borrow taken directly from inside that same guard).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Condvar;

use crate::bounded_queue::Fifo;
use crate::flow::FlowStatus;
use crate::item::{Item, MarkerKind, Segment};
use crate::properties::SizeLimits;
use crate::segment::SegmentState;

/// Sentinel used for `next_id`/`old_id`/`last_old_id` before any item has
/// been assigned an id. These are the monotonic tags used to order
/// cross-queue waits.
pub const UNSET_ID: u64 = u64::MAX;

/// Collapsed per-queue boolean state.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFlags {
    pub is_eos: bool,
    pub is_segment_done: bool,
    pub is_sparse: bool,
    pub flushing: bool,
    pub active: bool,
    pub pushed: bool,
    /// Draining without forwarding data after downstream EOS, until the
    /// FIFO empties.
    pub drop_mode: bool,
}

/// The most recent StreamStart/SegmentStart seen on the input side, kept so
/// they can be replayed downstream right after a `FlushStop`.
#[derive(Debug, Clone, Default)]
pub struct StickyMarkers {
    pub stream_start: Option<Arc<Item>>,
    pub segment_start: Option<Arc<Item>>,
}

impl StickyMarkers {
    pub fn observe(&mut self, item: &Arc<Item>) {
        match item.marker_kind() {
            Some(MarkerKind::StreamStart { .. }) => self.stream_start = Some(item.clone()),
            Some(MarkerKind::SegmentStart(_)) => self.segment_start = Some(item.clone()),
            _ => {}
        }
    }

    pub fn replay_order(&self) -> Vec<Arc<Item>> {
        [&self.stream_start, &self.segment_start]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// The pair of condition variables a [`QueueState`] parks producers and
/// workers on. See module docs for why this lives behind an `Arc` rather
/// than being waited on in place.
#[derive(Default)]
pub struct QueueWait {
    /// Parked on by: the worker's ordering decision, a producer blocked on
    /// FIFO capacity, and anyone waiting for `limits_changed`/wake-up-policy
    /// signals.
    pub turn_cv: Condvar,
    /// Parked on by a producer waiting for a serialized query's result.
    pub query_cv: Condvar,
}

/// One stream's complete scheduling cell.
pub struct QueueState {
    pub id: u32,
    pub group_id: u32,
    /// Producer-thread grouping used for per-thread interleave computation,
    /// provided by the caller at `request_input` time.
    pub producer_group: u32,

    pub fifo: Fifo,
    pub max_size: SizeLimits,

    pub sink_segment: SegmentState,
    pub src_segment: SegmentState,

    pub flow_status: FlowStatus,
    pub flags: QueueFlags,

    pub next_id: Option<u64>,
    pub old_id: Option<u64>,
    pub last_old_id: Option<u64>,

    pub next_time: Option<i64>,
    pub last_time: Option<i64>,

    pub group_high_time: Option<i64>,

    /// Producer-side running time of the most recently observed item
    /// (`sink_time`), and the first such value seen
    /// (`sink_start_time`), used to derive `cur_time_ns` and to feed
    /// interleave computation (`cached_sink_time`).
    pub sink_time: Option<i64>,
    pub sink_start_time: Option<i64>,
    pub cached_sink_time: Option<i64>,

    pub interleave_ns: u64,

    pub stream_group_id_in: Option<u32>,
    pub stream_group_id_out: Option<u32>,
    pub stream_group_changed: bool,

    pub sticky: StickyMarkers,

    /// Pending serialized query awaiting the worker's attention, and its
    /// result once handled.
    pub pending_query: Option<Arc<Item>>,
    pub query_result: Option<bool>,

    pub wait: Arc<QueueWait>,
}

impl QueueState {
    pub fn new(id: u32, group_id: u32, producer_group: u32, max_size: SizeLimits) -> Self {
        Self {
            id,
            group_id,
            producer_group,
            fifo: Fifo::new(),
            max_size,
            sink_segment: SegmentState::new(),
            src_segment: SegmentState::new(),
            flow_status: FlowStatus::Ok,
            flags: QueueFlags::default(),
            next_id: None,
            old_id: None,
            last_old_id: None,
            next_time: None,
            last_time: None,
            group_high_time: None,
            sink_time: None,
            sink_start_time: None,
            cached_sink_time: None,
            interleave_ns: 0,
            stream_group_id_in: None,
            stream_group_id_out: None,
            stream_group_changed: false,
            sticky: StickyMarkers::default(),
            pending_query: None,
            query_result: None,
            wait: Arc::new(QueueWait::default()),
        }
    }

    /// Buffered-time difference: input-side running time minus output-side
    /// running time, always clamped to be non-negative.
    pub fn cur_time_ns(&self) -> u64 {
        self.fifo.cur_time_ns()
    }

    pub fn set_cur_time_ns(&mut self, ns: i64) {
        self.fifo.set_cur_time_ns(ns.max(0) as u64);
    }

    /// `buffering_level`, scaled to `[0, BUFFERING_LEVEL_SCALE]`.
    pub fn buffering_level(&self) -> u64 {
        use crate::properties::BUFFERING_LEVEL_SCALE;

        if self.flow_status == FlowStatus::NotLinked
            || self.flags.is_eos
            || self.flags.is_segment_done
            || self.flags.is_sparse
        {
            return BUFFERING_LEVEL_SCALE;
        }

        let bytes_ratio = if self.max_size.bytes_enabled() {
            (self.fifo.cur_bytes() as f64 / self.max_size.bytes as f64).min(1.0)
        } else {
            0.0
        };
        let time_ratio = if self.max_size.time_enabled() {
            (self.cur_time_ns() as f64 / self.max_size.time_ns as f64).min(1.0)
        } else {
            0.0
        };

        (bytes_ratio.max(time_ratio) * BUFFERING_LEVEL_SCALE as f64) as u64
    }

    pub fn is_full_by_items(&self) -> bool {
        self.max_size.items_enabled() && self.fifo.cur_items() >= self.max_size.items
    }

    pub fn is_full_by_bytes(&self) -> bool {
        self.max_size.bytes_enabled() && self.fifo.cur_bytes() >= self.max_size.bytes
    }

    /// Time-axis fullness. Sparse streams never contribute to the "full by
    /// time" check.
    pub fn is_full_by_time(&self, unlinked_cache_time_ns: u64) -> bool {
        if self.flags.is_sparse || !self.max_size.time_enabled() {
            return false;
        }
        let cur = self.cur_time_ns();
        if cur >= self.max_size.time_ns {
            return true;
        }
        if self.flow_status == FlowStatus::NotLinked {
            return cur.saturating_sub(unlinked_cache_time_ns) >= self.max_size.time_ns;
        }
        false
    }

    /// The capacity check callback: `true` means a non-forced push must
    /// block.
    pub fn is_full(&self, use_buffering: bool, unlinked_cache_time_ns: u64) -> bool {
        if self.flags.is_eos || self.flags.is_segment_done {
            return true;
        }
        if !use_buffering && self.is_full_by_items() {
            return true;
        }
        if self.is_full_by_bytes() {
            return true;
        }
        self.is_full_by_time(unlinked_cache_time_ns)
    }

    /// Updates `sink_time`/`sink_start_time`/`cached_sink_time` from a
    /// producer-side position, and derives `cur_time_ns` as the buffered
    /// running-time span between the input side and the last item the
    /// worker pushed downstream (the buffered time difference, input-side
    /// minus output-side).
    pub fn observe_sink_time(&mut self, running_time: i64) {
        self.sink_time = Some(running_time);
        if self.sink_start_time.is_none() {
            self.sink_start_time = Some(running_time);
        }
        self.cached_sink_time = Some(running_time);
        self.recompute_cur_time();
    }

    pub fn recompute_cur_time(&mut self) {
        let Some(sink_t) = self.sink_time else {
            return;
        };
        let baseline = self.last_time.or(self.sink_start_time).unwrap_or(sink_t);
        self.set_cur_time_ns(sink_t - baseline);
    }

    /// Resets scheduling counters on FlushStop, but leaves sticky markers
    /// and id allocation untouched (ids remain globally monotonic;
    /// `group_high_time` is reset to undefined).
    pub fn reset_after_flush(&mut self) {
        self.fifo.flush();
        self.next_id = None;
        self.old_id = None;
        self.last_old_id = None;
        self.next_time = None;
        self.last_time = None;
        self.group_high_time = None;
        self.sink_time = None;
        self.sink_start_time = None;
        self.cached_sink_time = None;
        self.flags.flushing = false;
        self.flags.drop_mode = false;
        self.flags.pushed = false;
        self.flow_status = FlowStatus::Ok;
    }
}

/// Allocates strictly-increasing, stable queue ids: unique, strictly
/// increasing at allocation, and stable thereafter.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
        }
    }

    pub fn alloc(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Ensures a later id is never reused by an explicit-id request.
    pub fn observe(&self, id: u32) {
        self.next.fetch_max(id + 1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffering_level_is_max_when_not_linked() {
        let mut q = QueueState::new(0, 0, 0, SizeLimits { items: 10, bytes: 100, time_ns: 0 });
        q.flow_status = FlowStatus::NotLinked;
        assert_eq!(q.buffering_level(), crate::properties::BUFFERING_LEVEL_SCALE);
    }

    #[test]
    fn buffering_level_scales_with_bytes() {
        let mut q = QueueState::new(0, 0, 0, SizeLimits { items: 0, bytes: 100, time_ns: 0 });
        for _ in 0..5 {
            q.fifo.push_back(crate::bounded_queue::FifoEntry {
                item: Item::data(10, None, None),
                id: Some(1),
            });
        }
        assert_eq!(q.buffering_level(), crate::properties::BUFFERING_LEVEL_SCALE / 2);
    }

    #[test]
    fn sticky_markers_replay_in_order() {
        let mut sticky = StickyMarkers::default();
        sticky.observe(&Item::marker(MarkerKind::SegmentStart(Segment::new())));
        sticky.observe(&Item::marker(MarkerKind::StreamStart {
            group_id: None,
            sparse: false,
        }));
        let replay = sticky.replay_order();
        assert_eq!(replay.len(), 2);
        assert!(matches!(
            replay[0].marker_kind(),
            Some(MarkerKind::StreamStart { .. })
        ));
    }
}
