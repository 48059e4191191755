//! The opaque item model the core schedules around.
//!
//! Nothing in this module knows how to decode, render or otherwise
//! interpret an item's payload; only the attributes the scheduler reads
//! (size, timestamp, marker sub-kind) are modeled. Concrete payload types
//! are the host's concern: items are opaque to the scheduling core.

use std::sync::Arc;

/// A segment describes how raw positions map to running time, the way a
/// playback segment does in a media pipeline: `running_time = (position -
/// start) * rate + base`, with `rate`'s sign giving the direction of
/// playback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub rate: f64,
    pub start: i64,
    pub stop: Option<i64>,
    pub position: i64,
    pub base: i64,
}

impl Segment {
    pub fn new() -> Self {
        Self {
            rate: 1.0,
            start: 0,
            stop: None,
            position: 0,
            base: 0,
        }
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::new()
    }
}

/// Sub-kind of a [`ItemKind::Marker`] item.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerKind {
    StreamStart {
        group_id: Option<u32>,
        sparse: bool,
    },
    SegmentStart(Segment),
    Gap {
        timestamp_ns: i64,
        duration_ns: Option<i64>,
    },
    SegmentDone,
    EndOfStream,
    FlushStart,
    FlushStop,
    /// A marker the host wants queued and ordered like data (e.g. a Caps
    /// event) but whose sub-kind the core does not otherwise act on.
    OtherSerialized,
    /// Bypasses the queue entirely.
    OtherNonSerialized,
}

impl MarkerKind {
    pub fn is_serialized(&self) -> bool {
        !matches!(self, MarkerKind::OtherNonSerialized)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub serialized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Data,
    Marker(MarkerKind),
    Query(Query),
}

/// One item flowing through a [`crate::SingleQueue`].
///
/// `timestamp`/`duration` are in nanoseconds, buffer-local (i.e. not yet
/// mapped through a segment into running time; that mapping is the
/// worker's job, see [`crate::segment::SegmentState::to_running_time`]).
#[derive(Debug, Clone)]
pub struct Item {
    pub kind: ItemKind,
    pub size_bytes: u64,
    pub timestamp_ns: Option<i64>,
    pub duration_ns: Option<i64>,
}

impl Item {
    pub fn data(size_bytes: u64, timestamp_ns: Option<i64>, duration_ns: Option<i64>) -> Arc<Self> {
        Arc::new(Self {
            kind: ItemKind::Data,
            size_bytes,
            timestamp_ns,
            duration_ns,
        })
    }

    pub fn marker(kind: MarkerKind) -> Arc<Self> {
        // Gap carries its own timing; surface it on the outer fields so the
        // ordinary timestamp-driven bookkeeping in `enqueue()` sees it too.
        let (timestamp_ns, duration_ns) = match &kind {
            MarkerKind::Gap { timestamp_ns, duration_ns } => (Some(*timestamp_ns), *duration_ns),
            _ => (None, None),
        };
        Arc::new(Self {
            kind,
            size_bytes: 0,
            timestamp_ns,
            duration_ns,
        })
    }

    pub fn query(serialized: bool) -> Arc<Self> {
        Arc::new(Self {
            kind: ItemKind::Query(Query { serialized }),
            size_bytes: 0,
            timestamp_ns: None,
            duration_ns: None,
        })
    }

    pub fn is_data(&self) -> bool {
        matches!(self.kind, ItemKind::Data)
    }

    pub fn marker_kind(&self) -> Option<&MarkerKind> {
        match &self.kind {
            ItemKind::Marker(m) => Some(m),
            _ => None,
        }
    }

    /// Whether this item should be force-pushed, bypassing capacity: Gap
    /// and SegmentStart carry control information the scheduler cannot
    /// afford to block on.
    pub fn bypasses_capacity(&self) -> bool {
        matches!(
            self.kind,
            ItemKind::Marker(MarkerKind::Gap { .. }) | ItemKind::Marker(MarkerKind::SegmentStart(_))
        )
    }

    /// Whether a sticky-marker cache should remember this item across a
    /// flush (StreamStart, SegmentStart).
    pub fn is_sticky(&self) -> bool {
        matches!(
            self.kind,
            ItemKind::Marker(MarkerKind::StreamStart { .. }) | ItemKind::Marker(MarkerKind::SegmentStart(_))
        )
    }
}
