//! Running-time math over a timing segment.
//!
//! Running time is segment-relative and wall-clock-free: it answers "how
//! far into this logical stream is this position", independent of when the
//! pipeline actually ran. The host owns clock sync; this module only does
//! the segment arithmetic a `to_running_time` utility would perform.

use crate::item::Segment;

/// Per-side (sink or src) segment tracking for one [`crate::SingleQueue`].
///
/// A queue owns two independent `SegmentState`s — one advanced by the
/// producer thread as items arrive (`sink_segment`), one advanced by the
/// worker thread as items are pushed downstream (`src_segment`) — so that
/// `cur_time_ns` can be computed as the difference between
/// input-side and output-side running time without the two sides
/// contending on a shared mutable segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentState {
    segment: Segment,
    /// Set when the segment's base needs recomputation against the
    /// previous segment's last position (stream-group rebasing on a new
    /// SegmentStart).
    tainted: bool,
}

impl SegmentState {
    pub fn new() -> Self {
        Self {
            segment: Segment::new(),
            tainted: false,
        }
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn set_segment(&mut self, segment: Segment) {
        self.segment = segment;
        self.tainted = false;
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn taint(&mut self) {
        self.tainted = true;
    }

    pub fn clear_taint(&mut self) {
        self.tainted = false;
    }

    /// Advance `position` by a span (used by Gap handling).
    pub fn advance_position(&mut self, span_ns: i64) {
        self.segment.position += span_ns;
        self.taint();
    }

    /// Rebase `base` to the running time the previous segment had reached
    /// at its last position, so the new segment continues seamlessly
    /// (stream-group continuity across a SegmentStart).
    pub fn rebase_onto(&mut self, previous: &SegmentState) {
        if let Some(running_time) = previous.to_running_time(previous.segment.position) {
            self.segment.base = running_time;
        }
    }

    /// `running_time = (position - start) * rate + base`, signed so the
    /// direction of playback (rate's sign) is preserved. Returns `None`
    /// when `position` falls outside `[start, stop)` under the segment's
    /// rate sign — callers should treat that as "undefined running time"
    /// (undefined running time, as for non-timed markers).
    pub fn to_running_time(&self, position: i64) -> Option<i64> {
        self.position_to_running_time(&self.segment, position)
    }

    fn position_to_running_time(&self, segment: &Segment, position: i64) -> Option<i64> {
        if segment.rate == 0.0 {
            return None;
        }
        if position < segment.start {
            return None;
        }
        if let Some(stop) = segment.stop {
            if segment.rate > 0.0 && position > stop {
                return None;
            }
        }
        let offset = (position - segment.start) as f64 * segment.rate;
        Some(segment.base + offset.round() as i64)
    }

    /// Running time at the end of an item (`position + duration`), used to
    /// update `last_time` after a push.
    pub fn to_running_time_end(&self, position: i64, duration_ns: Option<i64>) -> Option<i64> {
        match duration_ns {
            Some(d) => self.to_running_time(position + d),
            None => self.to_running_time(position),
        }
    }

    pub fn position(&self) -> i64 {
        self.segment.position
    }

    pub fn set_position(&mut self, position: i64) {
        self.segment.position = position;
    }
}

impl Default for SegmentState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_time_forward() {
        let mut s = SegmentState::new();
        s.set_segment(Segment {
            rate: 1.0,
            start: 0,
            stop: None,
            position: 0,
            base: 0,
        });
        assert_eq!(s.to_running_time(100), Some(100));
        assert_eq!(s.to_running_time(0), Some(0));
    }

    #[test]
    fn running_time_before_start_is_undefined() {
        let mut s = SegmentState::new();
        s.set_segment(Segment {
            rate: 1.0,
            start: 1_000,
            stop: None,
            position: 1_000,
            base: 0,
        });
        assert_eq!(s.to_running_time(500), None);
    }

    #[test]
    fn rebase_continues_from_previous_segment() {
        let mut prev = SegmentState::new();
        prev.set_segment(Segment {
            rate: 1.0,
            start: 0,
            stop: None,
            position: 500,
            base: 0,
        });

        let mut next = SegmentState::new();
        next.set_segment(Segment {
            rate: 1.0,
            start: 0,
            stop: None,
            position: 0,
            base: 0,
        });
        next.rebase_onto(&prev);

        assert_eq!(next.to_running_time(0), Some(500));
    }

    #[test]
    fn double_rate_scales_running_time() {
        let mut s = SegmentState::new();
        s.set_segment(Segment {
            rate: 2.0,
            start: 0,
            stop: None,
            position: 0,
            base: 0,
        });
        assert_eq!(s.to_running_time(100), Some(200));
    }
}
