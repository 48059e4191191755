//! `qlock`-guarded cross-queue state: the registry, global frontiers,
//! buffering-level bookkeeping and interleave computation.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::flow::FlowStatus;
use crate::properties::Properties;
use crate::single_queue::QueueState;

/// Everything guarded by the single `qlock`: the ordered
/// queue registry, the global monotonic frontiers used to order unlinked
/// streams against linked ones, and the buffering/interleave aggregates.
///
/// A monotonic `epoch` is bumped on every change a parked worker or
/// producer might need to re-check: rather
/// than modeling each predicate as its own flag, waiters simply loop,
/// re-evaluate their own predicate, and rely on `notify_all` to be woken
/// whenever `epoch` could plausibly have moved their predicate.
pub struct CoreState {
    pub queues: Vec<QueueState>,
    pub props: Properties,

    pub high_id: Option<u64>,
    pub high_time: Option<i64>,
    pub numwaiting: u32,

    pub buffering: bool,
    pub buffering_percent: u8,
    pub buffering_percent_changed: bool,

    pub other_interleave_by_group: HashMap<u32, u64>,
    pub last_interleave_update_ns: u64,
    pub interleave_incomplete: bool,

    pub epoch: u64,
}

impl CoreState {
    pub fn new(props: Properties) -> Self {
        Self {
            queues: Vec::new(),
            props,
            high_id: None,
            high_time: None,
            numwaiting: 0,
            buffering: false,
            buffering_percent: 0,
            buffering_percent_changed: false,
            other_interleave_by_group: HashMap::new(),
            last_interleave_update_ns: 0,
            interleave_incomplete: false,
            epoch: 0,
        }
    }

    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    pub fn find_index(&self, id: u32) -> Option<usize> {
        self.queues.iter().position(|q| q.id == id)
    }

    /// `high_id`: the largest `old_id` across streams whose
    /// `flow_status != NotLinked` and which have not signalled EOS; or, if
    /// every considered stream is unlinked, the lowest `next_id` among
    /// waiting unlinked streams.
    pub fn recompute_high_id(&mut self) {
        let mut linked_max: Option<u64> = None;
        let mut unlinked_min_next: Option<u64> = None;

        for q in &self.queues {
            if q.flags.is_eos {
                continue;
            }
            if q.flow_status != FlowStatus::NotLinked {
                if let Some(old) = q.old_id {
                    linked_max = Some(linked_max.map_or(old, |m: u64| m.max(old)));
                }
            } else if let Some(next) = q.next_id {
                unlinked_min_next = Some(unlinked_min_next.map_or(next, |m: u64| m.min(next)));
            }
        }

        self.high_id = linked_max.or(unlinked_min_next);
        trace!(high_id = ?self.high_id, "recompute_high_id");
        self.bump_epoch();
    }

    /// `high_time`, computed the same way as `high_id` but
    /// over running-time (`last_time`/`next_time`) instead of ids, and only
    /// meaningful when `sync_by_running_time` is set.
    pub fn recompute_high_time(&mut self) {
        if !self.props.sync_by_running_time {
            return;
        }
        let mut linked_max: Option<i64> = None;
        let mut unlinked_min_next: Option<i64> = None;

        for q in &self.queues {
            if q.flags.is_eos {
                continue;
            }
            if q.flow_status != FlowStatus::NotLinked {
                if let Some(t) = q.last_time {
                    linked_max = Some(linked_max.map_or(t, |m| m.max(t)));
                }
            } else if let Some(t) = q.next_time {
                unlinked_min_next = Some(unlinked_min_next.map_or(t, |m| m.min(t)));
            }
        }

        self.high_time = linked_max.or(unlinked_min_next);
        trace!(high_time = ?self.high_time, "recompute_high_time");
        self.bump_epoch();
    }

    /// `group_high_time`, restricted to queues sharing `group_id`; falls
    /// back to the global `high_time` when the group has fewer than two
    /// members.
    pub fn recompute_group_high_time(&mut self, group_id: u32) {
        if !self.props.sync_by_running_time {
            return;
        }
        let members: Vec<usize> = self
            .queues
            .iter()
            .enumerate()
            .filter(|(_, q)| q.group_id == group_id)
            .map(|(i, _)| i)
            .collect();

        let value = if members.len() < 2 {
            self.high_time
        } else {
            let mut linked_max: Option<i64> = None;
            let mut unlinked_min_next: Option<i64> = None;
            for &i in &members {
                let q = &self.queues[i];
                if q.flags.is_eos {
                    continue;
                }
                if q.flow_status != FlowStatus::NotLinked {
                    if let Some(t) = q.last_time {
                        linked_max = Some(linked_max.map_or(t, |m| m.max(t)));
                    }
                } else if let Some(t) = q.next_time {
                    unlinked_min_next = Some(unlinked_min_next.map_or(t, |m| m.min(t)));
                }
            }
            linked_max.or(unlinked_min_next).or(self.high_time)
        };

        for &i in &members {
            self.queues[i].group_high_time = value;
        }
    }

    /// Buffering-level transition rules. Returns `true` if
    /// the buffering state (on/off or percent) changed.
    pub fn recompute_buffering(&mut self) -> bool {
        if !self.props.use_buffering || self.queues.is_empty() {
            return false;
        }

        let levels: Vec<u64> = self.queues.iter().map(|q| q.buffering_level()).collect();
        let high = self.props.high_watermark_ppm as u64;
        let low = self.props.low_watermark_ppm as u64;

        let mut changed = false;

        if self.buffering {
            if levels.iter().any(|&l| l >= high) {
                self.buffering = false;
                changed = true;
                debug!("exiting buffering");
            }
        } else if levels.iter().all(|&l| l < high) && levels.iter().any(|&l| l < low) {
            self.buffering = true;
            changed = true;
            debug!("entering buffering");
        }

        let max_level = levels.iter().copied().max().unwrap_or(0);
        let percent = if high == 0 {
            100
        } else {
            ((max_level * 100) / high).min(100) as u8
        };
        if percent != self.buffering_percent {
            self.buffering_percent = percent;
            changed = true;
        }

        if changed {
            self.buffering_percent_changed = true;
        }
        changed
    }

    pub fn take_buffering_percent(&mut self) -> Option<u8> {
        if self.buffering_percent_changed {
            self.buffering_percent_changed = false;
            Some(self.buffering_percent)
        } else {
            None
        }
    }

    /// Whether every registered queue has reached a terminal flow status;
    /// a supplemented convenience the host can poll to decide whether the
    /// whole element should tear down.
    pub fn all_terminal(&self) -> bool {
        !self.queues.is_empty() && self.queues.iter().all(|q| q.flow_status.is_terminal() || q.flags.is_eos)
    }

    /// Signals the `turn_cv` of every `NotLinked` queue whose parking
    /// predicate is no longer satisfied.
    /// Returns the ids woken, for logging/testing.
    pub fn wake_unlinked_if_unblocked(&mut self) -> Vec<u32> {
        let mut woken = Vec::new();
        for q in &self.queues {
            if q.flow_status != FlowStatus::NotLinked {
                continue;
            }
            let still_blocked = if self.props.sync_by_running_time {
                match q.next_time {
                    Some(t) => {
                        let frontier = q.group_high_time.or(self.high_time);
                        frontier.is_some_and(|f| t > f)
                    }
                    None => false,
                }
            } else {
                match q.next_id {
                    Some(id) => self.high_id.is_some_and(|h| id > h),
                    None => false,
                }
            };
            if !still_blocked {
                q.wait.turn_cv.notify_all();
                woken.push(q.id);
            }
        }
        if !woken.is_empty() {
            trace!(?woken, "wake_unlinked_if_unblocked");
        }
        woken
    }

    /// Grow-to-avoid-deadlock rule: when `queue_id` overran
    /// its item cap, scan other queues for one that is empty, non-sparse
    /// and linked; if found, raise `queue_id`'s item cap by one and return
    /// `true`.
    pub fn try_grow_for_overrun(&mut self, queue_id: u32) -> bool {
        let Some(idx) = self.find_index(queue_id) else {
            return false;
        };
        if self.queues[idx].flags.is_eos {
            return false;
        }

        let starving = self.queues.iter().enumerate().any(|(i, q)| {
            i != idx && q.fifo.is_empty() && !q.flags.is_sparse && q.flow_status != FlowStatus::NotLinked
        });

        if starving {
            let q = &mut self.queues[idx];
            let new_cap = q.fifo.cur_items() + 1;
            q.max_size.items = q.max_size.items.max(new_cap);
            debug!(queue_id, new_cap, "grow_for_overrun");
            q.wait.turn_cv.notify_all();
            self.bump_epoch();
            true
        } else {
            false
        }
    }

    /// Underrun rule: `queue_id` just became empty; raise
    /// the item cap of every *other* queue that is currently full at the
    /// item axis. Returns `true` if every queue is now empty (caller should
    /// emit "underrun").
    pub fn relieve_on_underrun(&mut self, queue_id: u32) -> bool {
        let others: Vec<usize> = (0..self.queues.len())
            .filter(|&i| self.queues[i].id != queue_id)
            .collect();

        for i in others {
            if self.queues[i].is_full_by_items() {
                let new_cap = self.queues[i].fifo.cur_items() + 1;
                self.queues[i].max_size.items = self.queues[i].max_size.items.max(new_cap);
                debug!(queue_id = self.queues[i].id, new_cap, "relieve_on_underrun");
                self.queues[i].wait.turn_cv.notify_all();
            }
        }
        self.bump_epoch();
        self.queues.iter().all(|q| q.fifo.is_empty())
    }

    /// Interleave computation for one producer group.
    /// `cached_sink_times` is the caller-supplied snapshot of each active,
    /// non-sparse queue's latest sink-side running time.
    pub fn update_interleave(&mut self, producer_group: u32, cached_sink_times: &[(u32, i64)]) {
        if !self.props.use_interleave {
            return;
        }

        let member_ids: Vec<u32> = self
            .queues
            .iter()
            .filter(|q| q.producer_group == producer_group)
            .map(|q| q.id)
            .collect();

        let all_active = member_ids
            .iter()
            .all(|id| self.queues.iter().find(|q| q.id == *id).is_some_and(|q| q.flags.active));

        let (low, high) = cached_sink_times
            .iter()
            .map(|(_, t)| *t)
            .fold((i64::MAX, i64::MIN), |(lo, hi), t| (lo.min(t), hi.max(t)));

        let other_interleave = self
            .other_interleave_by_group
            .iter()
            .filter(|(g, _)| **g != producer_group)
            .map(|(_, v)| *v)
            .max()
            .unwrap_or(0);

        let min_interleave = self.props.min_interleave_ns;

        let computed = if cached_sink_times.is_empty() {
            min_interleave.max(other_interleave)
        } else {
            let spread = ((high - low).max(0) as f64 * 1.5) as u64 + min_interleave;
            spread.max(other_interleave)
        };

        let current = self
            .queues
            .iter()
            .find(|q| q.producer_group == producer_group)
            .map(|q| q.interleave_ns)
            .unwrap_or(0);

        if !all_active {
            // Grow progressively by 500ms per update, capped at 5s, until
            // every stream in the group has buffered input.
            let grown = (current + 500_000_000).min(5_000_000_000);
            self.apply_group_interleave(producer_group, grown);
            self.interleave_incomplete = true;
            return;
        }
        self.interleave_incomplete = false;

        let should_update = cached_sink_times.is_empty()
            || computed > current
            || (computed < current
                && self.last_interleave_update_ns >= 2 * current.min(1_000_000_000)
                && computed < (current * 3) / 4);

        if should_update {
            self.apply_group_interleave(producer_group, computed);
        }
    }

    fn apply_group_interleave(&mut self, producer_group: u32, value: u64) {
        debug!(producer_group, value, "apply_group_interleave");
        for q in self.queues.iter_mut().filter(|q| q.producer_group == producer_group) {
            q.interleave_ns = value;
            q.max_size.time_ns = value;
            q.wait.turn_cv.notify_all();
        }
        self.other_interleave_by_group.insert(producer_group, value);
        self.bump_epoch();
    }

    /// Raise `min_interleave_ns` on an incoming latency event.
    pub fn on_latency_event(&mut self, latency_ns: u64) {
        if latency_ns > self.props.min_interleave_ns {
            self.props.min_interleave_ns = latency_ns;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::SizeLimits;

    fn new_queue(core: &mut CoreState, id: u32, group_id: u32) {
        core.queues.push(QueueState::new(
            id,
            group_id,
            0,
            SizeLimits { items: 10, bytes: 0, time_ns: 0 },
        ));
    }

    #[test]
    fn high_id_uses_linked_max() {
        let mut core = CoreState::new(Properties::default());
        new_queue(&mut core, 0, 0);
        new_queue(&mut core, 1, 0);
        core.queues[0].old_id = Some(5);
        core.queues[1].old_id = Some(9);
        core.recompute_high_id();
        assert_eq!(core.high_id, Some(9));
    }

    #[test]
    fn high_id_falls_back_to_unlinked_min_next() {
        let mut core = CoreState::new(Properties::default());
        new_queue(&mut core, 0, 0);
        core.queues[0].flow_status = FlowStatus::NotLinked;
        core.queues[0].next_id = Some(42);
        core.recompute_high_id();
        assert_eq!(core.high_id, Some(42));
    }

    #[test]
    fn grow_for_overrun_only_when_other_queue_starves() {
        let mut core = CoreState::new(Properties::default());
        new_queue(&mut core, 0, 0);
        new_queue(&mut core, 1, 0);
        assert!(!core.try_grow_for_overrun(0));

        core.queues[1].flow_status = FlowStatus::Ok;
        assert!(core.try_grow_for_overrun(0));
        assert_eq!(core.queues[0].max_size.items, 1);
    }

    #[test]
    fn sparse_queue_never_triggers_growth() {
        let mut core = CoreState::new(Properties::default());
        new_queue(&mut core, 0, 0);
        new_queue(&mut core, 1, 0);
        core.queues[1].flags.is_sparse = true;
        assert!(!core.try_grow_for_overrun(0));
    }

    #[test]
    fn buffering_hysteresis() {
        let mut props = Properties::default().with_use_buffering(true).with_watermarks_ppm(100_000, 900_000);
        props.max_size = SizeLimits { items: 0, bytes: 1000, time_ns: 0 };
        let mut core = CoreState::new(props);
        core.queues.push(QueueState::new(0, 0, 0, core.props.max_size));

        assert!(!core.buffering);
        for _ in 0..5 {
            core.queues[0].fifo.push_back(crate::bounded_queue::FifoEntry {
                item: crate::item::Item::data(10, None, None),
                id: Some(1),
            });
        }
        core.recompute_buffering();
        assert!(core.buffering);

        for _ in 0..90 {
            core.queues[0].fifo.push_back(crate::bounded_queue::FifoEntry {
                item: crate::item::Item::data(10, None, None),
                id: Some(1),
            });
        }
        core.recompute_buffering();
        assert!(!core.buffering);
    }
}
