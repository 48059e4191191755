//! The per-queue worker thread: pop, classify, order, push.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, trace};

use crate::bounded_queue::FifoEntry;
use crate::flow::{DownstreamSink, FlowStatus};
use crate::item::{Item, ItemKind, MarkerKind};
use crate::shared::MultiQueueShared;

/// What the worker loop should do with a freshly popped entry.
enum PopOutcome {
    Item(FifoEntry),
    /// The queue was removed (`release_input`); the thread should exit.
    Removed,
}

/// Blocking pop: waits for an item or removal.
///
/// `FlushStart`/`FlushStop` are handled synchronously on the producer
/// thread, returning immediately on the producer side, and never pass
/// through the FIFO, so a flushing queue looks just like an
/// empty one to the worker — it parks here until `FlushStop` both clears
/// `flags.flushing` and wakes `turn_cv`.
fn pop_for_worker(shared: &MultiQueueShared, queue_id: u32) -> PopOutcome {
    let mut guard = shared.qlock.lock();
    loop {
        let Some(idx) = guard.find_index(queue_id) else {
            return PopOutcome::Removed;
        };
        if !guard.queues[idx].flags.flushing {
            if let Some(entry) = guard.queues[idx].fifo.pop_front() {
                let became_empty = guard.queues[idx].fifo.is_empty();
                if became_empty {
                    let all_empty = guard.relieve_on_underrun(queue_id);
                    if all_empty {
                        shared.emit_underrun();
                    }
                }
                // A pop can free capacity a parked producer is waiting on
                // even when the queue doesn't go fully empty.
                guard.queues[idx].wait.turn_cv.notify_all();
                return PopOutcome::Item(entry);
            }
        }
        let wait = guard.queues[idx].wait.clone();
        trace!(queue_id, "worker parking (empty or flushing)");
        wait.turn_cv.wait(&mut guard);
    }
}

/// The ordering decision under `qlock`. Returns
/// `false` if the worker should abandon this item (queue started flushing
/// or was removed while parked).
fn ordering_decision(shared: &MultiQueueShared, queue_id: u32, entry: &FifoEntry, sync_by_running_time: bool) -> bool {
    let mut guard = shared.qlock.lock();
    let Some(idx) = guard.find_index(queue_id) else {
        return false;
    };

    let new_id = entry.id;
    let next_time = running_time_of(&mut guard.queues[idx], entry, false);

    let needs_reorder = {
        let q = &guard.queues[idx];
        q.flow_status == FlowStatus::NotLinked
            || q.last_old_id.is_none()
            || new_id.is_some_and(|id| q.last_old_id.is_some_and(|last| id != last + 1))
            || q.last_old_id.zip(guard.high_id).is_some_and(|(last, hi)| last > hi)
    };

    if !needs_reorder {
        return true;
    }

    // step a/b: publish next_id/next_time, carry last_old_id into old_id.
    {
        let q = &mut guard.queues[idx];
        q.next_id = new_id;
        q.next_time = if q.flow_status == FlowStatus::NotLinked {
            next_time.map(|t| t + guard.props.unlinked_cache_time_ns as i64)
        } else {
            next_time
        };
        if let Some(last) = q.last_old_id {
            q.old_id = Some(last);
        }
    }

    let group_id = guard.queues[idx].group_id;
    let is_unlinked = guard.queues[idx].flow_status == FlowStatus::NotLinked;

    if is_unlinked {
        guard.recompute_high_id();
        if sync_by_running_time {
            guard.recompute_high_time();
            guard.recompute_group_high_time(group_id);
        }

        loop {
            let should_wait = {
                let q = &guard.queues[idx];
                if q.flags.flushing {
                    false
                } else if sync_by_running_time {
                    match q.next_time {
                        Some(t) => {
                            let frontier = q.group_high_time.or(guard.high_time);
                            frontier.map_or(true, |f| t > f)
                        }
                        None => false,
                    }
                } else {
                    q.next_id.zip(guard.high_id).is_some_and(|(id, hi)| id > hi)
                }
            };

            if guard.queues[idx].flags.flushing {
                guard.queues[idx].next_id = None;
                guard.queues[idx].next_time = None;
                return false;
            }
            if !should_wait {
                break;
            }

            guard.numwaiting += 1;
            let wait = guard.queues[idx].wait.clone();
            trace!(queue_id, "parking unlinked worker awaiting its turn");
            wait.turn_cv.wait(&mut guard);
            guard.numwaiting -= 1;

            if guard.find_index(queue_id).is_none() {
                return false;
            }
        }
    } else {
        // linked but out of order: recompute frontiers, wake other
        // unlinked workers, never park ourselves.
        guard.recompute_high_id();
        if sync_by_running_time {
            guard.recompute_high_time();
            guard.recompute_group_high_time(group_id);
        }
        guard.wake_unlinked_if_unblocked();
    }

    let q = &mut guard.queues[idx];
    q.next_id = None;
    q.next_time = None;
    true
}

fn running_time_of(q: &mut crate::single_queue::QueueState, entry: &FifoEntry, end: bool) -> Option<i64> {
    let pos = entry.item.timestamp_ns?;
    if end {
        q.src_segment.to_running_time_end(pos, entry.item.duration_ns)
    } else {
        q.src_segment.to_running_time(pos)
    }
}

/// The worker's per-item handling once it has the go-ahead to push.
fn handle_item(
    shared: &MultiQueueShared,
    queue_id: u32,
    entry: FifoEntry,
    sink: &dyn DownstreamSink,
    sync_by_running_time: bool,
) -> bool {
    // step 6: pre-push bookkeeping.
    let last_time = {
        let mut guard = shared.qlock.lock();
        let Some(idx) = guard.find_index(queue_id) else {
            return false;
        };
        let t = running_time_of(&mut guard.queues[idx], &entry, true);
        if let Some(t) = t {
            guard.queues[idx].last_time = Some(t);
            let advanced = guard.high_time.map_or(true, |h| t > h);
            if sync_by_running_time && advanced {
                guard.recompute_high_time();
                let gid = guard.queues[idx].group_id;
                guard.recompute_group_high_time(gid);
                guard.wake_unlinked_if_unblocked();
            }
        }
        t
    };
    let _ = last_time;

    // A SegmentStart is the boundary a dropping queue resumes forwarding
    // at, the same way it bypasses capacity on the producer side.
    let is_segment_start = matches!(entry.item.marker_kind(), Some(MarkerKind::SegmentStart(_)));

    let dropping = {
        let mut guard = shared.qlock.lock();
        let Some(idx) = guard.find_index(queue_id) else {
            return false;
        };
        if guard.queues[idx].flags.drop_mode {
            if is_segment_start {
                guard.queues[idx].flags.drop_mode = false;
                debug!(queue_id, "resuming forwarding on segment boundary");
                false
            } else {
                true
            }
        } else {
            false
        }
    };

    handle_marker_side_effects(shared, queue_id, &entry.item);

    if dropping {
        // Downstream already said EOS; keep draining without forwarding so
        // the producer never blocks on capacity, and commit our own EOS
        // once the backlog is gone.
        let mut guard = shared.qlock.lock();
        let Some(idx) = guard.find_index(queue_id) else {
            return false;
        };
        guard.queues[idx].last_old_id = entry.id;
        if guard.queues[idx].fifo.is_empty() {
            guard.queues[idx].flags.is_eos = true;
            info!(queue_id, "drop-mode queue drained, committing EOS");
        }
        return true;
    }

    // step 7: push downstream.
    let status = match &entry.item.kind {
        ItemKind::Query(_) => {
            let ok = sink.push_query(entry.item.clone());
            let mut guard = shared.qlock.lock();
            if let Some(idx) = guard.find_index(queue_id) {
                guard.queues[idx].query_result = Some(ok);
                let wait = guard.queues[idx].wait.clone();
                wait.query_cv.notify_all();
            }
            FlowStatus::Ok
        }
        _ => sink.push(entry.item.clone()),
    };

    // step 8: post-push bookkeeping.
    let mut guard = shared.qlock.lock();
    let Some(idx) = guard.find_index(queue_id) else {
        return false;
    };

    let was_active = guard.queues[idx].flags.pushed;
    if was_active && status == FlowStatus::NotLinked {
        // A previously-active stream just observed NOT_LINKED: every
        // parked waiter might be stale, let them re-try.
        for q in guard.queues.iter_mut() {
            if q.id != queue_id && q.flow_status != FlowStatus::NotLinked {
                continue;
            }
            q.flags.pushed = false;
            q.flow_status = FlowStatus::Ok;
            q.wait.turn_cv.notify_all();
        }
    }

    if entry.item.is_data() {
        guard.queues[idx].flags.pushed = true;
    }

    if status == FlowStatus::Eos && !guard.queues[idx].flags.drop_mode {
        guard.queues[idx].flags.drop_mode = true;
        debug!(queue_id, "entering drop mode after downstream EOS");
    }

    guard.queues[idx].flow_status = status;
    guard.queues[idx].last_old_id = entry.id;

    let buffering_pct = if guard.props.use_buffering && guard.recompute_buffering() {
        guard.take_buffering_percent()
    } else {
        None
    };
    drop(guard);
    if let Some(pct) = buffering_pct {
        shared.emit_buffering(pct);
    }

    !status.is_terminal()
}

fn handle_marker_side_effects(shared: &MultiQueueShared, queue_id: u32, item: &Arc<Item>) {
    let Some(marker) = item.marker_kind() else {
        return;
    };
    match marker {
        MarkerKind::StreamStart { .. } => {
            let mut guard = shared.qlock.lock();
            if let Some(idx) = guard.find_index(queue_id) {
                guard.queues[idx].stream_group_id_out = guard.queues[idx].stream_group_id_in;
            }
        }
        MarkerKind::SegmentStart(segment) => {
            let mut guard = shared.qlock.lock();
            if let Some(idx) = guard.find_index(queue_id) {
                guard.queues[idx].src_segment.set_segment(*segment);
            }
        }
        MarkerKind::SegmentDone => {
            let mut guard = shared.qlock.lock();
            if let Some(idx) = guard.find_index(queue_id) {
                guard.queues[idx].flags.is_segment_done = false;
                guard.queues[idx].flags.drop_mode = false;
            }
        }
        MarkerKind::EndOfStream => {
            let mut guard = shared.qlock.lock();
            if let Some(idx) = guard.find_index(queue_id) {
                guard.queues[idx].flags.is_eos = true;
                info!(queue_id, "worker committing EOS");
            }
        }
        _ => {}
    }
}

/// Spawns the worker thread for one queue. The returned handle is joined
/// by `release_input`.
pub fn spawn_worker(shared: Arc<MultiQueueShared>, queue_id: u32, sink: Arc<dyn DownstreamSink>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("mq-worker-{queue_id}"))
        .spawn(move || worker_loop(shared, queue_id, sink))
        .expect("failed to spawn worker thread")
}

fn worker_loop(shared: Arc<MultiQueueShared>, queue_id: u32, sink: Arc<dyn DownstreamSink>) {
    loop {
        let sync_by_running_time = shared.qlock.lock().props.sync_by_running_time;

        match pop_for_worker(&shared, queue_id) {
            PopOutcome::Removed => {
                trace!(queue_id, "worker thread exiting: queue removed");
                return;
            }
            PopOutcome::Item(entry) => {
                if !ordering_decision(&shared, queue_id, &entry, sync_by_running_time) {
                    continue;
                }
                let should_continue = handle_item(&shared, queue_id, entry, sink.as_ref(), sync_by_running_time);
                if !should_continue {
                    let still_registered = shared.qlock.lock().find_index(queue_id).is_some();
                    if still_registered {
                        debug!(queue_id, "worker pausing after terminal flow status");
                    }
                    return;
                }
            }
        }
    }
}

pub fn log_invariant_violation(queue_id: u32, what: &str) {
    error!(queue_id, what, "invariant violation");
}
