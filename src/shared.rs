//! The state and locks every worker/producer thread reaches through.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::core::CoreState;
use crate::properties::Properties;
use crate::single_queue::IdAllocator;

type OverrunHook = Box<dyn Fn() + Send + Sync>;
type UnderrunHook = Box<dyn Fn() + Send + Sync>;
type BufferingHook = Box<dyn Fn(u8) + Send + Sync>;

/// Cross-thread state shared by [`crate::MultiQueue`], every worker thread
/// and every producer thread. `qlock` is *the* single MultiQueue mutex;
/// `reconf_lock` and `buffering_publish_lock` are two secondary locks,
/// acquired in a fixed order (`reconf_lock` before `qlock`;
/// `buffering_publish_lock` independent of both).
pub struct MultiQueueShared {
    pub qlock: Mutex<CoreState>,
    pub reconf_lock: Mutex<()>,
    pub buffering_publish_lock: Mutex<()>,
    pub counter: AtomicU64,
    pub ids: IdAllocator,

    pub on_overrun: Option<OverrunHook>,
    pub on_underrun: Option<UnderrunHook>,
    pub on_buffering: Option<BufferingHook>,
}

impl MultiQueueShared {
    pub fn new(props: Properties) -> Self {
        Self {
            qlock: Mutex::new(CoreState::new(props)),
            reconf_lock: Mutex::new(()),
            buffering_publish_lock: Mutex::new(()),
            counter: AtomicU64::new(0),
            ids: IdAllocator::new(),
            on_overrun: None,
            on_underrun: None,
            on_buffering: None,
        }
    }

    /// Assigns the next global, strictly-increasing id: every item
    /// enqueued gets the current counter value, then the counter
    /// atomically increments. Incremented outside `qlock` so non-blocking
    /// pushes never contend on it.
    pub fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn emit_overrun(&self) {
        warn!("overrun");
        if let Some(hook) = &self.on_overrun {
            hook();
        }
    }

    pub fn emit_underrun(&self) {
        warn!("underrun");
        if let Some(hook) = &self.on_underrun {
            hook();
        }
    }

    /// Publishes a buffering percent under the dedicated publisher mutex,
    /// kept distinct from `qlock` so a slow host bus call can never block a
    /// scheduling decision.
    pub fn emit_buffering(&self, percent: u8) {
        let _publish_guard = self.buffering_publish_lock.lock();
        if let Some(hook) = &self.on_buffering {
            hook(percent);
        }
    }
}
