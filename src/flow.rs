//! Downstream flow status and the host collaborator contract.

use std::sync::Arc;

use crate::item::Item;

/// Flow status as returned by the downstream collaborator, and stored
/// per-[`crate::SingleQueue`] to drive scheduling. These are plain data,
/// never thrown as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Ok,
    NotLinked,
    Flushing,
    Eos,
    Fatal,
    Closed,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::Fatal | FlowStatus::Closed)
    }
}

/// What the host must provide for each registered stream: a place to push
/// items, and a way to answer serialized queries. Kept minimal and
/// object-safe so a single `Arc<dyn DownstreamSink>` per stream suffices.
pub trait DownstreamSink: Send + Sync {
    /// Forward an item downstream, returning the flow status observed.
    fn push(&self, item: Arc<Item>) -> FlowStatus;

    /// Answer a serialized query. Returns `true` if the query was handled
    /// successfully.
    fn push_query(&self, item: Arc<Item>) -> bool {
        let _ = item;
        false
    }
}
