//! Structured per-queue snapshots, exposed via the `stats` property.

use crate::flow::FlowStatus;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStats {
    pub id: u32,
    pub group_id: u32,
    pub items: u64,
    pub bytes: u64,
    pub time_ns: u64,
    pub is_eos: bool,
    pub flow_status: FlowStatus,
}
