use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Task-manager behavior/configuration knobs.
pub struct TaskManagerConfig {
    /// Retention in milliseconds before a terminal task is eligible for cleanup.
    pub old_task_cleanup_ms: u64,
    /// Upper clamp applied to caller-supplied long-poll waits.
    pub max_long_poll_wait_ms: u64,
    /// Interval between background cleanup sweeps.
    pub task_reaper_interval_ms: u64,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            old_task_cleanup_ms: 60_000,
            max_long_poll_wait_ms: 60_000,
            task_reaper_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// Identity of the worker node, consumed by spill-path construction and
/// reported back to the coordinator.
pub struct NodeConfig {
    /// Stable node identifier assigned at bootstrap.
    pub node_id: String,
    /// Address the node is reachable at.
    pub node_ip: String,
}
