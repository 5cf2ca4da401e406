//! Execution-engine seam: update payloads and the fragment-execution contract.
//!
//! The engine that actually runs plan fragments (operators, drivers) lives
//! behind [`FragmentExecutor`]; the task manager only validates, deduplicates,
//! and forwards. Plan fragments and splits are opaque serialized payloads
//! owned by the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flq_common::{Result, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query_context::QueryContext;
use crate::task::WorkerTask;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Serialized plan fragment for one task.
pub struct PlanFragment {
    /// Opaque fragment payload, decoded by the execution engine.
    pub fragment_json: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One unit of input with its delivery sequence number.
pub struct ScheduledSplit {
    /// Monotonic per-source sequence id assigned by the coordinator;
    /// the dedup key under retried deliveries.
    pub sequence_id: i64,
    /// Opaque split payload, decoded by the execution engine.
    pub split: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Incremental split delivery for one plan node.
pub struct TaskSource {
    /// Plan node the splits feed.
    pub plan_node_id: String,
    /// Newly delivered splits (may replay earlier sequence ids).
    pub splits: Vec<ScheduledSplit>,
    /// Whether the coordinator will deliver no further splits for this node.
    pub no_more_splits: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// Output-buffer set declared for a task.
pub struct OutputBuffers {
    /// Declared buffer ids.
    pub buffer_ids: Vec<i64>,
    /// Whether the buffer set is final.
    pub no_more_buffers: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// Create-or-update payload for a task.
pub struct TaskUpdateRequest {
    /// Incremental split deliveries per plan node.
    pub sources: Vec<TaskSource>,
    /// Output-buffer set for the task.
    pub output_buffers: OutputBuffers,
    /// Session properties seeding the query context on first create.
    pub session_properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Batch-oriented variant of [`TaskUpdateRequest`] used by batch workloads
/// that route output through an external shuffle service.
pub struct BatchTaskUpdateRequest {
    /// Base update payload.
    pub update: TaskUpdateRequest,
    /// Serialized shuffle-write descriptor, when output goes to a shuffle.
    pub shuffle_write_info: Option<String>,
    /// Base path for broadcast output, when used.
    pub broadcast_base_path: Option<String>,
}

#[async_trait]
/// Fragment-execution contract consumed by the task manager.
///
/// Implementations spawn driver threads that report occupancy through
/// [`crate::task::DriverHandle`]s obtained from the task, and capture
/// fragment failures into the task via [`WorkerTask::fail`].
pub trait FragmentExecutor: Send + Sync {
    /// Begin executing `fragment` for `task`. Called at most once per task.
    async fn start_task(
        &self,
        task: &Arc<WorkerTask>,
        fragment: &PlanFragment,
        ctx: &Arc<QueryContext>,
    ) -> Result<()>;

    /// Enqueue a split delivery already deduplicated by the task manager.
    async fn add_splits(&self, task: &Arc<WorkerTask>, source: TaskSource) -> Result<()>;

    /// Stop execution; `abort` skips graceful draining of in-flight work.
    async fn cancel_task(&self, task: &Arc<WorkerTask>, abort: bool) -> Result<()>;

    /// A remote input source was dropped and will produce no further data;
    /// the task must not wait on it indefinitely.
    async fn remove_remote_source(
        &self,
        task: &Arc<WorkerTask>,
        remote_source_task_id: &TaskId,
    ) -> Result<()>;
}
