//! Task state object and driver accounting.
//!
//! Responsibilities:
//! - hold the canonical per-task lifecycle state behind a per-task lock;
//! - enforce monotonic transitions toward terminal states;
//! - track driver thread occupancy for stats and cooperative yielding;
//! - deduplicate incremental split deliveries per source;
//! - park and wake long-poll waiters on state-affecting mutations.
//!
//! The registry owns the canonical [`WorkerTask`] instance; callers hold
//! `Arc` handles that may outlive a single request but never outlive the
//! registry entry's removal.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flq_common::TaskId;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::query_context::QueryContext;

/// Unix wall-clock milliseconds.
pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Task lifecycle states tracked by the worker.
pub enum TaskState {
    /// Task is executing (or waiting for splits/drivers).
    Running,
    /// Task completed all work successfully.
    Finished,
    /// Task was canceled gracefully.
    Canceled,
    /// Task execution failed; the error is retained on the task.
    Failed,
    /// Task was aborted without draining.
    Aborted,
}

impl TaskState {
    /// Whether no further execution occurs in this state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }

    /// Stable bucket index used by the task-number histogram.
    pub fn ordinal(self) -> usize {
        match self {
            TaskState::Running => 0,
            TaskState::Finished => 1,
            TaskState::Canceled => 2,
            TaskState::Failed => 3,
            TaskState::Aborted => 4,
        }
    }

    /// Stable lowercase label used in metrics and logs.
    pub fn name(self) -> &'static str {
        match self {
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Canceled => "canceled",
            TaskState::Failed => "failed",
            TaskState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Error captured from the execution engine for a failed task.
pub struct ErrorInfo {
    /// Human-readable failure description.
    pub message: String,
    /// Coordinator-facing error code.
    pub code: String,
}

impl ErrorInfo {
    /// Error with the generic internal code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "GENERIC_INTERNAL_ERROR".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Compact task snapshot served by status long-polls.
pub struct TaskStatus {
    /// Task this snapshot describes.
    pub task_id: TaskId,
    /// Lifecycle state at snapshot time.
    pub state: TaskState,
    /// Mutation counter; grows on every state-affecting change.
    pub version: u64,
    /// Drivers currently on an execution thread.
    pub num_running_drivers: usize,
    /// Drivers currently blocked.
    pub num_blocked_drivers: usize,
    /// Captured failure, present iff state is Failed.
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// Driver/split accounting exposed through [`TaskInfo`].
pub struct TaskStats {
    /// Drivers currently on an execution thread.
    pub num_running_drivers: usize,
    /// Drivers currently blocked.
    pub num_blocked_drivers: usize,
    /// Drivers that have finished.
    pub num_finished_drivers: usize,
    /// Splits admitted to the execution engine so far.
    pub queued_splits: u64,
    /// Splits the execution engine reported processed.
    pub processed_splits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Full task snapshot served by info long-polls.
pub struct TaskInfo {
    /// Task this snapshot describes.
    pub task_id: TaskId,
    /// Lifecycle state at snapshot time.
    pub state: TaskState,
    /// Mutation counter; grows on every state-affecting change.
    pub version: u64,
    /// Creation timestamp in unix milliseconds.
    pub created_at_ms: u64,
    /// Last observed activity in unix milliseconds.
    pub last_heartbeat_ms: u64,
    /// Captured failure, present iff state is Failed.
    pub error: Option<ErrorInfo>,
    /// Driver/split accounting.
    pub stats: TaskStats,
    /// Output buffer ids declared for this task.
    pub output_buffer_ids: Vec<i64>,
    /// Plan-node ids whose split delivery is complete.
    pub completed_sources: Vec<String>,
}

impl TaskInfo {
    /// Snapshot for a task the registry no longer (or never) tracked,
    /// so delete retries converge without error.
    pub fn synthetic(task_id: TaskId, state: TaskState) -> Self {
        let now = unix_now_ms();
        Self {
            task_id,
            state,
            version: 0,
            created_at_ms: now,
            last_heartbeat_ms: now,
            error: None,
            stats: TaskStats::default(),
            output_buffer_ids: Vec::new(),
            completed_sources: Vec::new(),
        }
    }
}

/// Outcome of applying one source's split delivery.
#[derive(Debug, Default)]
pub struct SplitAdmission {
    /// Indexes (into the delivered split slice) of splits not seen before.
    pub fresh: Vec<usize>,
    /// Whether this delivery completed the source for the first time.
    pub newly_completed: bool,
}

#[derive(Debug)]
struct DriverSlot {
    on_thread_since: Option<Instant>,
    blocked: bool,
    finished: bool,
    yield_requested: Arc<AtomicBool>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct TaskInner {
    state: TaskState,
    version: u64,
    terminal_at: Option<Instant>,
    last_heartbeat_ms: u64,
    error: Option<ErrorInfo>,
    started: bool,
    drivers: Vec<DriverSlot>,
    output_buffer_ids: BTreeSet<i64>,
    no_more_buffers: bool,
    acked_split_seq: HashMap<String, i64>,
    completed_sources: BTreeSet<String>,
    queued_splits: u64,
    processed_splits: u64,
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
}

impl TaskInner {
    /// Bump version, refresh heartbeat, and wake all parked waiters.
    fn bump(&mut self) {
        self.version += 1;
        self.last_heartbeat_ms = unix_now_ms();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(());
        }
    }

    fn driver_counts(&self) -> (usize, usize, usize) {
        let mut running = 0;
        let mut blocked = 0;
        let mut finished = 0;
        for slot in &self.drivers {
            if slot.finished {
                finished += 1;
            } else if slot.blocked {
                blocked += 1;
            } else if slot.on_thread_since.is_some() {
                running += 1;
            }
        }
        (running, blocked, finished)
    }
}

/// Per-task aggregate: the single source of truth for one task's lifecycle
/// on this worker.
#[derive(Debug)]
pub struct WorkerTask {
    id: TaskId,
    query_ctx: Arc<QueryContext>,
    created_at_ms: u64,
    inner: Mutex<TaskInner>,
}

impl WorkerTask {
    /// New task in Running state bound to its query context.
    pub fn new(id: TaskId, query_ctx: Arc<QueryContext>) -> Self {
        let now = unix_now_ms();
        Self {
            id,
            query_ctx,
            created_at_ms: now,
            inner: Mutex::new(TaskInner {
                state: TaskState::Running,
                version: 0,
                terminal_at: None,
                last_heartbeat_ms: now,
                error: None,
                started: false,
                drivers: Vec::new(),
                output_buffer_ids: BTreeSet::new(),
                no_more_buffers: false,
                acked_split_seq: HashMap::new(),
                completed_sources: BTreeSet::new(),
                queued_splits: 0,
                processed_splits: 0,
                waiters: Vec::new(),
                next_waiter_id: 0,
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock().expect("task state lock poisoned")
    }

    /// Task identifier.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Shared execution context of the owning query.
    pub fn query_ctx(&self) -> &Arc<QueryContext> {
        &self.query_ctx
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.locked().state
    }

    /// Current mutation counter.
    pub fn version(&self) -> u64 {
        self.locked().version
    }

    /// Compact status snapshot.
    pub fn status(&self) -> TaskStatus {
        let inner = self.locked();
        let (running, blocked, _) = inner.driver_counts();
        TaskStatus {
            task_id: self.id.clone(),
            state: inner.state,
            version: inner.version,
            num_running_drivers: running,
            num_blocked_drivers: blocked,
            error: inner.error.clone(),
        }
    }

    /// Full info snapshot; `summarize` drops the per-source detail vectors.
    pub fn info(&self, summarize: bool) -> TaskInfo {
        let inner = self.locked();
        let (running, blocked, finished) = inner.driver_counts();
        TaskInfo {
            task_id: self.id.clone(),
            state: inner.state,
            version: inner.version,
            created_at_ms: self.created_at_ms,
            last_heartbeat_ms: inner.last_heartbeat_ms,
            error: inner.error.clone(),
            stats: TaskStats {
                num_running_drivers: running,
                num_blocked_drivers: blocked,
                num_finished_drivers: finished,
                queued_splits: inner.queued_splits,
                processed_splits: inner.processed_splits,
            },
            output_buffer_ids: if summarize {
                Vec::new()
            } else {
                inner.output_buffer_ids.iter().copied().collect()
            },
            completed_sources: if summarize {
                Vec::new()
            } else {
                inner.completed_sources.iter().cloned().collect()
            },
        }
    }

    /// Transition toward `to`. Terminal states are absorbing: the first
    /// terminal transition wins and later requests return the settled state.
    pub fn transition(&self, to: TaskState) -> TaskState {
        let mut inner = self.locked();
        if inner.state.is_terminal() || inner.state == to {
            return inner.state;
        }
        debug!(task_id = %self.id, from = %inner.state, to = %to, "task state transition");
        inner.state = to;
        if to.is_terminal() {
            inner.terminal_at = Some(Instant::now());
        }
        inner.bump();
        to
    }

    /// Capture an execution failure and transition to Failed. On an already
    /// terminal task this is a no-op returning the settled state.
    pub fn fail(&self, error: ErrorInfo) -> TaskState {
        let mut inner = self.locked();
        if inner.state.is_terminal() {
            return inner.state;
        }
        debug!(task_id = %self.id, error = %error.message, "task failed");
        inner.error.get_or_insert(error);
        inner.state = TaskState::Failed;
        inner.terminal_at = Some(Instant::now());
        inner.bump();
        TaskState::Failed
    }

    /// First caller wins the right to start fragment execution; false once
    /// started or terminal.
    pub fn try_mark_started(&self) -> bool {
        let mut inner = self.locked();
        if inner.started || inner.state.is_terminal() {
            return false;
        }
        inner.started = true;
        true
    }

    /// Refresh the heartbeat without waking pollers.
    pub fn touch(&self) {
        self.locked().last_heartbeat_ms = unix_now_ms();
    }

    /// Merge a declared output-buffer set into the task.
    pub fn record_output_buffers(&self, buffer_ids: &[i64], no_more_buffers: bool) {
        let mut inner = self.locked();
        let mut changed = false;
        for id in buffer_ids {
            changed |= inner.output_buffer_ids.insert(*id);
        }
        if no_more_buffers && !inner.no_more_buffers {
            inner.no_more_buffers = true;
            changed = true;
        }
        if changed {
            inner.bump();
        }
    }

    /// Deduplicate one source's split delivery against the per-source
    /// acknowledged-sequence watermark, advancing it atomically. Safe under
    /// concurrent duplicate deliveries: each split is admitted exactly once.
    pub fn admit_splits(
        &self,
        plan_node_id: &str,
        sequence_ids: &[i64],
        no_more_splits: bool,
    ) -> SplitAdmission {
        let mut inner = self.locked();
        let watermark = inner
            .acked_split_seq
            .get(plan_node_id)
            .copied()
            .unwrap_or(-1);
        let mut admission = SplitAdmission::default();
        let mut max_seq = watermark;
        for (idx, seq) in sequence_ids.iter().enumerate() {
            if *seq > watermark {
                admission.fresh.push(idx);
                max_seq = max_seq.max(*seq);
            }
        }
        if max_seq > watermark {
            inner
                .acked_split_seq
                .insert(plan_node_id.to_string(), max_seq);
            inner.queued_splits += admission.fresh.len() as u64;
        }
        if no_more_splits {
            admission.newly_completed = inner.completed_sources.insert(plan_node_id.to_string());
        }
        if !admission.fresh.is_empty() || admission.newly_completed {
            inner.bump();
        }
        admission
    }

    /// Record splits the execution engine finished processing.
    pub fn record_processed_splits(&self, count: u64) {
        let mut inner = self.locked();
        inner.processed_splits += count;
        inner.bump();
    }

    /// Register a new driver with the task. The returned handle is used by
    /// the execution engine's run loop to report occupancy and poll the
    /// cooperative yield flag.
    pub fn add_driver(self: &Arc<Self>) -> DriverHandle {
        let yield_requested = Arc::new(AtomicBool::new(false));
        let mut inner = self.locked();
        let index = inner.drivers.len();
        inner.drivers.push(DriverSlot {
            on_thread_since: None,
            blocked: false,
            finished: false,
            yield_requested: Arc::clone(&yield_requested),
        });
        inner.bump();
        drop(inner);
        DriverHandle {
            task: Arc::clone(self),
            index,
            yield_requested,
        }
    }

    /// Flag one driver that has continuously held its thread for at least
    /// `slice` and is not already flagged. Returns whether one was flagged.
    pub fn request_yield_one(&self, slice: Duration) -> bool {
        let inner = self.locked();
        if inner.state.is_terminal() {
            return false;
        }
        for slot in &inner.drivers {
            if slot.finished {
                continue;
            }
            let Some(since) = slot.on_thread_since else {
                continue;
            };
            if since.elapsed() < slice {
                continue;
            }
            if slot
                .yield_requested
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Driver occupancy: (running, blocked).
    pub fn driver_counts(&self) -> (usize, usize) {
        let inner = self.locked();
        let (running, blocked, _) = inner.driver_counts();
        (running, blocked)
    }

    /// Number of long-poll waiters currently parked on this task.
    pub fn pending_waiter_count(&self) -> usize {
        self.locked().waiters.len()
    }

    /// Whether the cleanup sweep may remove this task: terminal, past
    /// retention, and nobody is long-polling it.
    pub fn is_cleanable(&self, retention: Duration) -> bool {
        let inner = self.locked();
        if !inner.state.is_terminal() || !inner.waiters.is_empty() {
            return false;
        }
        match inner.terminal_at {
            Some(at) => at.elapsed() >= retention,
            None => false,
        }
    }

    /// Park a waiter to be woken by the next state-affecting mutation.
    /// Dropping the returned handle (request canceled, poll timed out)
    /// removes the waiter without resolving it.
    pub fn subscribe(self: &Arc<Self>) -> TaskChanged {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.locked();
        let id = inner.next_waiter_id;
        inner.next_waiter_id += 1;
        inner.waiters.push(Waiter { id, tx });
        TaskChanged {
            task: Arc::downgrade(self),
            id,
            rx,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.locked().waiters.retain(|w| w.id != id);
    }

    /// Await this task reaching a terminal state. Shutdown path only.
    pub async fn wait_terminal(self: &Arc<Self>) {
        loop {
            let waiter = self.subscribe();
            if self.state().is_terminal() {
                return;
            }
            waiter.wait().await;
        }
    }
}

/// Pending long-poll continuation parked on a task.
///
/// Resolves when the task commits a state-affecting mutation; dropping it
/// unregisters the waiter with no side effects on the task.
#[derive(Debug)]
pub struct TaskChanged {
    task: Weak<WorkerTask>,
    id: u64,
    rx: oneshot::Receiver<()>,
}

impl TaskChanged {
    /// Wait for the next mutation (or for the task to go away).
    pub async fn wait(mut self) {
        let _ = (&mut self.rx).await;
    }
}

impl Drop for TaskChanged {
    fn drop(&mut self) {
        if let Some(task) = self.task.upgrade() {
            task.unsubscribe(self.id);
        }
    }
}

/// Execution-engine view of one driver thread-of-control.
///
/// The engine reports occupancy transitions through this handle and polls
/// [`DriverHandle::should_yield`] at safe checkpoints; the scheduler only
/// requests suspension, never forces it.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    task: Arc<WorkerTask>,
    index: usize,
    yield_requested: Arc<AtomicBool>,
}

impl DriverHandle {
    /// Task this driver belongs to.
    pub fn task_id(&self) -> &TaskId {
        self.task.id()
    }

    /// Driver took an execution thread.
    pub fn on_thread(&self) {
        let mut inner = self.task.locked();
        let slot = &mut inner.drivers[self.index];
        slot.on_thread_since = Some(Instant::now());
        slot.blocked = false;
        inner.bump();
    }

    /// Driver released its execution thread.
    pub fn off_thread(&self) {
        let mut inner = self.task.locked();
        inner.drivers[self.index].on_thread_since = None;
        inner.bump();
    }

    /// Driver became blocked (or unblocked) on an external dependency.
    pub fn set_blocked(&self, blocked: bool) {
        let mut inner = self.task.locked();
        let slot = &mut inner.drivers[self.index];
        slot.blocked = blocked;
        if blocked {
            slot.on_thread_since = None;
        }
        inner.bump();
    }

    /// Driver finished all its work.
    pub fn finish(&self) {
        let mut inner = self.task.locked();
        let slot = &mut inner.drivers[self.index];
        slot.finished = true;
        slot.on_thread_since = None;
        slot.blocked = false;
        inner.bump();
    }

    /// Whether the scheduler asked this driver to yield.
    pub fn should_yield(&self) -> bool {
        self.yield_requested.load(Ordering::Acquire)
    }

    /// Reset the yield flag after yielding at a checkpoint.
    pub fn clear_yield(&self) {
        self.yield_requested.store(false, Ordering::Release);
    }
}
