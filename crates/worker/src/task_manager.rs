//! Task lifecycle orchestration for one worker node.
//!
//! Responsibilities:
//! - create-or-update semantics for coordinator-dispatched tasks;
//! - long-poll status/info delivery with bounded wait;
//! - result delivery and the buffer acknowledge/abort protocol;
//! - garbage collection of terminal tasks past retention;
//! - cooperative yield requests across driver threads.
//!
//! Locking:
//! - the registry map is behind an `RwLock`: lookups proceed concurrently,
//!   insert/remove is exclusive;
//! - per-task field mutation is guarded at the task's own lock, independent
//!   of the registry lock;
//! - lock order is registry, then task; no lock is held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use flq_common::metrics::global_metrics;
use flq_common::{FlqError, NodeConfig, QueryId, Result, TaskId, TaskManagerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferResult, OutputBufferManager, ResultRequest};
use crate::execution::{
    BatchTaskUpdateRequest, FragmentExecutor, PlanFragment, ScheduledSplit, TaskSource,
    TaskUpdateRequest,
};
use crate::query_context::{QueryContext, QueryContextManager};
use crate::task::{ErrorInfo, TaskInfo, TaskState, TaskStatus, WorkerTask};

/// Registry mapping task ids to their canonical state objects.
pub type TaskMap = HashMap<TaskId, Arc<WorkerTask>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Point-in-time driver occupancy over all non-terminal tasks.
pub struct DriverCountStats {
    /// Drivers currently on an execution thread.
    pub num_running_drivers: usize,
    /// Drivers currently blocked.
    pub num_blocked_drivers: usize,
}

#[derive(Debug)]
struct PendingResult {
    id: u64,
    request: ResultRequest,
}

/// Public-facing task coordinator: composes the registry, query contexts,
/// the output-buffer controller, and the execution engine seam.
pub struct TaskManager<E, B>
where
    E: FragmentExecutor + 'static,
    B: OutputBufferManager + 'static,
{
    config: TaskManagerConfig,
    node: NodeConfig,
    base_uri: String,
    tasks: RwLock<TaskMap>,
    query_contexts: QueryContextManager,
    executor: Arc<E>,
    buffers: Arc<B>,
    pending_results: Mutex<HashMap<TaskId, HashMap<i64, PendingResult>>>,
    next_request_id: AtomicU64,
}

impl<E, B> TaskManager<E, B>
where
    E: FragmentExecutor + 'static,
    B: OutputBufferManager + 'static,
{
    /// Build a task manager over the given execution and buffer seams.
    pub fn new(
        config: TaskManagerConfig,
        node: NodeConfig,
        executor: Arc<E>,
        buffers: Arc<B>,
    ) -> Self {
        Self {
            config,
            node,
            base_uri: String::new(),
            tasks: RwLock::new(TaskMap::new()),
            query_contexts: QueryContextManager::default(),
            executor,
            buffers,
            pending_results: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
        }
    }

    /// Base URI this worker announces to the coordinator.
    pub fn set_base_uri(&mut self, base_uri: impl Into<String>) {
        self.base_uri = base_uri.into();
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// Override the node id reported in snapshots and spill paths.
    pub fn set_node_id(&mut self, node_id: impl Into<String>) {
        self.node.node_id = node_id.into();
    }

    pub fn node(&self) -> &NodeConfig {
        &self.node
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    /// Registry of shared per-query contexts.
    pub fn query_context_manager(&self) -> &QueryContextManager {
        &self.query_contexts
    }

    /// Output-buffer controller consumed by this manager.
    pub fn buffer_manager(&self) -> &Arc<B> {
        &self.buffers
    }

    fn tasks_read(&self) -> RwLockReadGuard<'_, TaskMap> {
        self.tasks.read().expect("task registry lock poisoned")
    }

    fn tasks_write(&self) -> RwLockWriteGuard<'_, TaskMap> {
        self.tasks.write().expect("task registry lock poisoned")
    }

    fn pending_locked(&self) -> MutexGuard<'_, HashMap<TaskId, HashMap<i64, PendingResult>>> {
        self.pending_results
            .lock()
            .expect("pending result lock poisoned")
    }

    fn clamp_wait(&self, wait: Duration) -> Duration {
        wait.min(Duration::from_millis(self.config.max_long_poll_wait_ms))
    }

    fn get_task(&self, task_id: &TaskId) -> Option<Arc<WorkerTask>> {
        self.tasks_read().get(task_id).cloned()
    }

    /// Registry lookup-or-insert; the double-checked write path makes
    /// concurrent duplicate creates converge on one canonical instance.
    fn find_or_create(
        &self,
        task_id: &TaskId,
        query_ctx: Arc<QueryContext>,
    ) -> (Arc<WorkerTask>, bool) {
        if let Some(task) = self.tasks_read().get(task_id) {
            return (Arc::clone(task), false);
        }
        let mut tasks = self.tasks_write();
        if let Some(task) = tasks.get(task_id) {
            return (Arc::clone(task), false);
        }
        let task = Arc::new(WorkerTask::new(task_id.clone(), query_ctx));
        tasks.insert(task_id.clone(), Arc::clone(&task));
        global_metrics().inc_tasks_created();
        (task, true)
    }

    /// Create a task (starting fragment execution once) or merge an
    /// incremental update into it. Idempotent: retried or concurrent
    /// duplicate calls observe the first call's effects and apply only the
    /// delta; updates to a terminal task return the settled snapshot.
    pub async fn create_or_update_task(
        &self,
        task_id: &TaskId,
        update: TaskUpdateRequest,
        fragment: Option<&PlanFragment>,
        query_ctx: Arc<QueryContext>,
    ) -> Result<TaskInfo> {
        let (task, created) = self.find_or_create(task_id, query_ctx);
        if created {
            info!(
                task_id = %task_id,
                query_id = %task.query_ctx().query_id(),
                "task created"
            );
        }
        if task.state().is_terminal() {
            debug!(task_id = %task_id, state = %task.state(), "update for terminal task ignored");
            return Ok(task.info(false));
        }

        if let Some(fragment) = fragment {
            if task.try_mark_started() {
                info!(
                    task_id = %task_id,
                    fragment_bytes = fragment.fragment_json.len(),
                    "starting fragment execution"
                );
                if let Err(e) = self.executor.start_task(&task, fragment, task.query_ctx()).await {
                    warn!(task_id = %task_id, error = %e, "fragment start failed");
                    task.fail(ErrorInfo::new(e.to_string()));
                    return Ok(task.info(false));
                }
            }
        }

        task.record_output_buffers(
            &update.output_buffers.buffer_ids,
            update.output_buffers.no_more_buffers,
        );

        for source in update.sources {
            let sequence_ids: Vec<i64> = source.splits.iter().map(|s| s.sequence_id).collect();
            let admission =
                task.admit_splits(&source.plan_node_id, &sequence_ids, source.no_more_splits);
            if admission.fresh.is_empty() && !admission.newly_completed {
                continue;
            }
            let fresh_splits: Vec<ScheduledSplit> = admission
                .fresh
                .iter()
                .map(|&idx| source.splits[idx].clone())
                .collect();
            debug!(
                task_id = %task_id,
                plan_node_id = %source.plan_node_id,
                fresh_splits = fresh_splits.len(),
                no_more_splits = source.no_more_splits,
                "admitting splits"
            );
            let deduped = TaskSource {
                plan_node_id: source.plan_node_id,
                splits: fresh_splits,
                no_more_splits: source.no_more_splits,
            };
            if let Err(e) = self.executor.add_splits(&task, deduped).await {
                warn!(task_id = %task_id, error = %e, "split delivery failed");
                task.fail(ErrorInfo::new(e.to_string()));
                return Ok(task.info(false));
            }
        }

        task.touch();
        Ok(task.info(false))
    }

    /// Batch-shaped variant of [`TaskManager::create_or_update_task`]; same
    /// idempotency contract with a different source-enumeration format.
    pub async fn create_or_update_batch_task(
        &self,
        task_id: &TaskId,
        batch: BatchTaskUpdateRequest,
        fragment: Option<&PlanFragment>,
        query_ctx: Arc<QueryContext>,
    ) -> Result<TaskInfo> {
        if let Some(shuffle) = &batch.shuffle_write_info {
            debug!(task_id = %task_id, shuffle_write_info = %shuffle, "batch task writes to shuffle");
        }
        if let Some(path) = &batch.broadcast_base_path {
            debug!(task_id = %task_id, broadcast_base_path = %path, "batch task broadcasts output");
        }
        self.create_or_update_task(task_id, batch.update, fragment, query_ctx)
            .await
    }

    /// Synthesize (or update) a task straight into Failed carrying `error`,
    /// without ever running a fragment, so that subsequent polls retrieve
    /// the failure instead of NotFound.
    pub fn create_or_update_error_task(&self, task_id: &TaskId, error: ErrorInfo) -> TaskInfo {
        let ctx = self
            .query_contexts
            .get_or_create(&task_id.query_id(), &HashMap::new());
        let (task, created) = self.find_or_create(task_id, ctx);
        if created {
            global_metrics().inc_error_tasks_created();
        }
        warn!(task_id = %task_id, error = %error.message, "recording error task");
        task.fail(error);
        task.info(false)
    }

    /// Transition the task to Canceled (graceful) or Aborted, release its
    /// buffers, and wake every pending waiter with the final state.
    /// Idempotent: an already-terminal task keeps its settled state; an
    /// unknown task yields a representative synthetic snapshot.
    pub async fn delete_task(&self, task_id: &TaskId, abort: bool) -> TaskInfo {
        let target = if abort {
            TaskState::Aborted
        } else {
            TaskState::Canceled
        };
        let Some(task) = self.get_task(task_id) else {
            debug!(task_id = %task_id, abort, "delete for unknown task");
            return TaskInfo::synthetic(task_id.clone(), target);
        };
        // settle the state first so woken waiters observe the final state,
        // then let the engine wind down its drivers
        let final_state = task.transition(target);
        if let Err(e) = self.executor.cancel_task(&task, abort).await {
            warn!(task_id = %task_id, error = %e, "cancel request to execution engine failed");
        }
        self.buffers.remove_task(task_id);
        // parked result polls degrade to empty incomplete answers
        self.notify_buffer_data(task_id);
        info!(task_id = %task_id, state = %final_state, abort, "task deleted");
        task.info(false)
    }

    /// Remove terminal tasks past the retention threshold that nobody is
    /// long-polling, releasing their buffer state and query-context
    /// references. Returns the number removed.
    pub fn clean_old_tasks(&self) -> usize {
        let retention = Duration::from_millis(self.config.old_task_cleanup_ms);
        let mut removed: Vec<(TaskId, Arc<WorkerTask>)> = Vec::new();
        {
            let mut tasks = self.tasks_write();
            tasks.retain(|id, task| {
                if task.is_cleanable(retention) {
                    removed.push((id.clone(), Arc::clone(task)));
                    false
                } else {
                    true
                }
            });
        }
        for (task_id, task) in &removed {
            debug!(task_id = %task_id, state = %task.state(), "removed old task");
            self.buffers.remove_task(task_id);
            self.notify_buffer_data(task_id);
        }
        let pruned = self.query_contexts.prune();
        if !removed.is_empty() {
            info!(
                removed = removed.len(),
                contexts_pruned = pruned,
                "cleaned old tasks"
            );
            global_metrics().inc_tasks_cleaned(removed.len() as u64);
        }
        self.refresh_gauges();
        removed.len()
    }

    /// Drive [`TaskManager::clean_old_tasks`] periodically until `shutdown`
    /// fires.
    pub async fn run_task_reaper(&self, shutdown: CancellationToken) {
        let interval = Duration::from_millis(self.config.task_reaper_interval_ms);
        info!(interval_ms = self.config.task_reaper_interval_ms, "task reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.clean_old_tasks();
                }
                _ = shutdown.cancelled() => {
                    info!("task reaper stopped");
                    return;
                }
            }
        }
    }

    /// Await every currently non-terminal task reaching a terminal state.
    /// Shutdown path only; callers stop admitting new tasks first.
    pub async fn wait_for_tasks_to_complete(&self) {
        loop {
            let running: Vec<Arc<WorkerTask>> = self
                .tasks_read()
                .values()
                .filter(|t| !t.state().is_terminal())
                .cloned()
                .collect();
            if running.is_empty() {
                return;
            }
            info!(tasks = running.len(), "waiting for tasks to complete");
            for task in running {
                task.wait_terminal().await;
            }
        }
    }

    /// Wait until the task commits a mutation past `seen_version`, `max_wait`
    /// elapses, or the request is canceled. The waiter guard unregisters on
    /// every exit path.
    async fn wait_for_task_change(
        &self,
        task: &Arc<WorkerTask>,
        seen_version: u64,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) {
        let wait = self.clamp_wait(max_wait);
        let waiter = task.subscribe();
        // a mutation may have landed between snapshot and subscribe
        if task.version() != seen_version {
            return;
        }
        tokio::select! {
            _ = waiter.wait() => {}
            _ = tokio::time::sleep(wait) => {
                global_metrics().inc_long_poll_timeouts();
            }
            _ = cancel.cancelled() => {}
        }
    }

    /// Long-poll status: resolves immediately when the task is unknown
    /// (NotFound), when `current_state` is absent or stale, or when no wait
    /// was requested; otherwise on the next mutation or `max_wait` expiry
    /// with the then-current snapshot.
    pub async fn get_task_status(
        &self,
        task_id: &TaskId,
        current_state: Option<TaskState>,
        max_wait: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| FlqError::NotFound(task_id.to_string()))?;
        let status = task.status();
        let (Some(expected), Some(wait)) = (current_state, max_wait) else {
            return Ok(status);
        };
        if status.state != expected {
            return Ok(status);
        }
        self.wait_for_task_change(&task, status.version, wait, cancel)
            .await;
        Ok(task.status())
    }

    /// Long-poll info; same protocol as [`TaskManager::get_task_status`].
    /// `summarize` drops the per-source detail vectors from the snapshot.
    pub async fn get_task_info(
        &self,
        task_id: &TaskId,
        summarize: bool,
        current_state: Option<TaskState>,
        max_wait: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<TaskInfo> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| FlqError::NotFound(task_id.to_string()))?;
        let info = task.info(summarize);
        let (Some(expected), Some(wait)) = (current_state, max_wait) else {
            return Ok(info);
        };
        if info.state != expected {
            return Ok(info);
        }
        self.wait_for_task_change(&task, info.version, wait, cancel)
            .await;
        Ok(task.info(summarize))
    }

    /// Fetch buffer data for `(buffer_id, token)`. Immediate when data (or
    /// stream completion) is available; otherwise parks a [`ResultRequest`]
    /// bounded by `max_wait`. Timeout and cancellation yield an empty
    /// not-completed result the coordinator retries with the same token.
    pub async fn get_results(
        &self,
        task_id: &TaskId,
        buffer_id: i64,
        token: i64,
        max_bytes: u64,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<BufferResult> {
        if buffer_id < 0 {
            return Err(FlqError::InvalidArgument(format!(
                "negative buffer id {buffer_id}"
            )));
        }
        if token < 0 {
            return Err(FlqError::InvalidArgument(format!("negative token {token}")));
        }

        if let Some(result) = self.buffers.get_data(task_id, buffer_id, token, max_bytes) {
            if !result.pages.is_empty() || result.complete {
                return Ok(result);
            }
        }

        let (request, rx) = ResultRequest::new(task_id.clone(), buffer_id, token, max_bytes);
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending_locked();
            // a newer poll for the same buffer supersedes the parked one
            pending
                .entry(task_id.clone())
                .or_default()
                .insert(buffer_id, PendingResult { id, request });
        }
        self.refresh_pending_gauge();
        debug!(task_id = %task_id, buffer_id, token, "result poll parked");

        let wait = self.clamp_wait(max_wait);
        let resolved = tokio::select! {
            res = rx => res.ok(),
            _ = tokio::time::sleep(wait) => None,
            _ = cancel.cancelled() => None,
        };
        match resolved {
            Some(result) => Ok(result),
            None => {
                self.remove_pending_result(task_id, buffer_id, id);
                self.refresh_pending_gauge();
                Ok(BufferResult::empty(token))
            }
        }
    }

    /// Fulfill parked result requests from the buffer controller. A task
    /// the controller no longer has a record of degrades to an empty
    /// not-completed answer instead of failing the poll loop.
    pub fn get_data_for_result_requests(&self, requests: impl IntoIterator<Item = ResultRequest>) {
        for request in requests {
            let result = self
                .buffers
                .get_data(
                    &request.task_id,
                    request.buffer_id,
                    request.token,
                    request.max_bytes,
                )
                .unwrap_or_else(|| BufferResult::empty(request.token));
            request.fulfill(result);
        }
    }

    /// The execution engine reports new pages (or teardown) for a task;
    /// drain and fulfill its parked result requests.
    pub fn notify_buffer_data(&self, task_id: &TaskId) {
        let drained: Vec<ResultRequest> = {
            let mut pending = self.pending_locked();
            pending
                .remove(task_id)
                .map(|by_buffer| by_buffer.into_values().map(|p| p.request).collect())
                .unwrap_or_default()
        };
        if drained.is_empty() {
            return;
        }
        self.get_data_for_result_requests(drained);
        self.refresh_pending_gauge();
    }

    fn remove_pending_result(&self, task_id: &TaskId, buffer_id: i64, id: u64) {
        let mut pending = self.pending_locked();
        if let Some(by_buffer) = pending.get_mut(task_id) {
            if by_buffer.get(&buffer_id).is_some_and(|p| p.id == id) {
                by_buffer.remove(&buffer_id);
            }
            if by_buffer.is_empty() {
                pending.remove(task_id);
            }
        }
    }

    fn refresh_pending_gauge(&self) {
        let count: usize = self.pending_locked().values().map(HashMap::len).sum();
        global_metrics().set_pending_result_requests(count as u64);
    }

    /// Discard the named buffer. Idempotent; a poll parked on the buffer is
    /// answered with the completed (empty) stream.
    pub fn abort_results(&self, task_id: &TaskId, buffer_id: i64) {
        debug!(task_id = %task_id, buffer_id, "aborting results");
        self.buffers.abort_buffer(task_id, buffer_id);
        let drained = {
            let mut pending = self.pending_locked();
            pending
                .get_mut(task_id)
                .and_then(|by_buffer| by_buffer.remove(&buffer_id))
        };
        if let Some(parked) = drained {
            self.get_data_for_result_requests([parked.request]);
            self.refresh_pending_gauge();
        }
    }

    /// Release data up to `token`. Monotonic: acknowledging a lower token
    /// than before is a no-op, never a rollback.
    pub fn acknowledge_results(&self, task_id: &TaskId, buffer_id: i64, token: i64) -> Result<()> {
        if token < 0 {
            return Err(FlqError::InvalidArgument(format!("negative token {token}")));
        }
        self.buffers.acknowledge(task_id, buffer_id, token);
        Ok(())
    }

    /// Notify the task that a remote input source was dropped so it stops
    /// waiting on data that will never arrive.
    pub async fn remove_remote_source(&self, task_id: &TaskId, remote_source_task_id: &TaskId) {
        let Some(task) = self.get_task(task_id) else {
            debug!(task_id = %task_id, "remove remote source for unknown task");
            return;
        };
        debug!(task_id = %task_id, remote = %remote_source_task_id, "removing remote source");
        if let Err(e) = self
            .executor
            .remove_remote_source(&task, remote_source_task_id)
            .await
        {
            warn!(
                task_id = %task_id,
                remote = %remote_source_task_id,
                error = %e,
                "remove remote source failed"
            );
        }
    }

    /// Request cooperative yields from up to `num_target_threads_to_yield`
    /// drivers that have continuously held their thread for at least
    /// `time_slice_micros`, round-robining across tasks so no single task's
    /// drivers are drained first. Advisory: a flagged driver yields at its
    /// next safe checkpoint. Returns the number of drivers flagged.
    pub fn yield_tasks(&self, num_target_threads_to_yield: usize, time_slice_micros: u64) -> usize {
        if num_target_threads_to_yield == 0 {
            return 0;
        }
        let slice = Duration::from_micros(time_slice_micros);
        let mut tasks: Vec<Arc<WorkerTask>> = self
            .tasks_read()
            .values()
            .filter(|t| !t.state().is_terminal())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id().0.cmp(&b.id().0));

        let mut yielded = 0;
        'rounds: loop {
            let mut progressed = false;
            for task in &tasks {
                if yielded >= num_target_threads_to_yield {
                    break 'rounds;
                }
                if task.request_yield_one(slice) {
                    yielded += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        if yielded > 0 {
            debug!(yielded, target = num_target_threads_to_yield, "requested driver yields");
            global_metrics().inc_driver_yields_requested(yielded as u64);
        }
        yielded
    }

    /// Driver occupancy aggregated over non-terminal tasks; a point-in-time
    /// snapshot, not transactionally consistent with concurrent mutation.
    pub fn get_driver_count_stats(&self) -> DriverCountStats {
        let mut stats = DriverCountStats::default();
        for task in self.tasks_read().values() {
            if task.state().is_terminal() {
                continue;
            }
            let (running, blocked) = task.driver_counts();
            stats.num_running_drivers += running;
            stats.num_blocked_drivers += blocked;
        }
        stats
    }

    /// Five-bucket task histogram (indexed by [`TaskState::ordinal`]) plus
    /// the total number of registered tasks.
    pub fn get_task_numbers(&self) -> ([usize; 5], usize) {
        let tasks = self.tasks_read();
        let mut counts = [0usize; 5];
        for task in tasks.values() {
            counts[task.state().ordinal()] += 1;
        }
        (counts, tasks.len())
    }

    /// Number of registered tasks.
    pub fn num_tasks(&self) -> usize {
        self.tasks_read().len()
    }

    /// Snapshot of the registry contents.
    pub fn tasks(&self) -> TaskMap {
        self.tasks_read().clone()
    }

    fn refresh_gauges(&self) {
        const STATES: [TaskState; 5] = [
            TaskState::Running,
            TaskState::Finished,
            TaskState::Canceled,
            TaskState::Failed,
            TaskState::Aborted,
        ];
        let metrics = global_metrics();
        let (counts, _) = self.get_task_numbers();
        for state in STATES {
            metrics.set_tasks_in_state(state.name(), counts[state.ordinal()] as u64);
        }
        let drivers = self.get_driver_count_stats();
        metrics.set_driver_counts(
            drivers.num_running_drivers as u64,
            drivers.num_blocked_drivers as u64,
        );
    }
}

/// Deterministic spill directory for one task: a fixed join of node
/// identity, query id, and task id under `base_spill_path`. Pure (no I/O),
/// always non-empty, one directory per task.
pub fn build_task_spill_directory_path(
    base_spill_path: &str,
    node_ip: &str,
    node_id: &str,
    query_id: &QueryId,
    task_id: &TaskId,
) -> String {
    let base = base_spill_path.trim_end_matches('/');
    format!("{base}/{node_ip}_{node_id}/{query_id}/{task_id}/")
}

#[cfg(test)]
#[path = "task_manager_tests.rs"]
mod tests;
