//! Output-buffer control protocol.
//!
//! Responsibilities:
//! - define the result shape and pending-request mechanics for result polls;
//! - state the controller contract consumed by the task manager
//!   ([`OutputBufferManager`]);
//! - provide the in-process controller used by local execution and tests.
//!
//! Pages are opaque byte payloads; their encoding is owned by the execution
//! engine. Tokens index pages per buffer: a page is retained until the
//! coordinator acknowledges a token past it, so a retried token re-reads the
//! same data and nothing is lost or duplicated across retries.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use flq_common::TaskId;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One result-poll answer: pages at `token` and the token to poll next.
pub struct BufferResult {
    /// Token this result answers.
    pub token: i64,
    /// Token the consumer should poll next.
    pub next_token: i64,
    /// Result pages, oldest first. Empty when no data was available.
    pub pages: Vec<Vec<u8>>,
    /// Whether the buffer is exhausted: no data at or past `next_token`
    /// will ever exist.
    pub complete: bool,
}

impl BufferResult {
    /// Empty, not-completed answer for `token`; the coordinator retries
    /// with the same token.
    pub fn empty(token: i64) -> Self {
        Self {
            token,
            next_token: token,
            pages: Vec::new(),
            complete: false,
        }
    }
}

#[derive(Debug)]
/// A result poll that could not be satisfied synchronously; fulfilled later
/// by `get_data_for_result_requests` or abandoned when superseded.
pub struct ResultRequest {
    /// Task whose buffer is being polled.
    pub task_id: TaskId,
    /// Buffer being polled.
    pub buffer_id: i64,
    /// Token being polled.
    pub token: i64,
    /// Soft cap on returned payload bytes.
    pub max_bytes: u64,
    completion: oneshot::Sender<BufferResult>,
}

impl ResultRequest {
    /// New pending request plus the receiver its poll future awaits.
    pub fn new(
        task_id: TaskId,
        buffer_id: i64,
        token: i64,
        max_bytes: u64,
    ) -> (Self, oneshot::Receiver<BufferResult>) {
        let (completion, rx) = oneshot::channel();
        (
            Self {
                task_id,
                buffer_id,
                token,
                max_bytes,
                completion,
            },
            rx,
        )
    }

    /// Resolve the parked poll. A dropped receiver (poll timed out or was
    /// canceled) is fine; the answer is simply discarded.
    pub fn fulfill(self, result: BufferResult) {
        let _ = self.completion.send(result);
    }
}

/// Control surface of the output-buffer mechanism consumed by the task
/// manager. The storage/transport of pages lives behind this trait.
pub trait OutputBufferManager: Send + Sync {
    /// Data for `(buffer_id, token)` up to `max_bytes`. Returns `None` when
    /// the controller has no record of the task (e.g. already torn down);
    /// a known buffer with nothing new yields an empty, not-completed
    /// result. At least one page is returned when any is available,
    /// regardless of `max_bytes`.
    fn get_data(
        &self,
        task_id: &TaskId,
        buffer_id: i64,
        token: i64,
        max_bytes: u64,
    ) -> Option<BufferResult>;

    /// Release pages below `token`. Monotonic: a token at or below the
    /// current watermark is a no-op, never a rollback.
    fn acknowledge(&self, task_id: &TaskId, buffer_id: i64, token: i64);

    /// Discard the buffer. Idempotent on an already-aborted buffer.
    fn abort_buffer(&self, task_id: &TaskId, buffer_id: i64);

    /// Drop all buffer state for the task.
    fn remove_task(&self, task_id: &TaskId);
}

#[derive(Debug, Default)]
struct BufferState {
    pages: VecDeque<Vec<u8>>,
    /// Token of the first retained page.
    base_token: i64,
    /// Total pages ever added; the end token of the stream once finished.
    added: i64,
    no_more_pages: bool,
    aborted: bool,
}

#[derive(Debug, Default)]
struct TaskBuffers {
    buffers: HashMap<i64, BufferState>,
}

#[derive(Debug, Default)]
/// In-process [`OutputBufferManager`] backed by per-buffer page queues.
pub struct InMemoryBufferManager {
    tasks: Mutex<HashMap<TaskId, TaskBuffers>>,
}

impl InMemoryBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<TaskId, TaskBuffers>> {
        self.tasks.lock().expect("buffer state lock poisoned")
    }

    /// Declare a task and its output buffers. Idempotent.
    pub fn register_task(&self, task_id: &TaskId, buffer_ids: &[i64]) {
        let mut tasks = self.locked();
        let entry = tasks.entry(task_id.clone()).or_default();
        for id in buffer_ids {
            entry.buffers.entry(*id).or_default();
        }
    }

    /// Append one page produced by the execution engine. Pages for an
    /// aborted buffer are dropped.
    pub fn add_page(&self, task_id: &TaskId, buffer_id: i64, page: Vec<u8>) {
        let mut tasks = self.locked();
        let buffer = tasks
            .entry(task_id.clone())
            .or_default()
            .buffers
            .entry(buffer_id)
            .or_default();
        if buffer.aborted {
            return;
        }
        buffer.pages.push_back(page);
        buffer.added += 1;
    }

    /// Mark the buffer's page stream finished.
    pub fn set_no_more_pages(&self, task_id: &TaskId, buffer_id: i64) {
        let mut tasks = self.locked();
        let buffer = tasks
            .entry(task_id.clone())
            .or_default()
            .buffers
            .entry(buffer_id)
            .or_default();
        buffer.no_more_pages = true;
    }
}

impl OutputBufferManager for InMemoryBufferManager {
    fn get_data(
        &self,
        task_id: &TaskId,
        buffer_id: i64,
        token: i64,
        max_bytes: u64,
    ) -> Option<BufferResult> {
        let tasks = self.locked();
        let task = tasks.get(task_id)?;
        let Some(buffer) = task.buffers.get(&buffer_id) else {
            // Task known, buffer not declared yet: no data so far.
            return Some(BufferResult::empty(token));
        };
        if buffer.aborted {
            return Some(BufferResult {
                token,
                next_token: token,
                pages: Vec::new(),
                complete: true,
            });
        }
        // A token below the retained window re-reads nothing; well-behaved
        // consumers never regress past their own acknowledgements.
        let start = token.max(buffer.base_token);
        let offset = (start - buffer.base_token) as usize;
        let mut pages = Vec::new();
        let mut bytes = 0u64;
        for page in buffer.pages.iter().skip(offset) {
            if !pages.is_empty() && bytes + page.len() as u64 > max_bytes {
                break;
            }
            bytes += page.len() as u64;
            pages.push(page.clone());
        }
        let next_token = start + pages.len() as i64;
        Some(BufferResult {
            token,
            next_token,
            pages,
            complete: buffer.no_more_pages && next_token >= buffer.added,
        })
    }

    fn acknowledge(&self, task_id: &TaskId, buffer_id: i64, token: i64) {
        let mut tasks = self.locked();
        let Some(buffer) = tasks
            .get_mut(task_id)
            .and_then(|t| t.buffers.get_mut(&buffer_id))
        else {
            return;
        };
        let upto = token.min(buffer.added);
        while buffer.base_token < upto && !buffer.pages.is_empty() {
            buffer.pages.pop_front();
            buffer.base_token += 1;
        }
    }

    fn abort_buffer(&self, task_id: &TaskId, buffer_id: i64) {
        let mut tasks = self.locked();
        let Some(buffer) = tasks
            .get_mut(task_id)
            .and_then(|t| t.buffers.get_mut(&buffer_id))
        else {
            return;
        };
        if !buffer.aborted {
            debug!(task_id = %task_id, buffer_id, "output buffer aborted");
        }
        buffer.aborted = true;
        buffer.no_more_pages = true;
        buffer.pages.clear();
    }

    fn remove_task(&self, task_id: &TaskId) {
        self.locked().remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_pages(pages: &[&[u8]]) -> (InMemoryBufferManager, TaskId) {
        let manager = InMemoryBufferManager::new();
        let task_id = TaskId::from("q1.0.0.0");
        manager.register_task(&task_id, &[0]);
        for page in pages {
            manager.add_page(&task_id, 0, page.to_vec());
        }
        (manager, task_id)
    }

    #[test]
    fn retried_token_rereads_same_pages() {
        let (manager, task_id) = manager_with_pages(&[b"a", b"b"]);
        let first = manager.get_data(&task_id, 0, 0, 1 << 20).expect("data");
        let retry = manager.get_data(&task_id, 0, 0, 1 << 20).expect("data");
        assert_eq!(first.pages, retry.pages);
        assert_eq!(first.next_token, 2);
    }

    #[test]
    fn acknowledge_is_monotonic() {
        let (manager, task_id) = manager_with_pages(&[b"a", b"b", b"c"]);
        manager.acknowledge(&task_id, 0, 2);
        manager.acknowledge(&task_id, 0, 1);
        let result = manager.get_data(&task_id, 0, 2, 1 << 20).expect("data");
        assert_eq!(result.pages, vec![b"c".to_vec()]);
        // released pages stay released
        let clamped = manager.get_data(&task_id, 0, 0, 1 << 20).expect("data");
        assert_eq!(clamped.pages, vec![b"c".to_vec()]);
    }

    #[test]
    fn max_bytes_returns_at_least_one_page() {
        let (manager, task_id) = manager_with_pages(&[b"0123456789", b"x"]);
        let result = manager.get_data(&task_id, 0, 0, 1).expect("data");
        assert_eq!(result.pages.len(), 1);
        assert_eq!(result.next_token, 1);
    }

    #[test]
    fn complete_only_after_no_more_pages_drained() {
        let (manager, task_id) = manager_with_pages(&[b"a"]);
        let open = manager.get_data(&task_id, 0, 1, 1 << 20).expect("data");
        assert!(!open.complete);
        manager.set_no_more_pages(&task_id, 0);
        let done = manager.get_data(&task_id, 0, 1, 1 << 20).expect("data");
        assert!(done.complete);
        assert!(done.pages.is_empty());
    }

    #[test]
    fn abort_is_idempotent_and_completes_stream() {
        let (manager, task_id) = manager_with_pages(&[b"a"]);
        manager.abort_buffer(&task_id, 0);
        manager.abort_buffer(&task_id, 0);
        let result = manager.get_data(&task_id, 0, 0, 1 << 20).expect("data");
        assert!(result.complete);
        assert!(result.pages.is_empty());
    }

    #[test]
    fn unknown_task_has_no_record() {
        let manager = InMemoryBufferManager::new();
        assert!(manager
            .get_data(&TaskId::from("q9.0.0.0"), 0, 0, 1 << 20)
            .is_none());
    }
}
