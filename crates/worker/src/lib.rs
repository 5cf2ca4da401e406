//! Per-node task coordination for the FlintQuery execution worker.
//!
//! Architecture role:
//! - owns the lifecycle of coordinator-dispatched tasks on one worker;
//! - mediates between polling control-plane calls and the execution
//!   engine's driver threads via long-poll waiters;
//! - runs the output-buffer control protocol (fetch/acknowledge/abort);
//! - reaps terminal tasks and arbitrates driver-thread fairness.
//!
//! Transport routing, wire formats, fragment execution, and buffer storage
//! are external collaborators reached through the seams in [`execution`]
//! and [`buffer`].
//!
//! Key modules:
//! - [`task`]
//! - [`task_manager`]
//! - [`query_context`]
//! - [`buffer`]
//! - [`execution`]

pub mod buffer;
pub mod execution;
pub mod query_context;
pub mod task;
pub mod task_manager;

pub use buffer::{BufferResult, InMemoryBufferManager, OutputBufferManager, ResultRequest};
pub use execution::{
    BatchTaskUpdateRequest, FragmentExecutor, OutputBuffers, PlanFragment, ScheduledSplit,
    TaskSource, TaskUpdateRequest,
};
pub use query_context::{QueryContext, QueryContextManager};
pub use task::{
    DriverHandle, ErrorInfo, TaskInfo, TaskState, TaskStats, TaskStatus, WorkerTask,
};
pub use task_manager::{
    build_task_spill_directory_path, DriverCountStats, TaskManager, TaskMap,
};
