//! Node-side execution: jobs, the executor loop and kernel backends.

pub mod backend;
pub mod executor;
pub mod job;

pub use backend::{
    CompletionHandle, ExecutionBackend, HostQueue, Kernel, KernelContext, KernelLaunch, KernelRegistry,
};
pub use executor::{Executor, ExecutorMessage, ExecutorReport, NodeEvent};
pub use job::{JobContext, JobKind, JobState, JobStats, WorkerJob};
