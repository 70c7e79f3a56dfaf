//! Kernel execution backends.
//!
//! A backend launches one chunk of a task and hands back a completion handle
//! the executor polls without blocking. The bundled [`HostQueue`] runs
//! registered Rust closures on a small pool of worker threads, for host and
//! device targets alike.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use tracing::{trace, warn};

use crate::buffer::BufferManager;
use crate::command::{NodeId, ResolvedAccess};
use crate::core::task::{CollectiveGroupId, ExecutionTarget, TaskId};
use crate::error::{Error, Result};
use crate::grid::Subrange;

/// Everything needed to run one chunk of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    pub task: TaskId,
    pub name: String,
    pub node: NodeId,
    pub target: ExecutionTarget,
    pub subrange: Subrange,
    pub accesses: Vec<ResolvedAccess>,
    pub collective: Option<CollectiveGroupId>,
}

pub trait CompletionHandle: Send {
    /// Returns true once the launch has finished. Never blocks.
    fn poll(&mut self) -> Result<bool>;
}

pub trait ExecutionBackend: Send {
    fn execute(&mut self, launch: KernelLaunch) -> Result<Box<dyn CompletionHandle>>;
}

/// View of a launch handed to a kernel, with access to the node's buffers.
pub struct KernelContext {
    launch: KernelLaunch,
    buffers: BufferManager,
}

impl KernelContext {
    pub fn new(launch: KernelLaunch, buffers: BufferManager) -> Self {
        Self { launch, buffers }
    }

    pub fn node(&self) -> NodeId {
        self.launch.node
    }

    pub fn task(&self) -> TaskId {
        self.launch.task
    }

    pub fn subrange(&self) -> Subrange {
        self.launch.subrange
    }

    pub fn collective(&self) -> Option<CollectiveGroupId> {
        self.launch.collective
    }

    pub fn access(&self, index: usize) -> Result<&ResolvedAccess> {
        self.launch.accesses.get(index).ok_or_else(|| {
            Error::Kernel(format!(
                "task {} declares no access #{}",
                self.launch.task, index
            ))
        })
    }

    /// Raw bytes of the region of access `index`.
    pub fn read(&self, index: usize) -> Result<Vec<u8>> {
        let access = self.access(index)?;
        self.buffers.read(access.buffer, &access.region)
    }

    /// Overwrite the region of access `index`.
    pub fn write(&self, index: usize, bytes: &[u8]) -> Result<()> {
        let access = self.access(index)?;
        if !access.mode.is_producer() {
            return Err(Error::Kernel(format!(
                "task {} writes through {} access #{}",
                self.launch.task, access.mode, index
            )));
        }
        self.buffers.write(access.buffer, &access.region, bytes)
    }

    pub fn read_u64(&self, index: usize) -> Result<Vec<u64>> {
        let bytes = self.read(index)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                u64::from_le_bytes(raw)
            })
            .collect())
    }

    pub fn write_u64(&self, index: usize, values: &[u64]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write(index, &bytes)
    }
}

pub type Kernel = Arc<dyn Fn(&KernelContext) -> Result<()> + Send + Sync>;

/// Kernels of live tasks, shared by every node of the process.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: Arc<RwLock<HashMap<TaskId, Kernel>>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: TaskId, kernel: Kernel) -> Result<()> {
        self.kernels
            .write()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?
            .insert(task, kernel);
        Ok(())
    }

    pub fn get(&self, task: TaskId) -> Result<Option<Kernel>> {
        Ok(self
            .kernels
            .read()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?
            .get(&task)
            .cloned())
    }

    /// Forget the kernels of tasks older than `task`.
    pub fn remove_before(&self, task: TaskId) -> Result<usize> {
        let mut kernels = self
            .kernels
            .write()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        let before = kernels.len();
        kernels.retain(|id, _| *id >= task);
        Ok(before - kernels.len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self
            .kernels
            .read()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRegistry").finish_non_exhaustive()
    }
}

struct HostJob {
    context: KernelContext,
    kernel: Kernel,
    done: Sender<Result<()>>,
}

/// A launch without a kernel has nothing to wait for.
struct Finished;

impl CompletionHandle for Finished {
    fn poll(&mut self) -> Result<bool> {
        Ok(true)
    }
}

struct QueuedLaunch {
    done: Receiver<Result<()>>,
}

impl CompletionHandle for QueuedLaunch {
    fn poll(&mut self) -> Result<bool> {
        match self.done.try_recv() {
            Ok(result) => result.map(|_| true),
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => {
                Err(Error::Kernel("host queue worker went away".to_string()))
            }
        }
    }
}

/// Thread pool running host kernels of one node.
pub struct HostQueue {
    node: NodeId,
    jobs: Option<Sender<HostJob>>,
    workers: Vec<JoinHandle<()>>,
    registry: KernelRegistry,
    buffers: BufferManager,
}

impl HostQueue {
    pub fn new(node: NodeId, threads: usize, registry: KernelRegistry, buffers: BufferManager) -> Result<Self> {
        let (tx, rx) = unbounded::<HostJob>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("node-{}-host-{}", node, i))
                .spawn(move || {
                    for job in rx.iter() {
                        let result = catch_unwind(AssertUnwindSafe(|| (job.kernel)(&job.context)))
                            .unwrap_or_else(|_| {
                                Err(Error::Kernel(format!(
                                    "kernel of task {} panicked",
                                    job.context.task()
                                )))
                            });
                        let _ = job.done.send(result);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            node,
            jobs: Some(tx),
            workers,
            registry,
            buffers,
        })
    }
}

impl ExecutionBackend for HostQueue {
    fn execute(&mut self, launch: KernelLaunch) -> Result<Box<dyn CompletionHandle>> {
        let Some(kernel) = self.registry.get(launch.task)? else {
            trace!(node = %self.node, task = %launch.task, "No kernel registered, nothing to run");
            return Ok(Box::new(Finished));
        };
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::Kernel("host queue is shut down".to_string()))?;
        let (done_tx, done_rx) = bounded(1);
        jobs.send(HostJob {
            context: KernelContext::new(launch, self.buffers.clone()),
            kernel,
            done: done_tx,
        })
        .map_err(|_| Error::Kernel("host queue workers exited".to_string()))?;
        Ok(Box::new(QueuedLaunch { done: done_rx }))
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(node = %self.node, "Host queue worker panicked");
            }
        }
    }
}
