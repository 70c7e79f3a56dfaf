//! Per-node executor loop.
//!
//! The executor owns the jobs of one node and drives them from a single
//! thread. Each tick it drains new packages, polls the transfer coordinator,
//! then walks the jobs in command-id order: pending jobs whose dependencies
//! are all done get started, running jobs get polled. Nothing in the loop
//! blocks; an idle tick sleeps for a short, configurable interval.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, trace};

use super::backend::ExecutionBackend;
use super::job::{JobContext, JobKind, JobState, WorkerJob};
use crate::command::{CommandId, CommandPkg, NodeId};
use crate::error::{Error, Result};
use crate::transfer::BufferTransferManager;

#[derive(Debug)]
pub enum ExecutorMessage {
    Command(CommandPkg),
    /// No more packages will follow; exit once every job is done.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    CommandCompleted { node: NodeId, command: CommandId },
    Failed { node: NodeId, reason: String },
}

/// Summary of one executor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorReport {
    pub node: NodeId,
    pub completed: u64,
    pub horizons: u64,
    pub peak_jobs: usize,
}

pub struct Executor {
    node: NodeId,
    inbox: Receiver<ExecutorMessage>,
    events: Sender<NodeEvent>,
    transfers: BufferTransferManager,
    backend: Box<dyn ExecutionBackend>,
    abort: Arc<AtomicBool>,
    idle_sleep: Duration,
    jobs: BTreeMap<CommandId, WorkerJob>,
    completed: BTreeSet<CommandId>,
    /// Every command of this node below the floor is known to be done.
    floor: Option<CommandId>,
    shutdown: bool,
    report: ExecutorReport,
}

impl Executor {
    pub fn new(
        inbox: Receiver<ExecutorMessage>,
        events: Sender<NodeEvent>,
        transfers: BufferTransferManager,
        backend: Box<dyn ExecutionBackend>,
        abort: Arc<AtomicBool>,
        idle_sleep: Duration,
    ) -> Self {
        let node = transfers.node();
        Self {
            node,
            inbox,
            events,
            transfers,
            backend,
            abort,
            idle_sleep,
            jobs: BTreeMap::new(),
            completed: BTreeSet::new(),
            floor: None,
            shutdown: false,
            report: ExecutorReport {
                node,
                ..ExecutorReport::default()
            },
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Run until shut down or until any node fails.
    ///
    /// # Errors
    /// A failure on this node is logged, announced through a
    /// [`NodeEvent::Failed`] event and raises the shared abort flag. If
    /// another node raised the flag first the result is [`Error::Aborted`].
    pub fn run(mut self) -> Result<ExecutorReport> {
        info!(node = %self.node, "Executor started");
        match self.run_loop() {
            Ok(()) => {
                info!(
                    node = %self.node,
                    completed = self.report.completed,
                    horizons = self.report.horizons,
                    "Executor finished"
                );
                Ok(self.report)
            }
            Err(Error::Aborted) => {
                debug!(node = %self.node, "Executor stopped by abort flag");
                Err(Error::Aborted)
            }
            Err(e) => {
                error!(node = %self.node, error = %e, "Node failed");
                self.abort.store(true, Ordering::SeqCst);
                let _ = self.events.send(NodeEvent::Failed {
                    node: self.node,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Err(Error::Aborted);
            }
            let received = self.drain_inbox()?;
            self.transfers.poll()?;
            let progressed = self.tick()?;

            if self.shutdown && self.jobs.is_empty() && self.transfers.pending() == 0 {
                return Ok(());
            }
            if !received && !progressed {
                std::thread::sleep(self.idle_sleep);
            }
        }
    }

    fn drain_inbox(&mut self) -> Result<bool> {
        let mut received = false;
        loop {
            match self.inbox.try_recv() {
                Ok(ExecutorMessage::Command(pkg)) => {
                    received = true;
                    self.accept(pkg)?;
                }
                Ok(ExecutorMessage::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.shutdown = true;
                    return Ok(received);
                }
                Err(TryRecvError::Empty) => return Ok(received),
            }
        }
    }

    /// Queue a package as a pending job.
    pub fn accept(&mut self, pkg: CommandPkg) -> Result<()> {
        if pkg.nid != self.node {
            return Err(Error::Validation(format!(
                "node {} was handed {}",
                self.node,
                pkg.describe()
            )));
        }
        trace!(node = %self.node, command = %pkg.cid, "Package received");
        let job = WorkerJob::for_package(pkg)?;
        self.jobs.insert(job.cid(), job);
        self.report.peak_jobs = self.report.peak_jobs.max(self.jobs.len());
        Ok(())
    }

    fn dependency_done(&self, dep: CommandId) -> bool {
        self.floor.is_some_and(|f| dep < f) || self.completed.contains(&dep)
    }

    /// Advance every job that can make progress. Returns whether any job
    /// changed state.
    pub fn tick(&mut self) -> Result<bool> {
        let mut progressed = false;
        let cids: Vec<CommandId> = self.jobs.keys().copied().collect();
        for cid in cids {
            let ready = match self.jobs.get(&cid) {
                Some(job) if job.state() == JobState::Pending => {
                    job.dependencies().iter().all(|d| self.dependency_done(*d))
                }
                Some(_) => true,
                None => false,
            };
            if !ready {
                continue;
            }
            let Some(job) = self.jobs.get_mut(&cid) else {
                continue;
            };
            let before = job.state();
            let mut ctx = JobContext {
                transfers: &mut self.transfers,
                backend: self.backend.as_mut(),
            };
            let after = job.update(&mut ctx)?;
            if after != before {
                progressed = true;
            }
            if after == JobState::Done {
                self.finish(cid)?;
            }
        }
        Ok(progressed)
    }

    fn finish(&mut self, cid: CommandId) -> Result<()> {
        let Some(job) = self.jobs.remove(&cid) else {
            return Err(Error::UnknownCommand(cid));
        };
        self.report.completed += 1;
        if job.kind() == JobKind::Horizon {
            self.report.horizons += 1;
            self.floor = Some(cid);
            self.completed = self.completed.split_off(&cid);
            debug!(node = %self.node, horizon = %cid, "Completion floor raised");
        }
        self.completed.insert(cid);
        self.events
            .send(NodeEvent::CommandCompleted {
                node: self.node,
                command: cid,
            })
            .map_err(|_| Error::Transport(format!("event channel of node {} closed", self.node)))
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Completion records still held; bounded by horizons.
    pub fn completion_records(&self) -> usize {
        self.completed.len()
    }
}
