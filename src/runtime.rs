//! In-process cluster runtime.
//!
//! The runtime plays the role of the master: it owns the task manager and
//! the command generator, registers kernels, and hands the packages of every
//! generated command to the executor thread of its node. Completion events
//! flow back over a channel; when a horizon has completed on every node the
//! runtime prunes the task graph, the command graph and the kernel registry.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info};

use crate::buffer::{BufferId, BufferInfo, BufferManager};
use crate::command::{CommandData, CommandPkg, GraphGenerator, NodeId};
use crate::config::Config;
use crate::core::task::{TaskId, TaskSpec};
use crate::core::TaskManager;
use crate::error::{Error, Result};
use crate::grid::MAX_DIMS;
use crate::print_graph;
use crate::transfer::{BufferTransferManager, InProcessTransport, Transport};
use crate::worker::{
    Executor, ExecutorMessage, ExecutorReport, HostQueue, Kernel, KernelRegistry, NodeEvent,
};

/// Outcome of a cluster run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterReport {
    pub nodes: Vec<ExecutorReport>,
    pub tasks_submitted: u64,
    pub horizons_retired: u64,
}

impl ClusterReport {
    pub fn commands_completed(&self) -> u64 {
        self.nodes.iter().map(|n| n.completed).sum()
    }
}

struct NodeHandle {
    node: NodeId,
    inbox: Sender<ExecutorMessage>,
    storage: BufferManager,
    thread: Option<JoinHandle<Result<ExecutorReport>>>,
}

pub struct Runtime {
    config: Config,
    tasks: TaskManager,
    generator: GraphGenerator,
    kernels: KernelRegistry,
    nodes: Vec<NodeHandle>,
    events: Receiver<NodeEvent>,
    abort: Arc<AtomicBool>,
    next_buffer: u64,
    tasks_submitted: u64,
    horizons_retired: u64,
    failure: Option<(NodeId, String)>,
}

impl Runtime {
    /// Start one executor thread per node and generate the init commands.
    pub fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let abort = Arc::new(AtomicBool::new(false));
        let kernels = KernelRegistry::new();
        let (events_tx, events_rx) = unbounded();

        let mut nodes = Vec::with_capacity(config.num_nodes);
        for transport in InProcessTransport::cluster(config.num_nodes) {
            let node = transport.node();
            let storage = BufferManager::new();
            let transfers = BufferTransferManager::new(Box::new(transport), storage.clone());
            let backend = HostQueue::new(node, config.host_threads, kernels.clone(), storage.clone())?;
            let (inbox_tx, inbox_rx) = unbounded();
            let executor = Executor::new(
                inbox_rx,
                events_tx.clone(),
                transfers,
                Box::new(backend),
                abort.clone(),
                config.idle_sleep(),
            );
            let thread = std::thread::Builder::new()
                .name(format!("node-{}-executor", node))
                .spawn(move || executor.run())?;
            nodes.push(NodeHandle {
                node,
                inbox: inbox_tx,
                storage,
                thread: Some(thread),
            });
        }

        let mut runtime = Self {
            tasks: TaskManager::new(config.num_nodes, config.horizon_step),
            generator: GraphGenerator::new(config.num_nodes),
            config,
            kernels,
            nodes,
            events: events_rx,
            abort,
            next_buffer: 0,
            tasks_submitted: 0,
            horizons_retired: 0,
            failure: None,
        };
        runtime.generate(TaskId::INIT)?;
        info!(
            nodes = runtime.config.num_nodes,
            horizon_step = runtime.config.horizon_step,
            "Cluster started"
        );
        Ok(runtime)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn generator(&self) -> &GraphGenerator {
        &self.generator
    }

    /// Host storage of `node`. The handle stays valid after shutdown.
    pub fn storage(&self, node: NodeId) -> Result<BufferManager> {
        self.nodes
            .get(node.0)
            .map(|n| n.storage.clone())
            .ok_or_else(|| Error::Validation(format!("no node {}", node)))
    }

    /// Create a buffer on every node. With `initial` data the buffer counts
    /// as host-initialized and every node starts with a copy.
    pub fn create_buffer(
        &mut self,
        name: &str,
        extent: [usize; MAX_DIMS],
        elem_size: usize,
        initial: Option<Vec<u8>>,
    ) -> Result<BufferId> {
        let id = BufferId(self.next_buffer);
        let info = BufferInfo::new(id, extent, elem_size)
            .host_initialized(initial.is_some())
            .with_name(name);
        for node in &self.nodes {
            node.storage.register(&info, initial.clone())?;
        }
        self.tasks.register_buffer(&info);
        self.generator.register_buffer(info);
        self.next_buffer += 1;
        debug!(buffer = %id, name, "Buffer created");
        Ok(id)
    }

    /// Submit a task together with the kernel that runs its chunks.
    ///
    /// # Errors
    /// Fails with [`Error::NodeFailed`] once any node has failed.
    pub fn submit(&mut self, spec: TaskSpec, kernel: Option<Kernel>) -> Result<TaskId> {
        self.process_events()?;
        self.check_failure()?;

        let created = self.tasks.submit(spec)?;
        let id = created
            .first()
            .copied()
            .ok_or_else(|| Error::Validation("submission created no task".to_string()))?;
        if let Some(kernel) = kernel {
            self.kernels.register(id, kernel)?;
        }
        self.tasks_submitted += 1;
        for task in created {
            if let Err(e) = self.generate(task) {
                // A dead executor shows up as a send failure; report its cause.
                self.process_events()?;
                self.check_failure()?;
                return Err(e);
            }
        }
        Ok(id)
    }

    fn generate(&mut self, task: TaskId) -> Result<()> {
        let task = self.tasks.get_task(task)?.clone();
        let packages = self.generator.build_task(&task)?;
        for pkg in packages {
            if let CommandData::Horizon { task } = pkg.data {
                self.tasks.attach_horizon_command(task, pkg.nid, pkg.cid)?;
            }
            self.dispatch(pkg)?;
        }
        Ok(())
    }

    fn dispatch(&self, pkg: CommandPkg) -> Result<()> {
        let node = self
            .nodes
            .get(pkg.nid.0)
            .ok_or_else(|| Error::Validation(format!("no node {}", pkg.nid)))?;
        node.inbox
            .send(ExecutorMessage::Command(pkg))
            .map_err(|_| Error::Transport(format!("executor of node {} is gone", node.node)))
    }

    /// Apply completion events reported so far.
    pub fn process_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                NodeEvent::CommandCompleted { node, command } => {
                    if let Some(horizon) = self.tasks.command_completed(node, command)? {
                        self.retire(horizon)?;
                    }
                }
                NodeEvent::Failed { node, reason } => {
                    if self.failure.is_none() {
                        error!(node = %node, reason = %reason, "Node reported a failure");
                        self.failure = Some((node, reason));
                    }
                }
            }
        }
        Ok(())
    }

    fn retire(&mut self, horizon: TaskId) -> Result<()> {
        let tasks = self.tasks.prune_before(horizon);
        let commands = self.generator.prune_before_horizon(horizon)?;
        let kernels = self.kernels.remove_before(horizon)?;
        self.horizons_retired += 1;
        info!(horizon = %horizon, tasks, commands, kernels, "Horizon retired");
        Ok(())
    }

    fn check_failure(&self) -> Result<()> {
        match &self.failure {
            Some((node, reason)) => Err(Error::NodeFailed {
                node: *node,
                reason: reason.clone(),
            }),
            None if self.abort.load(Ordering::SeqCst) => Err(Error::Aborted),
            None => Ok(()),
        }
    }

    pub fn task_graph_dot(&self) -> String {
        print_graph::task_graph_to_dot(self.tasks.graph())
    }

    pub fn command_graph_dot(&self) -> String {
        print_graph::command_graph_to_dot(self.generator.command_graph(), self.tasks.graph())
    }

    fn dump_graphs(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("task_graph.dot"), self.task_graph_dot())?;
        fs::write(dir.join("command_graph.dot"), self.command_graph_dot())?;
        info!(dir = %dir.display(), "Graphs written");
        Ok(())
    }

    /// Let every node finish its work, then stop the cluster.
    ///
    /// # Errors
    /// Reports the first node failure as [`Error::NodeFailed`].
    pub fn shutdown(mut self) -> Result<ClusterReport> {
        for node in &self.nodes {
            // A node that already exited has nothing left to shut down.
            let _ = node.inbox.send(ExecutorMessage::Shutdown);
        }

        let mut reports = Vec::with_capacity(self.nodes.len());
        let mut first_error = None;
        for node in &mut self.nodes {
            let Some(thread) = node.thread.take() else {
                continue;
            };
            match thread.join() {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(Error::NodeFailed {
                        node: node.node,
                        reason: "executor thread panicked".to_string(),
                    });
                }
            }
        }

        self.process_events()?;
        if self.config.debug {
            print_graph::log_graphs(self.tasks.graph(), self.generator.command_graph());
        }
        if let Some(dir) = self.config.graph_dump_path() {
            self.dump_graphs(&dir)?;
        }
        self.check_failure()?;
        if let Some(e) = first_error {
            return Err(e);
        }

        let report = ClusterReport {
            nodes: reports,
            tasks_submitted: self.tasks_submitted,
            horizons_retired: self.horizons_retired,
        };
        info!(
            tasks = report.tasks_submitted,
            commands = report.commands_completed(),
            horizons = report.horizons_retired,
            "Cluster shut down"
        );
        Ok(report)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.nodes.iter().all(|n| n.thread.is_none()) {
            return;
        }
        self.abort.store(true, Ordering::SeqCst);
        for node in &mut self.nodes {
            if let Some(thread) = node.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
