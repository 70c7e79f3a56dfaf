//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Driving the task manager and command generator together, the way the
//!   runtime does, without starting executors
//! - Cluster configurations tuned for fast tests
//! - Decoding buffer contents

use std::collections::{BTreeSet, HashMap};

use tessera::buffer::{BufferId, BufferInfo};
use tessera::command::{CommandPkg, CommandType, GraphGenerator, NodeId};
use tessera::config::Config;
use tessera::core::{TaskGraph, TaskId, TaskManager, TaskSpec};

/// Task manager plus generator, fed one submission at a time.
pub struct Pipeline {
    pub tasks: TaskManager,
    pub generator: GraphGenerator,
    /// Packages of every task generated so far.
    pub packages: HashMap<TaskId, Vec<CommandPkg>>,
}

impl Pipeline {
    pub fn new(num_nodes: usize, horizon_step: usize) -> Self {
        let tasks = TaskManager::new(num_nodes, horizon_step);
        let mut generator = GraphGenerator::new(num_nodes);
        let init = tasks.get_task(TaskId::INIT).unwrap().clone();
        let init_pkgs = generator.build_task(&init).unwrap();
        let mut packages = HashMap::new();
        packages.insert(TaskId::INIT, init_pkgs);
        Self {
            tasks,
            generator,
            packages,
        }
    }

    /// Register a one-dimensional buffer of `len` u64 elements.
    pub fn buffer(&mut self, id: u64, len: usize) -> BufferId {
        let info = BufferInfo::new(BufferId(id), [len, 1, 1], 8);
        self.tasks.register_buffer(&info);
        self.generator.register_buffer(info);
        BufferId(id)
    }

    /// Submit a task and generate commands for it and any horizon it
    /// triggered. Returns the created task ids.
    pub fn submit(&mut self, spec: TaskSpec) -> Vec<TaskId> {
        let created = self.tasks.submit(spec).unwrap();
        for id in &created {
            let task = self.tasks.get_task(*id).unwrap().clone();
            let pkgs = self.generator.build_task(&task).unwrap();
            self.packages.insert(*id, pkgs);
        }
        created
    }

    pub fn packages(&self, task: TaskId) -> &[CommandPkg] {
        self.packages.get(&task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Packages of `task` with the given type.
    pub fn of_type(&self, task: TaskId, ty: CommandType) -> Vec<&CommandPkg> {
        self.packages(task)
            .iter()
            .filter(|p| p.command_type() == ty)
            .collect()
    }

    /// The task command of `task` on `node`.
    pub fn task_command(&self, task: TaskId, node: NodeId) -> &CommandPkg {
        self.of_type(task, CommandType::Task)
            .into_iter()
            .find(|p| p.nid == node)
            .unwrap_or_else(|| panic!("task {} has no command on node {}", task, node))
    }
}

/// Whether `to` transitively depends on `from` in the task graph.
pub fn reaches(graph: &TaskGraph, from: TaskId, to: TaskId) -> bool {
    let mut stack = vec![to];
    let mut seen = BTreeSet::new();
    while let Some(current) = stack.pop() {
        if current == from {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        for (dep, _) in graph.get_dependencies(current) {
            if dep >= from {
                stack.push(dep);
            }
        }
    }
    false
}

/// Config for an in-process cluster that polls aggressively.
pub fn cluster_config(num_nodes: usize, horizon_step: usize) -> Config {
    Config {
        num_nodes,
        horizon_step,
        host_threads: 2,
        idle_sleep_us: 10,
        ..Config::default()
    }
}

pub fn decode_u64(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}
