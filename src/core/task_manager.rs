//! Task submission and task-level dependency analysis.
//!
//! The task manager owns the task graph. It assigns ids, derives order and
//! anti-dependencies from the declared buffer accesses, serializes
//! collective groups, and injects horizon tasks through the horizon manager.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::buffer::{BufferId, BufferInfo, RegionMap};
use crate::command::{CommandId, NodeId};
use crate::core::dag::{insert_dependency, DependencyKind, TaskGraph};
use crate::core::task::{CollectiveGroupId, Task, TaskId, TaskSpec, TaskType};
use crate::error::{Error, Result};
use crate::grid::{GridBox, GridRegion, Subrange, MAX_DIMS};
use crate::horizon::HorizonManager;

#[derive(Debug)]
struct BufferTaskState {
    extent: [usize; MAX_DIMS],
    last_writers: RegionMap<Option<TaskId>>,
    readers: Vec<(GridBox, TaskId)>,
}

#[derive(Debug)]
pub struct TaskManager {
    num_nodes: usize,
    graph: TaskGraph,
    next_id: u64,
    buffers: BTreeMap<BufferId, BufferTaskState>,
    last_collective: HashMap<CollectiveGroupId, TaskId>,
    front: BTreeSet<TaskId>,
    epoch: TaskId,
    horizons: HorizonManager,
}

impl TaskManager {
    /// Create a task manager holding only the init task.
    pub fn new(num_nodes: usize, horizon_step: usize) -> Self {
        let mut graph = TaskGraph::new();
        graph.add_task(Task::nop(TaskId::INIT));
        Self {
            num_nodes,
            graph,
            next_id: TaskId::INIT.0 + 1,
            buffers: BTreeMap::new(),
            last_collective: HashMap::new(),
            front: BTreeSet::from([TaskId::INIT]),
            epoch: TaskId::INIT,
            horizons: HorizonManager::new(horizon_step, num_nodes),
        }
    }

    pub fn register_buffer(&mut self, info: &BufferInfo) {
        let extent = info.full_box();
        self.buffers.insert(
            info.id,
            BufferTaskState {
                extent: info.extent,
                last_writers: RegionMap::new(extent, None),
                readers: Vec::new(),
            },
        );
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn get_task(&self, id: TaskId) -> Result<&Task> {
        self.graph.get_task(id).ok_or(Error::UnknownTask(id))
    }

    /// Task every dependency-free task currently depends on.
    pub fn epoch(&self) -> TaskId {
        self.epoch
    }

    /// Tasks nothing depends on yet.
    pub fn front(&self) -> &BTreeSet<TaskId> {
        &self.front
    }

    pub fn horizons(&self) -> &HorizonManager {
        &self.horizons
    }

    /// Declared region of one access of a task, over its whole execution
    /// range.
    pub fn declared_region(&self, task: &Task, access: usize) -> Result<GridBox> {
        let a = task
            .accesses
            .get(access)
            .ok_or_else(|| Error::Validation(format!("task {} has no access #{}", task.id, access)))?;
        let state = self.buffers.get(&a.buffer).ok_or(Error::UnknownBuffer(a.buffer))?;
        Ok(a.region(&task.range, state.extent))
    }

    /// Submit a task. Returns the ids of all tasks created, which is the
    /// submitted task followed by a horizon when one became due.
    pub fn submit(&mut self, spec: TaskSpec) -> Result<Vec<TaskId>> {
        let mut spec = spec;
        match spec.task_type {
            TaskType::Collective { .. } => {
                spec.range = Subrange::from_range([self.num_nodes, 1, 1]);
            }
            TaskType::MasterNode => {
                spec.range = Subrange::from_range([1, 1, 1]);
            }
            TaskType::Nop | TaskType::Horizon => {
                return Err(Error::Validation(format!(
                    "{} tasks cannot be submitted",
                    spec.task_type
                )));
            }
            TaskType::HostCompute | TaskType::DeviceCompute => {
                if spec.range.is_empty() {
                    return Err(Error::Validation(format!(
                        "task '{}' has an empty execution range",
                        spec.debug_name
                    )));
                }
            }
        }
        for access in &spec.accesses {
            if !self.buffers.contains_key(&access.buffer) {
                return Err(Error::UnknownBuffer(access.buffer));
            }
        }

        let id = self.next_task_id();
        let task = Task::from_spec(id, spec);
        let dependencies = self.compute_dependencies(&task)?;
        self.record_accesses(&task);
        self.graph.add_task(task);
        self.attach(id, &dependencies)?;
        debug!(task = %id, dependencies = dependencies.len(), "Task submitted");

        let mut created = vec![id];
        if self.horizons.note_submission() {
            created.push(self.generate_horizon()?);
        }
        Ok(created)
    }

    fn next_task_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    fn compute_dependencies(&self, task: &Task) -> Result<BTreeMap<TaskId, DependencyKind>> {
        let mut deps: BTreeMap<TaskId, DependencyKind> = BTreeMap::new();

        for access in &task.accesses {
            let state = self
                .buffers
                .get(&access.buffer)
                .ok_or(Error::UnknownBuffer(access.buffer))?;
            let region = access.region(&task.range, state.extent);
            let writers = state.last_writers.get_box_values(&region);

            if access.mode.is_consumer() {
                for w in writers.iter().filter_map(|(_, w)| *w) {
                    insert_dependency(&mut deps, w, DependencyKind::Order);
                }
            }

            if access.mode.is_producer() {
                for (b, writer) in &writers {
                    let readers: BTreeSet<TaskId> = state
                        .readers
                        .iter()
                        .filter(|(r, _)| r.intersects(b))
                        .map(|(_, t)| *t)
                        .collect();
                    if readers.is_empty() {
                        if let Some(w) = writer {
                            insert_dependency(&mut deps, *w, DependencyKind::Order);
                        }
                    } else {
                        for r in readers {
                            insert_dependency(&mut deps, r, DependencyKind::Anti);
                        }
                    }
                }
            }
        }

        if let Some(group) = task.collective_group() {
            if let Some(prev) = self.last_collective.get(&group) {
                insert_dependency(&mut deps, *prev, DependencyKind::Order);
            }
        }

        if deps.is_empty() {
            deps.insert(self.epoch, DependencyKind::Order);
        }
        Ok(deps)
    }

    fn record_accesses(&mut self, task: &Task) {
        for access in &task.accesses {
            let Some(state) = self.buffers.get_mut(&access.buffer) else {
                continue;
            };
            let region = access.region(&task.range, state.extent);
            if access.mode.is_consumer() {
                state.readers.push((region, task.id));
            }
        }
        for access in &task.accesses {
            let Some(state) = self.buffers.get_mut(&access.buffer) else {
                continue;
            };
            if access.mode.is_producer() {
                let region = GridRegion::from_box(access.region(&task.range, state.extent));
                state.last_writers.update_region(&region, Some(task.id));
                let mut kept = Vec::with_capacity(state.readers.len());
                for (b, t) in state.readers.drain(..) {
                    let rest = GridRegion::from_box(b).difference(&region);
                    kept.extend(rest.boxes().iter().map(|r| (*r, t)));
                }
                state.readers = kept;
            }
        }
        if let Some(group) = task.collective_group() {
            self.last_collective.insert(group, task.id);
        }
    }

    fn attach(&mut self, id: TaskId, dependencies: &BTreeMap<TaskId, DependencyKind>) -> Result<()> {
        for (from, kind) in dependencies {
            self.graph.add_dependency(*from, id, *kind)?;
            self.front.remove(from);
        }
        self.front.insert(id);
        Ok(())
    }

    /// Create a horizon task depending on the whole front, then make it the
    /// only thing later tasks can depend on.
    fn generate_horizon(&mut self) -> Result<TaskId> {
        let id = self.next_task_id();
        self.graph.add_task(Task::horizon(id));
        let dependencies: BTreeMap<TaskId, DependencyKind> = self
            .front
            .iter()
            .map(|t| (*t, DependencyKind::Order))
            .collect();
        self.attach(id, &dependencies)?;

        for state in self.buffers.values_mut() {
            state.last_writers.apply_to_values(|_| Some(id));
            state.readers.clear();
        }
        for last in self.last_collective.values_mut() {
            *last = id;
        }
        self.epoch = id;
        self.horizons.seal(id)?;
        debug!(horizon = %id, "Horizon task generated");
        Ok(id)
    }

    /// Register the command implementing horizon `task` on `node`.
    pub fn attach_horizon_command(&mut self, task: TaskId, node: NodeId, command: CommandId) -> Result<()> {
        self.horizons.attach_command(task, node, command)
    }

    /// Report a finished command. Returns the horizon task that retired, if
    /// any.
    pub fn command_completed(&mut self, node: NodeId, command: CommandId) -> Result<Option<TaskId>> {
        self.horizons.command_completed(node, command)
    }

    /// Drop every task older than `horizon`.
    pub fn prune_before(&mut self, horizon: TaskId) -> usize {
        let removed = self.graph.prune_before(horizon);
        debug!(horizon = %horizon, removed, "Pruned task graph");
        removed
    }
}
