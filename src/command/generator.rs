//! Command graph generation.
//!
//! The generator splits each task into per-node chunks and emits the
//! commands that implement it: data transfers first, then one task command
//! per chunk with its local dependencies. It is the only writer of the buffer
//! state tracker.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use super::graph::CommandGraph;
use super::package::{CommandData, CommandPkg, ResolvedAccess};
use super::types::{CommandId, CommandKind, NodeId};
use crate::buffer::{BufferId, BufferInfo, BufferStateTracker};
use crate::core::dag::{insert_dependency, DependencyKind};
use crate::core::task::{CollectiveGroupId, Task, TaskId, TaskType};
use crate::error::{Error, Result};
use crate::grid::{GridBox, GridRegion, Subrange};

/// One chunk of a task and the accesses it resolves to.
#[derive(Debug, Clone)]
struct Chunk {
    node: NodeId,
    subrange: Subrange,
    accesses: Vec<ResolvedAccess>,
}

/// A transfer the chunk on `target` needs before it can run.
#[derive(Debug, Clone)]
struct PlannedTransfer {
    buffer: BufferId,
    source: NodeId,
    target: NodeId,
    region: GridBox,
}

#[derive(Debug)]
pub struct GraphGenerator {
    num_nodes: usize,
    cdag: CommandGraph,
    buffers: BufferStateTracker,
    epochs: Vec<Option<CommandId>>,
    last_collective: HashMap<(NodeId, CollectiveGroupId), CommandId>,
}

impl GraphGenerator {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            cdag: CommandGraph::new(),
            buffers: BufferStateTracker::new(num_nodes),
            epochs: vec![None; num_nodes],
            last_collective: HashMap::new(),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn register_buffer(&mut self, info: BufferInfo) {
        self.buffers.register_buffer(info);
    }

    pub fn command_graph(&self) -> &CommandGraph {
        &self.cdag
    }

    pub fn buffer_state(&self) -> &BufferStateTracker {
        &self.buffers
    }

    /// Command every dependency-free command on `node` waits for.
    pub fn epoch(&self, node: NodeId) -> Option<CommandId> {
        self.epochs.get(node.0).copied().flatten()
    }

    /// Generate the commands for `task` and return their packages in
    /// creation order.
    pub fn build_task(&mut self, task: &Task) -> Result<Vec<CommandPkg>> {
        let created = match task.task_type {
            TaskType::Nop => self.build_nop(task)?,
            TaskType::Horizon => self.build_horizon(task)?,
            _ => self.build_compute(task)?,
        };
        debug!(task = %task.id, commands = created.len(), "Generated commands");
        created
            .into_iter()
            .map(|(cid, data)| self.package(cid, data))
            .collect()
    }

    /// Split the execution range of `task` into per-node chunks.
    pub fn split(&self, task: &Task) -> Vec<(NodeId, Subrange)> {
        match task.task_type {
            TaskType::MasterNode => vec![(NodeId::MASTER, task.range)],
            TaskType::Collective { .. } => (0..self.num_nodes)
                .map(|n| (NodeId(n), Subrange::new([n, 0, 0], [1, 1, 1])))
                .collect(),
            _ => {
                let len = task.range.range[0];
                let count = self.num_nodes.min(len).max(1);
                let base = len / count;
                let remainder = len % count;
                let mut offset = task.range.offset[0];
                (0..count)
                    .map(|i| {
                        let size = base + usize::from(i < remainder);
                        let mut chunk = task.range;
                        chunk.offset[0] = offset;
                        chunk.range[0] = size;
                        offset += size;
                        (NodeId(i), chunk)
                    })
                    .collect()
            }
        }
    }

    fn build_nop(&mut self, task: &Task) -> Result<Vec<(CommandId, CommandData)>> {
        let mut created = Vec::with_capacity(self.num_nodes);
        for n in 0..self.num_nodes {
            let node = NodeId(n);
            let cid = self.cdag.create(node, CommandKind::Nop, Some(task.id));
            if let Some(epoch) = self.epoch(node) {
                self.cdag.add_dependency(epoch, cid, DependencyKind::Order)?;
            }
            self.epochs[n] = Some(cid);
            created.push((cid, CommandData::Nop));
        }
        Ok(created)
    }

    fn build_horizon(&mut self, task: &Task) -> Result<Vec<(CommandId, CommandData)>> {
        let mut created = Vec::with_capacity(self.num_nodes);
        for n in 0..self.num_nodes {
            let node = NodeId(n);
            let front = self.cdag.front(node);
            let cid = self.cdag.create(node, CommandKind::Horizon, Some(task.id));
            for dep in front {
                self.cdag.add_dependency(dep, cid, DependencyKind::Order)?;
            }
            self.buffers.collapse_to_horizon(node, cid)?;
            for ((owner, _), last) in self.last_collective.iter_mut() {
                if *owner == node {
                    *last = cid;
                }
            }
            self.epochs[n] = Some(cid);
            created.push((cid, CommandData::Horizon { task: task.id }));
        }
        Ok(created)
    }

    fn build_compute(&mut self, task: &Task) -> Result<Vec<(CommandId, CommandData)>> {
        let chunks = self.resolve_chunks(task)?;
        let transfers = self.plan_transfers(&chunks)?;
        let mut created = Vec::new();

        // Transfers go first so no write of this task can overtake an
        // outgoing push of the previous version.
        for t in &transfers {
            created.extend(self.emit_transfer(task.id, t)?);
        }

        let group = task.collective_group();
        for chunk in &chunks {
            let cid = self.cdag.create(
                chunk.node,
                CommandKind::Task {
                    task: task.id,
                    subrange: chunk.subrange,
                },
                Some(task.id),
            );
            self.add_task_dependencies(cid, chunk, group)?;
            created.push((
                cid,
                CommandData::Task {
                    task: task.id,
                    name: task.debug_name.clone(),
                    target: task.execution_target(),
                    subrange: chunk.subrange,
                    accesses: chunk.accesses.clone(),
                    collective: group,
                },
            ));
        }

        // Writes land in declaration order, so a later access wins on overlap.
        let task_commands: Vec<(CommandId, &Chunk)> = created
            .iter()
            .filter(|(_, data)| matches!(data, CommandData::Task { .. }))
            .map(|(cid, _)| *cid)
            .zip(chunks.iter())
            .collect();
        let access_count = chunks.first().map(|c| c.accesses.len()).unwrap_or(0);
        for i in 0..access_count {
            for (cid, chunk) in &task_commands {
                let access = chunk.accesses[i];
                if access.mode.is_producer() {
                    self.buffers.record_write(
                        access.buffer,
                        &GridRegion::from_box(access.region),
                        chunk.node,
                        *cid,
                    )?;
                }
            }
        }
        Ok(created)
    }

    fn resolve_chunks(&self, task: &Task) -> Result<Vec<Chunk>> {
        self.split(task)
            .into_iter()
            .map(|(node, subrange)| {
                let accesses = task
                    .accesses
                    .iter()
                    .map(|a| {
                        let extent = self.buffers.buffer_info(a.buffer)?.extent;
                        Ok(ResolvedAccess {
                            buffer: a.buffer,
                            mode: a.mode,
                            region: a.region(&subrange, extent),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Chunk {
                    node,
                    subrange,
                    accesses,
                })
            })
            .collect()
    }

    /// Decide every transfer of the task against the state before the task.
    fn plan_transfers(&self, chunks: &[Chunk]) -> Result<Vec<PlannedTransfer>> {
        let mut planned = Vec::new();
        for chunk in chunks {
            let mut consumed: BTreeMap<BufferId, Vec<GridBox>> = BTreeMap::new();
            for access in chunk.accesses.iter().filter(|a| a.mode.is_consumer()) {
                consumed.entry(access.buffer).or_default().push(access.region);
            }
            for (buffer, boxes) in consumed {
                let region = GridRegion::from_boxes(boxes);
                for (source, part) in self.buffers.find_sources(buffer, &region, chunk.node)? {
                    planned.extend(part.boxes().iter().map(|b| PlannedTransfer {
                        buffer,
                        source,
                        target: chunk.node,
                        region: *b,
                    }));
                }
            }
        }
        Ok(planned)
    }

    fn emit_transfer(&mut self, task: TaskId, t: &PlannedTransfer) -> Result<Vec<(CommandId, CommandData)>> {
        let region = GridRegion::from_box(t.region);

        let push = self.cdag.create(
            t.source,
            CommandKind::Push {
                buffer: t.buffer,
                target: t.target,
                region: t.region,
            },
            Some(task),
        );
        let mut deps = BTreeMap::new();
        for (_, writer) in self.buffers.last_writers(t.buffer, &region, t.source)? {
            if let Some(w) = writer {
                insert_dependency(&mut deps, w, DependencyKind::Order);
            }
        }
        self.attach(push, t.source, deps)?;
        self.buffers.record_read(t.buffer, &region, t.source, push)?;

        let await_push = self.cdag.create(
            t.target,
            CommandKind::AwaitPush {
                buffer: t.buffer,
                source: push,
                source_node: t.source,
                region: t.region,
            },
            Some(task),
        );
        let deps = self.producer_dependencies(t.buffer, &region, t.target, await_push)?;
        self.attach(await_push, t.target, deps)?;
        self.buffers
            .record_replica(t.buffer, &region, t.target, await_push)?;

        Ok(vec![
            (
                push,
                CommandData::Push {
                    buffer: t.buffer,
                    target: t.target,
                    region: t.region,
                },
            ),
            (
                await_push,
                CommandData::AwaitPush {
                    buffer: t.buffer,
                    source: push,
                    source_node: t.source,
                    region: t.region,
                },
            ),
        ])
    }

    /// Anti-dependencies on the readers of `region` on `node`, or an order
    /// dependency on the last writer where nobody read the current version.
    fn producer_dependencies(
        &self,
        buffer: BufferId,
        region: &GridRegion,
        node: NodeId,
        command: CommandId,
    ) -> Result<BTreeMap<CommandId, DependencyKind>> {
        let mut deps = BTreeMap::new();
        for (b, writer) in self.buffers.last_writers(buffer, region, node)? {
            let readers: BTreeSet<CommandId> = self
                .buffers
                .readers(buffer, &b, node)?
                .into_iter()
                .map(|(_, cid)| cid)
                .filter(|cid| *cid != command)
                .collect();
            if readers.is_empty() {
                if let Some(w) = writer.filter(|w| *w != command) {
                    insert_dependency(&mut deps, w, DependencyKind::Order);
                }
            } else {
                for r in readers {
                    insert_dependency(&mut deps, r, DependencyKind::Anti);
                }
            }
        }
        Ok(deps)
    }

    fn add_task_dependencies(
        &mut self,
        cid: CommandId,
        chunk: &Chunk,
        group: Option<CollectiveGroupId>,
    ) -> Result<()> {
        let mut deps = BTreeMap::new();
        for access in &chunk.accesses {
            let region = GridRegion::from_box(access.region);
            if access.mode.is_consumer() {
                for (_, writer) in self.buffers.last_writers(access.buffer, &region, chunk.node)? {
                    if let Some(w) = writer {
                        insert_dependency(&mut deps, w, DependencyKind::Order);
                    }
                }
            }
            if access.mode.is_producer() {
                for (from, kind) in self.producer_dependencies(access.buffer, &region, chunk.node, cid)? {
                    insert_dependency(&mut deps, from, kind);
                }
            }
        }

        if let Some(g) = group {
            if let Some(prev) = self.last_collective.insert((chunk.node, g), cid) {
                insert_dependency(&mut deps, prev, DependencyKind::Order);
            }
        }

        self.attach(cid, chunk.node, deps)?;

        for access in chunk.accesses.iter().filter(|a| a.mode.is_consumer()) {
            self.buffers.record_read(
                access.buffer,
                &GridRegion::from_box(access.region),
                chunk.node,
                cid,
            )?;
        }
        Ok(())
    }

    /// Add `deps` to `cid`, falling back to the node's epoch when empty.
    fn attach(&mut self, cid: CommandId, node: NodeId, deps: BTreeMap<CommandId, DependencyKind>) -> Result<()> {
        if deps.is_empty() {
            if let Some(epoch) = self.epoch(node) {
                self.cdag.add_dependency(epoch, cid, DependencyKind::Order)?;
            }
            return Ok(());
        }
        for (from, kind) in deps {
            self.cdag.add_dependency(from, cid, kind)?;
        }
        Ok(())
    }

    fn package(&self, cid: CommandId, data: CommandData) -> Result<CommandPkg> {
        let command = self.cdag.get(cid)?;
        Ok(CommandPkg {
            cid,
            nid: command.node,
            data,
            dependencies: self
                .cdag
                .dependencies(cid)
                .into_iter()
                .map(|(dep, _)| dep)
                .collect(),
        })
    }

    /// Drop every command older than horizon `task`.
    pub fn prune_before_horizon(&mut self, task: TaskId) -> Result<usize> {
        let removed = self.cdag.prune_before_horizon(task)?;
        debug!(horizon = %task, removed, "Pruned command graph");
        Ok(removed)
    }

    /// Check the buffer tracker invariants for every buffer.
    pub fn check_invariants(&self) -> Result<()> {
        let ids: Vec<BufferId> = self.buffers.buffers().map(|b| b.id).collect();
        for id in ids {
            self.buffers.check_invariants(id)?;
        }
        if self.epochs.iter().any(Option::is_none) && self.cdag.command_count() > 0 {
            return Err(Error::Validation(
                "commands exist before the init task was generated".to_string(),
            ));
        }
        Ok(())
    }
}
