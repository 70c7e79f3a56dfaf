//! Buffer version tracking for the command graph generator.
//!
//! Three views are kept per buffer:
//! - the global ownership map: which node (and which command) produced the
//!   newest version of every box;
//! - the replica map: which nodes currently hold that newest version;
//! - per node, the local last-writer map and the readers since the last write,
//!   which is what command-level dependencies are derived from.
//!
//! The generator is the only writer. Nothing in here performs I/O.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use super::{BufferId, BufferInfo, RegionMap};
use crate::command::{CommandId, NodeId};
use crate::error::{Error, Result};
use crate::grid::{GridBox, GridRegion};

/// Producer of the newest version of a box. `command` is `None` for the
/// buffer's initial contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Producer {
    pub node: NodeId,
    pub command: Option<CommandId>,
}

impl Producer {
    fn initial() -> Self {
        Self {
            node: NodeId::MASTER,
            command: None,
        }
    }
}

/// One entry of the ownership map, clipped to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerEntry {
    pub region: GridBox,
    pub node: NodeId,
    pub command: Option<CommandId>,
}

#[derive(Debug, Clone)]
struct NodeState {
    last_writers: RegionMap<Option<CommandId>>,
    readers: Vec<(GridBox, CommandId)>,
}

impl NodeState {
    fn new(extent: GridBox) -> Self {
        Self {
            last_writers: RegionMap::new(extent, None),
            readers: Vec::new(),
        }
    }

    fn drop_readers(&mut self, region: &GridRegion) {
        let mut kept = Vec::with_capacity(self.readers.len());
        for (b, cid) in self.readers.drain(..) {
            let rest = GridRegion::from_box(b).difference(region);
            kept.extend(rest.boxes().iter().map(|r| (*r, cid)));
        }
        self.readers = kept;
    }
}

#[derive(Debug, Clone)]
struct BufferState {
    info: BufferInfo,
    ownership: RegionMap<Producer>,
    replicas: RegionMap<BTreeSet<NodeId>>,
    nodes: Vec<NodeState>,
}

#[derive(Debug, Clone)]
pub struct BufferStateTracker {
    num_nodes: usize,
    buffers: BTreeMap<BufferId, BufferState>,
}

impl BufferStateTracker {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            buffers: BTreeMap::new(),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Start tracking a buffer. Its initial contents belong to the master
    /// node and are valid everywhere.
    pub fn register_buffer(&mut self, info: BufferInfo) {
        let extent = info.full_box();
        let all_nodes: BTreeSet<NodeId> = (0..self.num_nodes).map(NodeId).collect();
        let state = BufferState {
            ownership: RegionMap::new(extent, Producer::initial()),
            replicas: RegionMap::new(extent, all_nodes),
            nodes: (0..self.num_nodes).map(|_| NodeState::new(extent)).collect(),
            info,
        };
        self.buffers.insert(state.info.id, state);
    }

    pub fn buffer_info(&self, buffer: BufferId) -> Result<&BufferInfo> {
        Ok(&self.buffer(buffer)?.info)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &BufferInfo> {
        self.buffers.values().map(|s| &s.info)
    }

    /// `command` on `node` produced a new version of `region`.
    pub fn record_write(
        &mut self,
        buffer: BufferId,
        region: &GridRegion,
        node: NodeId,
        command: CommandId,
    ) -> Result<()> {
        let state = self.buffer_mut(buffer)?;
        state.ownership.update_region(
            region,
            Producer {
                node,
                command: Some(command),
            },
        );
        state
            .replicas
            .update_region(region, BTreeSet::from([node]));
        let local = node_mut(state, node)?;
        local.last_writers.update_region(region, Some(command));
        local.drop_readers(region);
        Ok(())
    }

    /// The ownership entries covering `region`, clipped to it.
    pub fn find_producers(&self, buffer: BufferId, region: &GridRegion) -> Result<Vec<ProducerEntry>> {
        let state = self.buffer(buffer)?;
        Ok(state
            .ownership
            .get_region_values(region)
            .into_iter()
            .map(|(b, p)| ProducerEntry {
                region: b,
                node: p.node,
                command: p.command,
            })
            .collect())
    }

    /// Pick the nodes that must send the parts of `region` that are not valid
    /// on `node`.
    ///
    /// Sources are chosen greedily: the node holding the largest share of the
    /// missing data goes first, ties go to the producing owner and then to the
    /// lowest node id. The returned regions are disjoint.
    pub fn find_sources(
        &self,
        buffer: BufferId,
        region: &GridRegion,
        node: NodeId,
    ) -> Result<Vec<(NodeId, GridRegion)>> {
        let state = self.buffer(buffer)?;
        let mut missing: Vec<(GridBox, BTreeSet<NodeId>)> = state
            .replicas
            .get_region_values(region)
            .into_iter()
            .filter(|(_, holders)| !holders.contains(&node))
            .collect();

        if !missing.is_empty() && !state.info.host_initialized {
            for (b, _) in &missing {
                let never_written = state
                    .ownership
                    .get_box_values(b)
                    .iter()
                    .all(|(_, p)| p.command.is_none());
                if never_written {
                    warn!(buffer = %buffer, region = %b, "Reading never-written buffer data");
                }
            }
        }

        let mut sources = Vec::new();
        while !missing.is_empty() {
            let mut coverage: BTreeMap<NodeId, (usize, usize)> = BTreeMap::new();
            for (b, holders) in &missing {
                let owners = state.ownership.get_box_values(b);
                for holder in holders {
                    let entry = coverage.entry(*holder).or_default();
                    entry.0 += b.area();
                    entry.1 += owners
                        .iter()
                        .filter(|(_, p)| p.node == *holder)
                        .map(|(ob, _)| ob.area())
                        .sum::<usize>();
                }
            }
            // Highest coverage, then most owned, then lowest id.
            let Some(best) = coverage
                .iter()
                .max_by(|a, b| {
                    a.1 .0
                        .cmp(&b.1 .0)
                        .then(a.1 .1.cmp(&b.1 .1))
                        .then(b.0.cmp(a.0))
                })
                .map(|(n, _)| *n)
            else {
                return Err(Error::Validation(format!(
                    "buffer {} has data with no valid replica",
                    buffer
                )));
            };

            let (taken, rest): (Vec<_>, Vec<_>) =
                missing.into_iter().partition(|(_, h)| h.contains(&best));
            sources.push((best, GridRegion::from_boxes(taken.into_iter().map(|(b, _)| b))));
            missing = rest;
        }
        Ok(sources)
    }

    /// `node` received `region` through the await-push `command`.
    pub fn record_replica(
        &mut self,
        buffer: BufferId,
        region: &GridRegion,
        node: NodeId,
        command: CommandId,
    ) -> Result<()> {
        let state = self.buffer_mut(buffer)?;
        for (b, mut holders) in state.replicas.get_region_values(region) {
            holders.insert(node);
            state.replicas.update_box(&b, holders);
        }
        let local = node_mut(state, node)?;
        local.last_writers.update_region(region, Some(command));
        local.drop_readers(region);
        Ok(())
    }

    /// `command` on `node` reads `region`.
    pub fn record_read(
        &mut self,
        buffer: BufferId,
        region: &GridRegion,
        node: NodeId,
        command: CommandId,
    ) -> Result<()> {
        let local = node_mut(self.buffer_mut(buffer)?, node)?;
        local
            .readers
            .extend(region.boxes().iter().map(|b| (*b, command)));
        Ok(())
    }

    /// Local last writers of `region` on `node`. `None` stands for the
    /// node's epoch.
    pub fn last_writers(
        &self,
        buffer: BufferId,
        region: &GridRegion,
        node: NodeId,
    ) -> Result<Vec<(GridBox, Option<CommandId>)>> {
        let local = node_ref(self.buffer(buffer)?, node)?;
        Ok(local.last_writers.get_region_values(region))
    }

    /// Readers on `node` of any part of `b` since it was last written,
    /// clipped to `b`.
    pub fn readers(&self, buffer: BufferId, b: &GridBox, node: NodeId) -> Result<Vec<(GridBox, CommandId)>> {
        let local = node_ref(self.buffer(buffer)?, node)?;
        Ok(local
            .readers
            .iter()
            .filter_map(|(r, cid)| {
                let isect = r.intersection(b);
                (!isect.is_empty()).then_some((isect, *cid))
            })
            .collect())
    }

    /// The part of the buffer whose newest version is present on `node`.
    pub fn valid_region(&self, buffer: BufferId, node: NodeId) -> Result<GridRegion> {
        let state = self.buffer(buffer)?;
        Ok(GridRegion::from_boxes(
            state
                .replicas
                .entries()
                .iter()
                .filter(|(_, holders)| holders.contains(&node))
                .map(|(b, _)| *b),
        ))
    }

    /// Replace every local writer and reader on `node` by the horizon
    /// command, for all buffers.
    pub fn collapse_to_horizon(&mut self, node: NodeId, horizon: CommandId) -> Result<()> {
        for state in self.buffers.values_mut() {
            let local = node_mut(state, node)?;
            local.last_writers.apply_to_values(|_| Some(horizon));
            local.readers.clear();
        }
        Ok(())
    }

    /// Verify the structural invariants of one buffer.
    pub fn check_invariants(&self, buffer: BufferId) -> Result<()> {
        let state = self.buffer(buffer)?;
        if !state.ownership.is_disjoint_cover() {
            return Err(Error::Validation(format!(
                "ownership map of buffer {} is not a disjoint cover",
                buffer
            )));
        }
        if !state.replicas.is_disjoint_cover() {
            return Err(Error::Validation(format!(
                "replica map of buffer {} is not a disjoint cover",
                buffer
            )));
        }
        if let Some((b, _)) = state.replicas.entries().iter().find(|(_, h)| h.is_empty()) {
            return Err(Error::Validation(format!(
                "box {} of buffer {} is valid on no node",
                b, buffer
            )));
        }
        for (b, p) in state.ownership.entries() {
            let held = state
                .replicas
                .get_box_values(b)
                .iter()
                .all(|(_, h)| h.contains(&p.node));
            if !held {
                return Err(Error::Validation(format!(
                    "owner {} of box {} in buffer {} lost its copy",
                    p.node, b, buffer
                )));
            }
        }
        Ok(())
    }

    fn buffer(&self, buffer: BufferId) -> Result<&BufferState> {
        self.buffers.get(&buffer).ok_or(Error::UnknownBuffer(buffer))
    }

    fn buffer_mut(&mut self, buffer: BufferId) -> Result<&mut BufferState> {
        self.buffers
            .get_mut(&buffer)
            .ok_or(Error::UnknownBuffer(buffer))
    }
}

fn node_ref(state: &BufferState, node: NodeId) -> Result<&NodeState> {
    state
        .nodes
        .get(node.0)
        .ok_or_else(|| Error::Validation(format!("node {} is outside the cluster", node)))
}

fn node_mut(state: &mut BufferState, node: NodeId) -> Result<&mut NodeState> {
    state
        .nodes
        .get_mut(node.0)
        .ok_or_else(|| Error::Validation(format!("node {} is outside the cluster", node)))
}
