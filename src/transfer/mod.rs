//! Buffer transfer coordination.
//!
//! Pushes read a box from the node's host storage and hand it to the
//! transport. Incoming frames are matched to registered await-pushes by
//! (buffer, source node, push command) and land in host storage. Frames that
//! arrive before their await-push was registered are parked until it is.

pub mod transport;

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::buffer::{BufferId, BufferManager};
use crate::command::{CommandId, NodeId};
use crate::error::{Error, Result};
use crate::grid::{GridBox, GridRegion};

pub use transport::{DataFrame, InProcessTransport, SendHandle, Transport};

/// Handle of a push or await-push registered with the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MatchKey {
    buffer: BufferId,
    source_node: NodeId,
    push: CommandId,
}

impl MatchKey {
    fn of(frame: &DataFrame) -> Self {
        Self {
            buffer: frame.buffer,
            source_node: frame.source_node,
            push: frame.push,
        }
    }
}

#[derive(Debug)]
struct IncomingTransfer {
    key: MatchKey,
    region: GridBox,
    received: GridRegion,
}

impl IncomingTransfer {
    fn is_complete(&self) -> bool {
        self.received.area() == self.region.area()
    }
}

pub struct BufferTransferManager {
    node: NodeId,
    transport: Box<dyn Transport>,
    buffers: BufferManager,
    next_id: u64,
    outgoing: HashMap<TransferId, Box<dyn SendHandle>>,
    sent: HashSet<TransferId>,
    incoming: HashMap<TransferId, IncomingTransfer>,
    parked: Vec<DataFrame>,
}

impl BufferTransferManager {
    pub fn new(transport: Box<dyn Transport>, buffers: BufferManager) -> Self {
        Self {
            node: transport.node(),
            transport,
            buffers,
            next_id: 0,
            outgoing: HashMap::new(),
            sent: HashSet::new(),
            incoming: HashMap::new(),
            parked: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    fn next_transfer_id(&mut self) -> TransferId {
        let id = TransferId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Send `region` of `buffer` to `target` on behalf of push command `push`.
    pub fn push(&mut self, buffer: BufferId, target: NodeId, push: CommandId, region: GridBox) -> Result<TransferId> {
        let payload = self.buffers.read(buffer, &region)?;
        let frame = DataFrame {
            source_node: self.node,
            target_node: target,
            buffer,
            push,
            region,
            payload,
        };
        let handle = self.transport.send(frame)?;
        let id = self.next_transfer_id();
        self.outgoing.insert(id, handle);
        trace!(node = %self.node, transfer = %id, buffer = %buffer, target = %target, "Push started");
        Ok(id)
    }

    /// Expect `region` of `buffer` from push `push` on `source_node`.
    pub fn await_push(
        &mut self,
        buffer: BufferId,
        source_node: NodeId,
        push: CommandId,
        region: GridBox,
    ) -> Result<TransferId> {
        let id = self.next_transfer_id();
        self.incoming.insert(
            id,
            IncomingTransfer {
                key: MatchKey {
                    buffer,
                    source_node,
                    push,
                },
                region,
                received: GridRegion::new(),
            },
        );

        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|f| {
                MatchKey::of(f)
                    == MatchKey {
                        buffer,
                        source_node,
                        push,
                    }
            });
        self.parked = rest;
        for frame in matching {
            self.deliver(id, frame)?;
        }
        Ok(id)
    }

    /// Drive the transport: receive frames and advance outgoing sends.
    pub fn poll(&mut self) -> Result<()> {
        while let Some(frame) = self.transport.try_recv()? {
            if frame.target_node != self.node {
                return Err(Error::Transport(format!(
                    "node {} received a frame for node {}",
                    self.node, frame.target_node
                )));
            }
            let key = MatchKey::of(&frame);
            let target = self
                .incoming
                .iter()
                .find(|(_, t)| t.key == key && !t.is_complete())
                .map(|(id, _)| *id);
            match target {
                Some(id) => self.deliver(id, frame)?,
                None => {
                    trace!(node = %self.node, push = %frame.push, "Parking early frame");
                    self.parked.push(frame);
                }
            }
        }

        let mut done = Vec::new();
        for (id, handle) in self.outgoing.iter_mut() {
            if handle.poll()? {
                done.push(*id);
            }
        }
        for id in done {
            self.outgoing.remove(&id);
            self.sent.insert(id);
        }
        Ok(())
    }

    fn deliver(&mut self, id: TransferId, frame: DataFrame) -> Result<()> {
        let Some(transfer) = self.incoming.get_mut(&id) else {
            return Err(Error::Transfer(format!("unknown transfer {}", id)));
        };
        if !transfer.region.contains(&frame.region) {
            return Err(Error::Transfer(format!(
                "frame {} from push {} lies outside the awaited box {}",
                frame.region, frame.push, transfer.region
            )));
        }
        let incoming = GridRegion::from_box(frame.region);
        if transfer.received.intersects(&incoming) {
            return Err(Error::Transfer(format!(
                "overlapping delivery of {} from push {}",
                frame.region, frame.push
            )));
        }
        self.buffers.write(frame.buffer, &frame.region, &frame.payload)?;
        transfer.received = transfer.received.union(&incoming);
        debug!(
            node = %self.node,
            transfer = %id,
            push = %frame.push,
            region = %frame.region,
            "Frame delivered"
        );
        Ok(())
    }

    /// Whether the transfer finished. Returns true exactly once; the
    /// transfer is forgotten afterwards.
    pub fn poll_transfer(&mut self, id: TransferId) -> Result<bool> {
        if self.sent.remove(&id) {
            return Ok(true);
        }
        if self.outgoing.contains_key(&id) {
            return Ok(false);
        }
        match self.incoming.get(&id) {
            Some(t) if t.is_complete() => {
                self.incoming.remove(&id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::Transfer(format!("unknown transfer {}", id))),
        }
    }

    /// Number of registered transfers that have not been reported yet.
    pub fn pending(&self) -> usize {
        self.outgoing.len() + self.sent.len() + self.incoming.len()
    }

    pub fn parked_frames(&self) -> usize {
        self.parked.len()
    }
}
