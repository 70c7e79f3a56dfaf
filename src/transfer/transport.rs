//! Byte transport between nodes.
//!
//! A transport moves opaque [`DataFrame`]s without blocking. The bundled
//! [`InProcessTransport`] connects the nodes of one process through
//! crossbeam channels.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::buffer::BufferId;
use crate::command::{CommandId, NodeId};
use crate::error::{Error, Result};
use crate::grid::GridBox;

/// One box of buffer data travelling from a push to an await-push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub buffer: BufferId,
    /// The push command that produced the frame.
    pub push: CommandId,
    pub region: GridBox,
    pub payload: Vec<u8>,
}

/// Completion handle of one outgoing frame.
pub trait SendHandle: Send {
    /// Returns true once the frame has left this node.
    fn poll(&mut self) -> Result<bool>;
}

pub trait Transport: Send {
    fn node(&self) -> NodeId;

    fn send(&mut self, frame: DataFrame) -> Result<Box<dyn SendHandle>>;

    /// Next received frame, if any. Never blocks.
    fn try_recv(&mut self) -> Result<Option<DataFrame>>;
}

/// Channel sends complete as soon as they are enqueued.
struct SentFrame;

impl SendHandle for SentFrame {
    fn poll(&mut self) -> Result<bool> {
        Ok(true)
    }
}

pub struct InProcessTransport {
    node: NodeId,
    peers: Vec<Sender<DataFrame>>,
    inbox: Receiver<DataFrame>,
}

impl InProcessTransport {
    /// Create one connected transport per node.
    pub fn cluster(num_nodes: usize) -> Vec<InProcessTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_nodes).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(n, inbox)| InProcessTransport {
                node: NodeId(n),
                peers: senders.clone(),
                inbox,
            })
            .collect()
    }
}

impl Transport for InProcessTransport {
    fn node(&self) -> NodeId {
        self.node
    }

    fn send(&mut self, frame: DataFrame) -> Result<Box<dyn SendHandle>> {
        let peer = self.peers.get(frame.target_node.0).ok_or_else(|| {
            Error::Transport(format!("no route from node {} to node {}", self.node, frame.target_node))
        })?;
        let target = frame.target_node;
        peer.send(frame)
            .map_err(|_| Error::Transport(format!("node {} is no longer reachable", target)))?;
        Ok(Box::new(SentFrame))
    }

    fn try_recv(&mut self) -> Result<Option<DataFrame>> {
        match self.inbox.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Transport(format!(
                "inbox of node {} disconnected",
                self.node
            ))),
        }
    }
}
