//! Abstract commands: the per-node units of work derived from tasks.

use serde::{Deserialize, Serialize};

use crate::buffer::BufferId;
use crate::core::task::TaskId;
use crate::grid::{GridBox, Subrange};

/// Identifier of a node in the cluster. Node 0 is the master node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl NodeId {
    pub const MASTER: NodeId = NodeId(0);
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a command. Ids are unique across all nodes and grow in
/// creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a command does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Nop,
    /// Execute one chunk of a task.
    Task { task: TaskId, subrange: Subrange },
    /// Send a box of a buffer to another node.
    Push {
        buffer: BufferId,
        target: NodeId,
        region: GridBox,
    },
    /// Receive a box of a buffer sent by the push `source` on `source_node`.
    AwaitPush {
        buffer: BufferId,
        source: CommandId,
        source_node: NodeId,
        region: GridBox,
    },
    Horizon,
}

/// Discriminant of [`CommandKind`], used for matching packages to jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Nop,
    Task,
    Push,
    AwaitPush,
    Horizon,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::Nop => write!(f, "nop"),
            CommandType::Task => write!(f, "task"),
            CommandType::Push => write!(f, "push"),
            CommandType::AwaitPush => write!(f, "await-push"),
            CommandType::Horizon => write!(f, "horizon"),
        }
    }
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandKind::Nop => CommandType::Nop,
            CommandKind::Task { .. } => CommandType::Task,
            CommandKind::Push { .. } => CommandType::Push,
            CommandKind::AwaitPush { .. } => CommandType::AwaitPush,
            CommandKind::Horizon => CommandType::Horizon,
        }
    }
}

/// A command in the command graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub node: NodeId,
    pub kind: CommandKind,
    /// Task this command was generated for. Pushes and await-pushes carry the
    /// consuming task, horizons their horizon task.
    pub task: Option<TaskId>,
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        self.kind.command_type()
    }
}
