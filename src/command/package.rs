//! Serializable command packages, the unit handed to a node's executor.
//!
//! A package carries everything a node needs to run a command without
//! looking at the task graph: resolved access regions, the execution target
//! and the ids of the commands it must wait for.

use serde::{Deserialize, Serialize};

use super::types::{CommandId, CommandType, NodeId};
use crate::buffer::BufferId;
use crate::core::task::{AccessMode, CollectiveGroupId, ExecutionTarget, TaskId};
use crate::error::Result;
use crate::grid::{GridBox, Subrange};

/// An access of a task command, mapped to the box of its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAccess {
    pub buffer: BufferId,
    pub mode: AccessMode,
    pub region: GridBox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CommandData {
    Nop,
    Horizon {
        task: TaskId,
    },
    Task {
        task: TaskId,
        name: String,
        target: ExecutionTarget,
        subrange: Subrange,
        accesses: Vec<ResolvedAccess>,
        collective: Option<CollectiveGroupId>,
    },
    Push {
        buffer: BufferId,
        target: NodeId,
        region: GridBox,
    },
    AwaitPush {
        buffer: BufferId,
        source: CommandId,
        source_node: NodeId,
        region: GridBox,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPkg {
    pub cid: CommandId,
    pub nid: NodeId,
    pub data: CommandData,
    pub dependencies: Vec<CommandId>,
}

impl CommandPkg {
    pub fn command_type(&self) -> CommandType {
        match self.data {
            CommandData::Nop => CommandType::Nop,
            CommandData::Horizon { .. } => CommandType::Horizon,
            CommandData::Task { .. } => CommandType::Task,
            CommandData::Push { .. } => CommandType::Push,
            CommandData::AwaitPush { .. } => CommandType::AwaitPush,
        }
    }

    /// Human-readable description: id, node, type and parameters.
    pub fn describe(&self) -> String {
        let params = match &self.data {
            CommandData::Nop => String::new(),
            CommandData::Horizon { task } => format!("task {}", task),
            CommandData::Task {
                task,
                name,
                target,
                subrange,
                ..
            } => format!("task {} '{}' on {} over {}", task, name, target, subrange),
            CommandData::Push {
                buffer,
                target,
                region,
            } => format!("buffer {} to node {}, {}", buffer, target, region),
            CommandData::AwaitPush {
                buffer,
                source,
                source_node,
                region,
            } => format!(
                "buffer {} from push {} on node {}, {}",
                buffer, source, source_node, region
            ),
        };
        if params.is_empty() {
            format!("command {} on node {} ({})", self.cid, self.nid, self.command_type())
        } else {
            format!(
                "command {} on node {} ({}: {})",
                self.cid,
                self.nid,
                self.command_type(),
                params
            )
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
