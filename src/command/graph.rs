//! Command graph: the per-node commands of all live tasks.
//!
//! Commands live in an arena keyed by id. Dependencies only connect commands
//! of the same node and always point from an older to a newer command.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{Command, CommandId, CommandKind, NodeId};
use crate::core::dag::{insert_dependency, DependencyKind};
use crate::core::task::TaskId;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct CommandNode {
    command: Command,
    dependencies: BTreeMap<CommandId, DependencyKind>,
    dependents: BTreeSet<CommandId>,
}

#[derive(Debug, Default)]
pub struct CommandGraph {
    commands: BTreeMap<CommandId, CommandNode>,
    by_task: BTreeMap<TaskId, Vec<CommandId>>,
    fronts: BTreeMap<NodeId, BTreeSet<CommandId>>,
    next_id: u64,
}

impl CommandGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a command and return its id.
    pub fn create(&mut self, node: NodeId, kind: CommandKind, task: Option<TaskId>) -> CommandId {
        let id = CommandId(self.next_id);
        self.next_id += 1;
        self.commands.insert(
            id,
            CommandNode {
                command: Command {
                    id,
                    node,
                    kind,
                    task,
                },
                dependencies: BTreeMap::new(),
                dependents: BTreeSet::new(),
            },
        );
        if let Some(t) = task {
            self.by_task.entry(t).or_default().push(id);
        }
        self.fronts.entry(node).or_default().insert(id);
        id
    }

    /// Make `to` wait for `from`. An order dependency replaces an existing
    /// anti-dependency, never the other way around.
    pub fn add_dependency(&mut self, from: CommandId, to: CommandId, kind: DependencyKind) -> Result<()> {
        if from >= to {
            return Err(Error::Validation(format!(
                "Dependency from command {} to command {} does not point forward in time",
                from, to
            )));
        }
        let from_node = self.get(from)?.node;
        let to_node = self.get(to)?.node;
        if from_node != to_node {
            return Err(Error::Validation(format!(
                "Command {} on node {} cannot depend on command {} on node {}",
                to, to_node, from, from_node
            )));
        }

        if let Some(target) = self.commands.get_mut(&to) {
            insert_dependency(&mut target.dependencies, from, kind);
        }
        if let Some(source) = self.commands.get_mut(&from) {
            source.dependents.insert(to);
        }
        if let Some(front) = self.fronts.get_mut(&from_node) {
            front.remove(&from);
        }
        Ok(())
    }

    pub fn get(&self, id: CommandId) -> Result<&Command> {
        self.commands
            .get(&id)
            .map(|n| &n.command)
            .ok_or(Error::UnknownCommand(id))
    }

    pub fn contains(&self, id: CommandId) -> bool {
        self.commands.contains_key(&id)
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn dependencies(&self, id: CommandId) -> Vec<(CommandId, DependencyKind)> {
        self.commands
            .get(&id)
            .map(|n| n.dependencies.iter().map(|(c, k)| (*c, *k)).collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, id: CommandId) -> Vec<CommandId> {
        self.commands
            .get(&id)
            .map(|n| n.dependents.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_dependency(&self, from: CommandId, to: CommandId) -> bool {
        self.dependency_kind(from, to).is_some()
    }

    pub fn dependency_kind(&self, from: CommandId, to: CommandId) -> Option<DependencyKind> {
        self.commands.get(&to)?.dependencies.get(&from).copied()
    }

    /// Commands generated for a task, in creation order.
    pub fn task_commands(&self, task: TaskId) -> Vec<&Command> {
        self.by_task
            .get(&task)
            .map(|ids| ids.iter().filter_map(|id| self.get(*id).ok()).collect())
            .unwrap_or_default()
    }

    /// Commands of `node` that nothing depends on yet.
    pub fn front(&self, node: NodeId) -> Vec<CommandId> {
        self.fronts
            .get(&node)
            .map(|f| f.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All live commands in id order.
    pub fn all_commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values().map(|n| &n.command)
    }

    /// Remove every command older than the commands of horizon task
    /// `horizon`. The horizon commands themselves survive, without their
    /// dependencies.
    ///
    /// # Errors
    /// Fails without removing anything if any other surviving command still
    /// depends on a command that would be removed.
    pub fn prune_before_horizon(&mut self, horizon: TaskId) -> Result<usize> {
        let horizons: BTreeSet<CommandId> = self
            .by_task
            .get(&horizon)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let Some(epoch) = horizons.first().copied() else {
            return Err(Error::UnknownTask(horizon));
        };

        for node in self.commands.range(epoch..).map(|(_, n)| n) {
            if horizons.contains(&node.command.id) {
                continue;
            }
            if let Some((dep, _)) = node.dependencies.range(..epoch).next() {
                return Err(Error::Validation(format!(
                    "command {} still depends on command {} older than horizon {}",
                    node.command.id, dep, horizon
                )));
            }
        }

        let stale: Vec<CommandId> = self.commands.range(..epoch).map(|(id, _)| *id).collect();
        for id in &stale {
            self.commands.remove(id);
        }
        for id in &horizons {
            if let Some(node) = self.commands.get_mut(id) {
                node.dependencies.retain(|dep, _| *dep >= epoch);
            }
        }
        for ids in self.by_task.values_mut() {
            ids.retain(|id| *id >= epoch);
        }
        self.by_task.retain(|_, ids| !ids.is_empty());
        for front in self.fronts.values_mut() {
            front.retain(|id| *id >= epoch);
        }
        Ok(stale.len())
    }
}
