//! Horizon lifecycle.
//!
//! A horizon is a synchronization point injected every `step` task
//! submissions. It is `Open` while the submission window fills up, `Sealed`
//! once its task and per-node commands exist, and `Retired` when its command
//! completed on every node. Retirement is what allows the graphs to drop
//! everything older than the horizon.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::command::{CommandId, NodeId};
use crate::core::task::TaskId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HorizonState {
    Open,
    Sealed,
    Retired,
}

impl std::fmt::Display for HorizonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HorizonState::Open => write!(f, "open"),
            HorizonState::Sealed => write!(f, "sealed"),
            HorizonState::Retired => write!(f, "retired"),
        }
    }
}

#[derive(Debug)]
struct SealedHorizon {
    commands: BTreeMap<NodeId, CommandId>,
    completed: BTreeSet<NodeId>,
}

#[derive(Debug)]
pub struct HorizonManager {
    step: usize,
    num_nodes: usize,
    submissions: usize,
    sealed: BTreeMap<TaskId, SealedHorizon>,
    by_command: HashMap<(NodeId, CommandId), TaskId>,
    latest_retired: Option<TaskId>,
}

impl HorizonManager {
    pub fn new(step: usize, num_nodes: usize) -> Self {
        Self {
            step: step.max(1),
            num_nodes,
            submissions: 0,
            sealed: BTreeMap::new(),
            by_command: HashMap::new(),
            latest_retired: None,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Count a task submission. Returns true when a horizon is due.
    pub fn note_submission(&mut self) -> bool {
        self.submissions += 1;
        self.submissions >= self.step
    }

    /// State of the horizon with the given task id.
    pub fn state(&self, task: TaskId) -> HorizonState {
        if self.sealed.contains_key(&task) {
            HorizonState::Sealed
        } else if self.latest_retired.is_some_and(|r| task <= r) {
            HorizonState::Retired
        } else {
            HorizonState::Open
        }
    }

    /// The horizon task has been created; close the submission window.
    pub fn seal(&mut self, task: TaskId) -> Result<()> {
        let state = self.state(task);
        if state != HorizonState::Open {
            return Err(transition(state, HorizonState::Sealed));
        }
        self.submissions = 0;
        self.sealed.insert(
            task,
            SealedHorizon {
                commands: BTreeMap::new(),
                completed: BTreeSet::new(),
            },
        );
        debug!(horizon = %task, "Horizon sealed");
        Ok(())
    }

    /// Register the command implementing horizon `task` on `node`.
    pub fn attach_command(&mut self, task: TaskId, node: NodeId, command: CommandId) -> Result<()> {
        let state = self.state(task);
        let Some(horizon) = self.sealed.get_mut(&task) else {
            return Err(transition(state, HorizonState::Sealed));
        };
        horizon.commands.insert(node, command);
        self.by_command.insert((node, command), task);
        Ok(())
    }

    /// A command finished on `node`. Returns the horizon task that retired
    /// because of it, if any.
    ///
    /// # Errors
    /// A horizon may only retire once all older horizons have retired.
    pub fn command_completed(&mut self, node: NodeId, command: CommandId) -> Result<Option<TaskId>> {
        let Some(task) = self.by_command.get(&(node, command)).copied() else {
            return Ok(None);
        };
        let Some(horizon) = self.sealed.get_mut(&task) else {
            return Ok(None);
        };
        horizon.completed.insert(node);
        if horizon.completed.len() < self.num_nodes {
            return Ok(None);
        }

        if self.sealed.keys().next() != Some(&task) {
            return Err(transition(HorizonState::Sealed, HorizonState::Retired));
        }
        if let Some(done) = self.sealed.remove(&task) {
            for (n, c) in done.commands {
                self.by_command.remove(&(n, c));
            }
        }
        self.latest_retired = Some(task);
        debug!(horizon = %task, "Horizon retired");
        Ok(Some(task))
    }

    pub fn latest_retired(&self) -> Option<TaskId> {
        self.latest_retired
    }
}

fn transition(from: HorizonState, to: HorizonState) -> Error {
    Error::InvalidHorizonTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}
