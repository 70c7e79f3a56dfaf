use thiserror::Error;

use crate::buffer::BufferId;
use crate::command::{CommandId, CommandType, NodeId};
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Unknown buffer: {0}")]
    UnknownBuffer(BufferId),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Unknown command: {0}")]
    UnknownCommand(CommandId),

    #[error("Job for command {command} expects a {expected} package, got {actual}")]
    CommandTypeMismatch {
        command: CommandId,
        expected: CommandType,
        actual: CommandType,
    },

    #[error("Kernel failed: {0}")]
    Kernel(String),

    #[error("Backend failure in {command}: {reason}")]
    Backend { command: String, reason: String },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid horizon transition from {from} to {to}")]
    InvalidHorizonTransition { from: String, to: String },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Node {node} failed: {reason}")]
    NodeFailed { node: NodeId, reason: String },

    #[error("Run aborted after a failure on another node")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;
