//! Commands: per-node work derived from tasks.
//!
//! The generator turns every task into commands on the nodes that execute
//! it, the command graph records their dependencies, and packages carry them
//! to the executors.

pub mod generator;
pub mod graph;
pub mod package;
pub mod types;

pub use generator::GraphGenerator;
pub use graph::CommandGraph;
pub use package::{CommandData, CommandPkg, ResolvedAccess};
pub use types::{Command, CommandId, CommandKind, CommandType, NodeId};
