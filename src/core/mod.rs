//! Core task model.
//!
//! This module contains the task data structures, the task graph and the
//! task manager that derives task-level dependencies.

pub mod dag;
pub mod task;
pub mod task_manager;

pub use dag::{DependencyKind, TaskGraph};
pub use task::{AccessMode, BufferAccess, RangeMapper, Task, TaskId, TaskSpec, TaskType};
pub use task_manager::TaskManager;
