pub mod buffer;
pub mod command;
pub mod config;
pub mod core;
pub mod error;
pub mod grid;
pub mod horizon;
pub mod log;
pub mod print_graph;
pub mod runtime;
pub mod simulate;
pub mod transfer;
pub mod worker;

pub use error::{Error, Result};
pub use runtime::{ClusterReport, Runtime};
