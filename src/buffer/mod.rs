//! Buffers: identity, extent, version tracking and node-local storage.

pub mod region_map;
pub mod state;
pub mod storage;

use serde::{Deserialize, Serialize};

use crate::grid::{GridBox, MAX_DIMS};

pub use region_map::RegionMap;
pub use state::{BufferStateTracker, Producer, ProducerEntry};
pub use storage::{BufferManager, HostBuffer};

/// Identifier of a buffer, shared by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferId(pub u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static description of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    pub id: BufferId,
    /// Global extent; unused trailing dimensions are 1.
    pub extent: [usize; MAX_DIMS],
    /// Size of one element in bytes.
    pub elem_size: usize,
    /// Whether every node starts with valid contents supplied by the user.
    pub host_initialized: bool,
    pub debug_name: String,
}

impl BufferInfo {
    pub fn new(id: BufferId, extent: [usize; MAX_DIMS], elem_size: usize) -> Self {
        Self {
            id,
            extent,
            elem_size,
            host_initialized: false,
            debug_name: format!("buffer{}", id.0),
        }
    }

    pub fn host_initialized(mut self, initialized: bool) -> Self {
        self.host_initialized = initialized;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.debug_name = name.to_string();
        self
    }

    pub fn full_box(&self) -> GridBox {
        GridBox::from_extent(self.extent)
    }

    /// Number of dimensions actually in use.
    pub fn dims(&self) -> usize {
        if self.extent[2] > 1 {
            3
        } else if self.extent[1] > 1 {
            2
        } else {
            1
        }
    }

    pub fn byte_size(&self) -> usize {
        self.extent.iter().product::<usize>() * self.elem_size
    }
}
