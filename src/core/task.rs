//! Task data model for the task graph.
//!
//! A task describes one submitted unit of work: what kind of work it is, the
//! global execution range it covers, and which buffer regions it touches and
//! how. Tasks are immutable once inserted into the graph.

use serde::{Deserialize, Serialize};

use crate::buffer::BufferId;
use crate::grid::{GridBox, Subrange, MAX_DIMS};

/// Identifier of a task. Ids are assigned in submission order, so a smaller
/// id always means an older task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// The init task every run starts with.
    pub const INIT: TaskId = TaskId(0);
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Group of collective host tasks that must run in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectiveGroupId(pub u64);

impl std::fmt::Display for CollectiveGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TaskType {
    /// No work. Used for the init task.
    Nop,
    /// Host code split over the nodes like a device kernel.
    HostCompute,
    /// A device kernel split over the nodes.
    DeviceCompute,
    /// Host code running once on every node, serialized within its group.
    Collective { group: CollectiveGroupId },
    /// Host code running on the master node only.
    MasterNode,
    /// Synchronization point bounding the size of the graphs.
    Horizon,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Nop => write!(f, "nop"),
            TaskType::HostCompute => write!(f, "host-compute"),
            TaskType::DeviceCompute => write!(f, "device-compute"),
            TaskType::Collective { group } => write!(f, "collective #{}", group),
            TaskType::MasterNode => write!(f, "master-node"),
            TaskType::Horizon => write!(f, "horizon"),
        }
    }
}

/// How a task accesses a buffer region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    /// Overwrites the region without looking at its previous contents.
    DiscardWrite,
}

impl AccessMode {
    /// Whether the access needs the previous contents of the region.
    ///
    /// A plain `Write` may leave parts of the region untouched, so it keeps
    /// them and counts as a consumer.
    pub fn is_consumer(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite | AccessMode::Write)
    }

    /// Whether the access produces a new version of the region.
    pub fn is_producer(&self) -> bool {
        matches!(
            self,
            AccessMode::Write | AccessMode::ReadWrite | AccessMode::DiscardWrite
        )
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
            AccessMode::ReadWrite => write!(f, "read_write"),
            AccessMode::DiscardWrite => write!(f, "discard_write"),
        }
    }
}

/// Maps a chunk of the execution range to the buffer box it accesses.
///
/// Every result is clamped to the buffer extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RangeMapper {
    /// Item `i` accesses element `i`.
    OneToOne,
    /// Every chunk accesses the whole buffer.
    All,
    /// Every chunk accesses the same fixed subrange.
    Fixed { subrange: Subrange },
    /// Like `OneToOne`, but covering the whole extent along `dim`.
    Slice { dim: usize },
    /// The chunk grown by `border` in every direction.
    Neighborhood { border: [usize; MAX_DIMS] },
}

impl RangeMapper {
    pub fn map(&self, chunk: &Subrange, extent: [usize; MAX_DIMS]) -> GridBox {
        let full = GridBox::from_extent(extent);
        let mapped = match self {
            RangeMapper::OneToOne => chunk.to_box(),
            RangeMapper::All => full,
            RangeMapper::Fixed { subrange } => subrange.to_box(),
            RangeMapper::Slice { dim } => {
                let b = chunk.to_box();
                if b.is_empty() || *dim >= MAX_DIMS {
                    b
                } else {
                    let mut min = b.lower();
                    let mut max = b.upper();
                    min[*dim] = 0;
                    max[*dim] = extent[*dim];
                    GridBox::new(min, max).unwrap_or_else(|_| GridBox::empty())
                }
            }
            RangeMapper::Neighborhood { border } => {
                let b = chunk.to_box();
                if b.is_empty() {
                    b
                } else {
                    let mut min = b.lower();
                    let mut max = b.upper();
                    for d in 0..MAX_DIMS {
                        min[d] = min[d].saturating_sub(border[d]);
                        max[d] = max[d].saturating_add(border[d]);
                    }
                    GridBox::new(min, max).unwrap_or_else(|_| GridBox::empty())
                }
            }
        };
        mapped.intersection(&full)
    }
}

/// One declared buffer access of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAccess {
    pub buffer: BufferId,
    pub mode: AccessMode,
    pub mapper: RangeMapper,
}

impl BufferAccess {
    /// The box accessed by `chunk` of a buffer with the given extent.
    pub fn region(&self, chunk: &Subrange, extent: [usize; MAX_DIMS]) -> GridBox {
        self.mapper.map(chunk, extent)
    }
}

/// Where a task's chunks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    Host,
    Device,
}

impl std::fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionTarget::Host => write!(f, "host"),
            ExecutionTarget::Device => write!(f, "device"),
        }
    }
}

/// A task in the task graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    /// Global execution range.
    pub range: Subrange,
    /// Buffer accesses in declaration order.
    pub accesses: Vec<BufferAccess>,
    pub debug_name: String,
}

impl Task {
    pub fn from_spec(id: TaskId, spec: TaskSpec) -> Self {
        Self {
            id,
            task_type: spec.task_type,
            range: spec.range,
            accesses: spec.accesses,
            debug_name: spec.debug_name,
        }
    }

    pub fn nop(id: TaskId) -> Self {
        Self {
            id,
            task_type: TaskType::Nop,
            range: Subrange::from_range([1, 1, 1]),
            accesses: Vec::new(),
            debug_name: String::new(),
        }
    }

    pub fn horizon(id: TaskId) -> Self {
        Self {
            id,
            task_type: TaskType::Horizon,
            range: Subrange::from_range([1, 1, 1]),
            accesses: Vec::new(),
            debug_name: String::new(),
        }
    }

    pub fn execution_target(&self) -> ExecutionTarget {
        match self.task_type {
            TaskType::DeviceCompute => ExecutionTarget::Device,
            _ => ExecutionTarget::Host,
        }
    }

    pub fn collective_group(&self) -> Option<CollectiveGroupId> {
        match self.task_type {
            TaskType::Collective { group } => Some(group),
            _ => None,
        }
    }

    /// Whether the task runs user code.
    pub fn is_compute(&self) -> bool {
        matches!(
            self.task_type,
            TaskType::HostCompute
                | TaskType::DeviceCompute
                | TaskType::Collective { .. }
                | TaskType::MasterNode
        )
    }
}

/// Builder for a task submission.
///
/// ```
/// use tessera::buffer::BufferId;
/// use tessera::core::task::{RangeMapper, TaskSpec};
/// use tessera::grid::Subrange;
///
/// let spec = TaskSpec::device_compute("saxpy", Subrange::one_d(0, 128))
///     .read(BufferId(0), RangeMapper::OneToOne)
///     .read_write(BufferId(1), RangeMapper::OneToOne);
/// assert_eq!(spec.accesses.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub task_type: TaskType,
    pub range: Subrange,
    pub accesses: Vec<BufferAccess>,
    pub debug_name: String,
}

impl TaskSpec {
    fn with_type(task_type: TaskType, name: &str, range: Subrange) -> Self {
        Self {
            task_type,
            range,
            accesses: Vec::new(),
            debug_name: name.to_string(),
        }
    }

    pub fn device_compute(name: &str, range: Subrange) -> Self {
        Self::with_type(TaskType::DeviceCompute, name, range)
    }

    pub fn host_compute(name: &str, range: Subrange) -> Self {
        Self::with_type(TaskType::HostCompute, name, range)
    }

    pub fn master_node(name: &str) -> Self {
        Self::with_type(TaskType::MasterNode, name, Subrange::from_range([1, 1, 1]))
    }

    /// A collective task. Its execution range is fixed to one item per node
    /// when it is submitted.
    pub fn collective(name: &str, group: CollectiveGroupId) -> Self {
        Self::with_type(
            TaskType::Collective { group },
            name,
            Subrange::from_range([1, 1, 1]),
        )
    }

    pub fn access(mut self, buffer: BufferId, mode: AccessMode, mapper: RangeMapper) -> Self {
        self.accesses.push(BufferAccess {
            buffer,
            mode,
            mapper,
        });
        self
    }

    pub fn read(self, buffer: BufferId, mapper: RangeMapper) -> Self {
        self.access(buffer, AccessMode::Read, mapper)
    }

    pub fn write(self, buffer: BufferId, mapper: RangeMapper) -> Self {
        self.access(buffer, AccessMode::Write, mapper)
    }

    pub fn read_write(self, buffer: BufferId, mapper: RangeMapper) -> Self {
        self.access(buffer, AccessMode::ReadWrite, mapper)
    }

    pub fn discard_write(self, buffer: BufferId, mapper: RangeMapper) -> Self {
        self.access(buffer, AccessMode::DiscardWrite, mapper)
    }
}
