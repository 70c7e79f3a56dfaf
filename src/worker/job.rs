//! Worker jobs: the executor-side state machine of one command.

use std::time::{Duration, Instant};

use tracing::debug;

use super::backend::{CompletionHandle, ExecutionBackend, KernelLaunch};
use crate::command::{CommandData, CommandId, CommandPkg, CommandType, NodeId};
use crate::core::task::ExecutionTarget;
use crate::error::{Error, Result};
use crate::transfer::{BufferTransferManager, TransferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Nop,
    Horizon,
    AwaitPush,
    Push,
    HostExecute,
    DeviceExecute,
}

impl JobKind {
    /// The job kind that runs `pkg`.
    pub fn for_package(pkg: &CommandPkg) -> JobKind {
        match &pkg.data {
            CommandData::Nop => JobKind::Nop,
            CommandData::Horizon { .. } => JobKind::Horizon,
            CommandData::AwaitPush { .. } => JobKind::AwaitPush,
            CommandData::Push { .. } => JobKind::Push,
            CommandData::Task { target, .. } => match target {
                ExecutionTarget::Host => JobKind::HostExecute,
                ExecutionTarget::Device => JobKind::DeviceExecute,
            },
        }
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            JobKind::Nop => CommandType::Nop,
            JobKind::Horizon => CommandType::Horizon,
            JobKind::AwaitPush => CommandType::AwaitPush,
            JobKind::Push => CommandType::Push,
            JobKind::HostExecute | JobKind::DeviceExecute => CommandType::Task,
        }
    }
}

/// Timing of the polls spent on one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub samples: u32,
    pub sum: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl JobStats {
    pub fn record(&mut self, sample: Duration) {
        if self.samples == 0 || sample < self.min {
            self.min = sample;
        }
        if sample > self.max {
            self.max = sample;
        }
        self.sum += sample;
        self.samples += 1;
    }

    pub fn average(&self) -> Duration {
        if self.samples == 0 {
            Duration::ZERO
        } else {
            self.sum / self.samples
        }
    }
}

/// What the node's executor lends a job while it is being updated.
pub struct JobContext<'a> {
    pub transfers: &'a mut BufferTransferManager,
    pub backend: &'a mut dyn ExecutionBackend,
}

enum Progress {
    NotStarted,
    Immediate,
    Transfer(TransferId),
    Launch(Box<dyn CompletionHandle>),
}

pub struct WorkerJob {
    pkg: CommandPkg,
    kind: JobKind,
    state: JobState,
    progress: Progress,
    description: String,
    started_at: Option<Instant>,
    stats: JobStats,
}

impl WorkerJob {
    /// Create the job of `pkg`. The kind has to agree with the package.
    pub fn new(pkg: CommandPkg, kind: JobKind) -> Result<Self> {
        if kind.command_type() != pkg.command_type() {
            return Err(Error::CommandTypeMismatch {
                command: pkg.cid,
                expected: kind.command_type(),
                actual: pkg.command_type(),
            });
        }
        if let CommandData::Task { target, .. } = &pkg.data {
            if JobKind::for_package(&pkg) != kind {
                return Err(Error::Validation(format!(
                    "command {} targets the {} but was given a {:?} job",
                    pkg.cid, target, kind
                )));
            }
        }
        let description = pkg.describe();
        Ok(Self {
            pkg,
            kind,
            state: JobState::Pending,
            progress: Progress::NotStarted,
            description,
            started_at: None,
            stats: JobStats::default(),
        })
    }

    pub fn for_package(pkg: CommandPkg) -> Result<Self> {
        let kind = JobKind::for_package(&pkg);
        Self::new(pkg, kind)
    }

    pub fn cid(&self) -> CommandId {
        self.pkg.cid
    }

    pub fn node(&self) -> NodeId {
        self.pkg.nid
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }

    pub fn package(&self) -> &CommandPkg {
        &self.pkg
    }

    pub fn dependencies(&self) -> &[CommandId] {
        &self.pkg.dependencies
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn stats(&self) -> JobStats {
        self.stats
    }

    /// Perform the job's one-time side effect.
    pub fn start(&mut self, ctx: &mut JobContext<'_>) -> Result<()> {
        if self.state != JobState::Pending {
            return Ok(());
        }
        debug!(job = %self.description, "Starting job");
        self.started_at = Some(Instant::now());
        let progress = self.launch(ctx).map_err(|e| self.backend_error(e))?;
        self.progress = progress;
        self.state = JobState::Running;
        Ok(())
    }

    fn launch(&self, ctx: &mut JobContext<'_>) -> Result<Progress> {
        match &self.pkg.data {
            CommandData::Nop | CommandData::Horizon { .. } => Ok(Progress::Immediate),
            CommandData::AwaitPush {
                buffer,
                source,
                source_node,
                region,
            } => Ok(Progress::Transfer(ctx.transfers.await_push(
                *buffer,
                *source_node,
                *source,
                *region,
            )?)),
            CommandData::Push {
                buffer,
                target,
                region,
            } => Ok(Progress::Transfer(ctx.transfers.push(
                *buffer,
                *target,
                self.pkg.cid,
                *region,
            )?)),
            CommandData::Task {
                task,
                name,
                target,
                subrange,
                accesses,
                collective,
            } => {
                let launch = KernelLaunch {
                    task: *task,
                    name: name.clone(),
                    node: self.pkg.nid,
                    target: *target,
                    subrange: *subrange,
                    accesses: accesses.clone(),
                    collective: *collective,
                };
                Ok(Progress::Launch(ctx.backend.execute(launch)?))
            }
        }
    }

    /// Start the job if needed, then poll it once.
    pub fn update(&mut self, ctx: &mut JobContext<'_>) -> Result<JobState> {
        if self.state == JobState::Done {
            return Ok(JobState::Done);
        }
        let poll_start = Instant::now();
        if self.state == JobState::Pending {
            self.start(ctx)?;
        }
        let polled = match &mut self.progress {
            Progress::NotStarted => Ok(false),
            Progress::Immediate => Ok(true),
            Progress::Transfer(id) => ctx.transfers.poll_transfer(*id),
            Progress::Launch(handle) => handle.poll(),
        };
        let finished = polled.map_err(|e| self.backend_error(e))?;
        self.stats.record(poll_start.elapsed());

        if finished {
            self.state = JobState::Done;
            self.progress = Progress::NotStarted;
            let elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
            debug!(
                job = %self.description,
                elapsed_us = elapsed.as_micros() as u64,
                polls = self.stats.samples,
                poll_avg_us = self.stats.average().as_micros() as u64,
                poll_min_us = self.stats.min.as_micros() as u64,
                poll_max_us = self.stats.max.as_micros() as u64,
                "Job finished"
            );
        }
        Ok(self.state)
    }

    fn backend_error(&self, err: Error) -> Error {
        match err {
            Error::Backend { .. } => err,
            other => Error::Backend {
                command: self.description.clone(),
                reason: other.to_string(),
            },
        }
    }
}

impl std::fmt::Debug for WorkerJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerJob")
            .field("cid", &self.pkg.cid)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}
