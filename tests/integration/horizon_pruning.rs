//! Horizon retirement and graph pruning tests.

use std::time::{Duration, Instant};

use tessera::buffer::BufferId;
use tessera::command::{CommandType, NodeId};
use tessera::core::task::RangeMapper;
use tessera::core::{TaskId, TaskSpec};
use tessera::grid::Subrange;
use tessera::horizon::HorizonState;
use tessera::Runtime;

use crate::fixtures::{cluster_config, Pipeline};

fn step_task(p: &mut Pipeline, buf: BufferId, i: usize) -> Vec<TaskId> {
    let spec = TaskSpec::device_compute(&format!("step-{}", i), Subrange::one_d(0, 8))
        .read_write(buf, RangeMapper::OneToOne)
        .read(buf, RangeMapper::All);
    p.submit(spec)
}

/// Report every horizon command of `horizon` as completed. Returns the
/// horizon that retired, if any.
fn complete_horizon(p: &mut Pipeline, horizon: TaskId) -> Option<TaskId> {
    let commands: Vec<(NodeId, tessera::command::CommandId)> = p
        .of_type(horizon, CommandType::Horizon)
        .into_iter()
        .map(|c| (c.nid, c.cid))
        .collect();
    let mut retired = None;
    for (node, cid) in &commands {
        p.tasks.attach_horizon_command(horizon, *node, *cid).unwrap();
    }
    for (node, cid) in commands {
        if let Some(h) = p.tasks.command_completed(node, cid).unwrap() {
            retired = Some(h);
        }
    }
    retired
}

/// Test: Horizon lifecycle
/// Given a horizon step of two
/// When the second task is submitted and the horizon completes on every node
/// Then the horizon moves from sealed to retired
#[test]
fn test_horizon_seal_and_retire() {
    let mut p = Pipeline::new(2, 2);
    let buf = p.buffer(0, 8);
    assert_eq!(step_task(&mut p, buf, 0).len(), 1);
    let created = step_task(&mut p, buf, 1);
    assert_eq!(created.len(), 2);
    let horizon = created[1];
    assert_eq!(p.tasks.horizons().state(horizon), HorizonState::Sealed);
    assert_eq!(p.tasks.epoch(), horizon);

    assert_eq!(complete_horizon(&mut p, horizon), Some(horizon));
    assert_eq!(p.tasks.horizons().state(horizon), HorizonState::Retired);
    assert_eq!(p.tasks.horizons().latest_retired(), Some(horizon));
}

/// Test: Horizon completion on some nodes only
#[test]
fn test_partial_horizon_completion_does_not_retire() {
    let mut p = Pipeline::new(3, 1);
    let buf = p.buffer(0, 8);
    let created = step_task(&mut p, buf, 0);
    let horizon = created[1];
    let commands: Vec<_> = p
        .of_type(horizon, CommandType::Horizon)
        .into_iter()
        .map(|c| (c.nid, c.cid))
        .collect();
    for (node, cid) in &commands {
        p.tasks.attach_horizon_command(horizon, *node, *cid).unwrap();
    }
    for (node, cid) in &commands[..2] {
        assert_eq!(p.tasks.command_completed(*node, *cid).unwrap(), None);
    }
    assert_eq!(p.tasks.horizons().state(horizon), HorizonState::Sealed);
    let (node, cid) = commands[2];
    assert_eq!(p.tasks.command_completed(node, cid).unwrap(), Some(horizon));
}

/// Test: Pruning keeps the graphs consistent
/// Given many dependent tasks with a horizon every two submissions
/// When each horizon retires and both graphs are pruned
/// Then nothing older than the horizon survives and no surviving command
/// refers to a pruned one
#[test]
fn test_pruning_keeps_graphs_bounded() {
    let mut p = Pipeline::new(2, 2);
    let buf = p.buffer(0, 8);
    let mut max_tasks = 0;
    let mut max_commands = 0;

    for i in 0..20 {
        let created = step_task(&mut p, buf, i);
        if let Some(horizon) = created.get(1).copied() {
            assert_eq!(complete_horizon(&mut p, horizon), Some(horizon));
            p.tasks.prune_before(horizon);
            p.generator.prune_before_horizon(horizon).unwrap();

            let graph = p.tasks.graph();
            assert!(graph.all_tasks().iter().all(|t| t.id >= horizon));
            let commands = p.generator.command_graph();
            for cmd in commands.all_commands() {
                for (dep, _) in commands.dependencies(cmd.id) {
                    assert!(commands.contains(dep), "command {} lost dependency {}", cmd.id, dep);
                }
            }
            p.generator.check_invariants().unwrap();
        }
        max_tasks = max_tasks.max(p.tasks.graph().task_count());
        max_commands = max_commands.max(p.generator.command_graph().command_count());
    }

    // A horizon plus the tasks of one window, each with its per-node commands.
    assert!(max_tasks <= 3, "task graph grew to {}", max_tasks);
    assert!(max_commands <= 20, "command graph grew to {}", max_commands);
}

/// Test: Work after a pruned horizon still reads the right data
/// Given tasks submitted across several retired horizons
/// When a later task reads the buffer
/// Then its commands depend on the latest horizon only
#[test]
fn test_reads_after_pruning_depend_on_horizon() {
    let mut p = Pipeline::new(2, 2);
    let buf = p.buffer(0, 8);
    let mut last_horizon = None;
    for i in 0..4 {
        if let Some(h) = step_task(&mut p, buf, i).get(1).copied() {
            complete_horizon(&mut p, h);
            p.tasks.prune_before(h);
            p.generator.prune_before_horizon(h).unwrap();
            last_horizon = Some(h);
        }
    }
    let horizon = last_horizon.unwrap();
    let reader = p.submit(TaskSpec::device_compute("reader", Subrange::one_d(0, 8)).read(buf, RangeMapper::OneToOne))[0];

    assert_eq!(
        p.tasks.graph().get_dependencies(reader),
        vec![(horizon, tessera::core::DependencyKind::Order)]
    );
    let horizon_cmds: Vec<_> = p.of_type(horizon, CommandType::Horizon).into_iter().map(|c| c.cid).collect();
    for cmd in p.packages(reader) {
        assert_eq!(cmd.dependencies.len(), 1);
        assert!(horizon_cmds.contains(&cmd.dependencies[0]));
    }
}

/// Test: The runtime retires horizons as nodes report them
/// Given a two-node cluster with a horizon every two submissions
/// When twenty tasks run to completion
/// Then the task graph shrinks back to the last window
#[test]
fn test_runtime_retires_horizons() {
    let mut runtime = Runtime::start(cluster_config(2, 2)).unwrap();
    let buf = runtime.create_buffer("data", [8, 1, 1], 8, None).unwrap();
    for i in 0..20 {
        runtime
            .submit(
                TaskSpec::device_compute(&format!("step-{}", i), Subrange::one_d(0, 8))
                    .read_write(buf, RangeMapper::OneToOne),
                None,
            )
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        runtime.process_events().unwrap();
        let retired = runtime.task_manager().horizons().latest_retired();
        if retired == Some(runtime.task_manager().epoch()) {
            break;
        }
        assert!(Instant::now() < deadline, "horizons did not retire in time");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(runtime.task_manager().graph().task_count() <= 3);

    let report = runtime.shutdown().unwrap();
    assert_eq!(report.tasks_submitted, 20);
    assert_eq!(report.horizons_retired, 10);
}
