//! Dependency and transfer generation tests.
//!
//! These tests drive the task manager and the command generator together and
//! check the task graph, the command packages and the buffer state that
//! result from typical access patterns.

use std::collections::BTreeSet;

use proptest::prelude::*;

use tessera::buffer::BufferId;
use tessera::command::{CommandData, CommandId, CommandPkg, CommandType, NodeId};
use tessera::core::task::{AccessMode, RangeMapper};
use tessera::core::{DependencyKind, TaskId, TaskSpec};
use tessera::grid::{GridBox, GridRegion, Subrange};

use crate::fixtures::{reaches, Pipeline};

fn fixed(start: usize, len: usize) -> RangeMapper {
    RangeMapper::Fixed {
        subrange: Subrange::one_d(start, len),
    }
}

fn b1(start: usize, end: usize) -> GridBox {
    GridBox::one_d(start, end).unwrap()
}

/// Test: Disjoint writes stay independent
/// Given two tasks writing [0,5) and [5,10) of one buffer
/// When both are generated on two nodes
/// Then no task or command of the second depends on the first
#[test]
fn test_disjoint_writes_are_independent() {
    let mut p = Pipeline::new(2, 100);
    let buf = p.buffer(0, 10);
    let a = p.submit(
        TaskSpec::device_compute("a", Subrange::one_d(0, 5)).discard_write(buf, RangeMapper::OneToOne),
    )[0];
    let b = p.submit(
        TaskSpec::device_compute("b", Subrange::one_d(5, 5)).discard_write(buf, RangeMapper::OneToOne),
    )[0];

    assert!(!p.tasks.graph().has_dependency(a, b));

    let a_cmds: BTreeSet<CommandId> = p.packages(a).iter().map(|c| c.cid).collect();
    assert!(p.of_type(b, CommandType::Push).is_empty());
    assert!(p.of_type(b, CommandType::AwaitPush).is_empty());
    for cmd in p.packages(b) {
        assert!(cmd.dependencies.iter().all(|d| !a_cmds.contains(d)));
        assert_eq!(cmd.dependencies, vec![p.generator.epoch(cmd.nid).unwrap()]);
    }
}

/// Test: Read after write on another node
/// Given task A writing [0,10) on the master node
/// When task B reads [3,7) on both nodes
/// Then exactly one push/await-push pair moves [3,7) from node 0 to node 1
#[test]
fn test_read_after_write_transfers_once() {
    let mut p = Pipeline::new(2, 100);
    let buf = p.buffer(0, 10);
    let a = p.submit(TaskSpec::master_node("a").discard_write(buf, RangeMapper::All))[0];
    let b = p.submit(TaskSpec::device_compute("b", Subrange::one_d(0, 2)).read(buf, fixed(3, 4)))[0];

    assert_eq!(p.tasks.graph().get_dependency(a, b), Some(DependencyKind::Order));

    let a_cmd = p.task_command(a, NodeId(0)).cid;
    let pushes = p.of_type(b, CommandType::Push);
    let awaits = p.of_type(b, CommandType::AwaitPush);
    assert_eq!(pushes.len(), 1);
    assert_eq!(awaits.len(), 1);

    let push = pushes[0];
    assert_eq!(push.nid, NodeId(0));
    assert_eq!(
        push.data,
        CommandData::Push {
            buffer: buf,
            target: NodeId(1),
            region: b1(3, 7),
        }
    );
    assert!(push.dependencies.contains(&a_cmd));

    let await_push = awaits[0];
    assert_eq!(await_push.nid, NodeId(1));
    assert_eq!(
        await_push.data,
        CommandData::AwaitPush {
            buffer: buf,
            source: push.cid,
            source_node: NodeId(0),
            region: b1(3, 7),
        }
    );

    let graph = p.generator.command_graph();
    let b0 = p.task_command(b, NodeId(0)).cid;
    let b1_cmd = p.task_command(b, NodeId(1)).cid;
    assert_eq!(graph.dependency_kind(a_cmd, b0), Some(DependencyKind::Order));
    assert_eq!(graph.dependency_kind(await_push.cid, b1_cmd), Some(DependencyKind::Order));
}

/// Test: Write after write without readers
/// Given task A writing [0,10) on two nodes
/// When task B overwrites [0,10)
/// Then B depends on A through order dependencies only
#[test]
fn test_write_after_write_is_order() {
    let mut p = Pipeline::new(2, 100);
    let buf = p.buffer(0, 10);
    let a = p.submit(
        TaskSpec::device_compute("a", Subrange::one_d(0, 10)).discard_write(buf, RangeMapper::OneToOne),
    )[0];
    let b = p.submit(
        TaskSpec::device_compute("b", Subrange::one_d(0, 10)).discard_write(buf, RangeMapper::OneToOne),
    )[0];

    assert_eq!(p.tasks.graph().get_dependency(a, b), Some(DependencyKind::Order));
    let graph = p.generator.command_graph();
    for n in 0..2 {
        let node = NodeId(n);
        assert_eq!(
            graph.dependency_kind(p.task_command(a, node).cid, p.task_command(b, node).cid),
            Some(DependencyKind::Order)
        );
    }
}

/// Assert that a master-node read of the whole buffer after `writer` pulls
/// [5,10) from node 1, after the command of `writer` on that node.
fn assert_master_read_pulls_upper_half(p: &mut Pipeline, buf: BufferId, writer: TaskId) {
    let reader = p.submit(TaskSpec::master_node("gather").read(buf, RangeMapper::All))[0];
    let pushes = p.of_type(reader, CommandType::Push);
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].nid, NodeId(1));
    assert_eq!(
        pushes[0].data,
        CommandData::Push {
            buffer: buf,
            target: NodeId(0),
            region: b1(5, 10),
        }
    );
    assert_eq!(
        pushes[0].dependencies,
        vec![p.task_command(writer, NodeId(1)).cid]
    );
}

/// Test: Write after write on another node
/// Given task A writing [0,10) on the master node
/// When task B overwrites [0,10) split over two nodes
/// Then B depends on A by order, and B's node-1 command only on the epoch
#[test]
fn test_write_after_write_across_nodes() {
    let mut p = Pipeline::new(2, 100);
    let buf = p.buffer(0, 10);
    let a = p.submit(TaskSpec::master_node("a").discard_write(buf, RangeMapper::All))[0];
    let b = p.submit(
        TaskSpec::device_compute("b", Subrange::one_d(0, 10)).discard_write(buf, RangeMapper::OneToOne),
    )[0];

    assert_eq!(
        p.tasks.graph().get_dependencies(b),
        vec![(a, DependencyKind::Order)]
    );
    assert!(p.of_type(b, CommandType::Push).is_empty());
    assert!(p.of_type(b, CommandType::AwaitPush).is_empty());

    let graph = p.generator.command_graph();
    let a_cmd = p.task_command(a, NodeId(0)).cid;
    assert_eq!(
        graph.dependency_kind(a_cmd, p.task_command(b, NodeId(0)).cid),
        Some(DependencyKind::Order)
    );
    assert_eq!(
        p.task_command(b, NodeId(1)).dependencies,
        vec![p.generator.epoch(NodeId(1)).unwrap()]
    );

    assert_master_read_pulls_upper_half(&mut p, buf, b);
}

/// Test: Write after read on another node
/// Given task A writing [0,10) on the master node and task R reading it there
/// When task B overwrites [0,10) split over two nodes
/// Then B depends on R by anti-dependency only
#[test]
fn test_write_after_read_across_nodes() {
    let mut p = Pipeline::new(2, 100);
    let buf = p.buffer(0, 10);
    let a = p.submit(TaskSpec::master_node("a").discard_write(buf, RangeMapper::All))[0];
    let r = p.submit(TaskSpec::master_node("r").read(buf, RangeMapper::All))[0];
    let b = p.submit(
        TaskSpec::device_compute("b", Subrange::one_d(0, 10)).discard_write(buf, RangeMapper::OneToOne),
    )[0];

    assert_eq!(
        p.tasks.graph().get_dependencies(b),
        vec![(r, DependencyKind::Anti)]
    );
    assert_eq!(p.tasks.graph().get_dependency(a, b), None);

    let graph = p.generator.command_graph();
    let r_cmd = p.task_command(r, NodeId(0)).cid;
    let b0 = p.task_command(b, NodeId(0)).cid;
    assert_eq!(graph.dependency_kind(r_cmd, b0), Some(DependencyKind::Anti));
    assert_eq!(
        graph.dependency_kind(p.task_command(a, NodeId(0)).cid, b0),
        None
    );
    assert_eq!(
        p.task_command(b, NodeId(1)).dependencies,
        vec![p.generator.epoch(NodeId(1)).unwrap()]
    );

    assert_master_read_pulls_upper_half(&mut p, buf, b);
}

/// Test: Write after read
/// Given task A writing on two nodes and a master-node task R reading it all
/// When task B overwrites the buffer
/// Then B waits for the readers of A's data through anti-dependencies
#[test]
fn test_write_after_read_is_anti() {
    let mut p = Pipeline::new(2, 100);
    let buf = p.buffer(0, 10);
    let a = p.submit(
        TaskSpec::device_compute("a", Subrange::one_d(0, 10)).discard_write(buf, RangeMapper::OneToOne),
    )[0];
    let r = p.submit(TaskSpec::master_node("r").read(buf, RangeMapper::All))[0];
    let b = p.submit(
        TaskSpec::device_compute("b", Subrange::one_d(0, 10)).discard_write(buf, RangeMapper::OneToOne),
    )[0];

    let tasks = p.tasks.graph();
    assert_eq!(tasks.get_dependency(r, b), Some(DependencyKind::Anti));
    assert_eq!(tasks.get_dependency(a, b), None);

    let graph = p.generator.command_graph();
    let r_cmd = p.task_command(r, NodeId(0)).cid;
    let push = p.of_type(r, CommandType::Push)[0];
    assert_eq!(push.nid, NodeId(1));

    let b0 = p.task_command(b, NodeId(0)).cid;
    let b1_cmd = p.task_command(b, NodeId(1)).cid;
    assert_eq!(graph.dependency_kind(r_cmd, b0), Some(DependencyKind::Anti));
    assert_eq!(graph.dependency_kind(push.cid, b1_cmd), Some(DependencyKind::Anti));
    assert_eq!(graph.dependency_kind(p.task_command(a, NodeId(1)).cid, b1_cmd), None);
}

/// Test: Horizon after three submissions
/// Given a horizon step of three and three independent tasks
/// When the third task is submitted
/// Then a horizon depends on all three commands per node and later work
/// depends only on the horizon
#[test]
fn test_horizon_after_three_submissions() {
    let mut p = Pipeline::new(2, 3);
    let bufs: Vec<BufferId> = (0..3).map(|i| p.buffer(i, 10)).collect();
    let mut submitted = Vec::new();
    for (i, buf) in bufs.iter().enumerate() {
        let created = p.submit(
            TaskSpec::device_compute(&format!("t{}", i), Subrange::one_d(0, 10))
                .discard_write(*buf, RangeMapper::OneToOne),
        );
        submitted.push(created[0]);
        assert_eq!(created.len(), if i == 2 { 2 } else { 1 });
    }
    let horizon = TaskId(submitted[2].0 + 1);

    let deps: BTreeSet<TaskId> = p
        .tasks
        .graph()
        .get_dependencies(horizon)
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert_eq!(deps, submitted.iter().copied().collect());

    let horizon_cmds: Vec<CommandPkg> = p
        .of_type(horizon, CommandType::Horizon)
        .into_iter()
        .cloned()
        .collect();
    assert_eq!(horizon_cmds.len(), 2);
    for h in &horizon_cmds {
        let expected: BTreeSet<CommandId> = submitted
            .iter()
            .map(|t| p.task_command(*t, h.nid).cid)
            .collect();
        let actual: BTreeSet<CommandId> = h.dependencies.iter().copied().collect();
        assert_eq!(actual, expected);
    }

    let t4 = p.submit(
        TaskSpec::device_compute("t4", Subrange::one_d(0, 10)).read(bufs[0], RangeMapper::OneToOne),
    )[0];
    assert_eq!(
        p.tasks.graph().get_dependencies(t4),
        vec![(horizon, DependencyKind::Order)]
    );
    for cmd in p.packages(t4) {
        let h = horizon_cmds.iter().find(|h| h.nid == cmd.nid).unwrap();
        assert_eq!(cmd.dependencies, vec![h.cid]);
    }
}

/// Test: Collective tasks of one group are serialized
#[test]
fn test_collective_group_serialization() {
    let mut p = Pipeline::new(3, 100);
    let group = tessera::core::task::CollectiveGroupId(7);
    let c1 = p.submit(TaskSpec::collective("c1", group))[0];
    let c2 = p.submit(TaskSpec::collective("c2", group))[0];

    assert_eq!(p.tasks.graph().get_dependency(c1, c2), Some(DependencyKind::Order));
    assert_eq!(p.of_type(c1, CommandType::Task).len(), 3);
    for n in 0..3 {
        let node = NodeId(n);
        assert_eq!(
            p.task_command(c2, node).dependencies,
            vec![p.task_command(c1, node).cid]
        );
    }
}

fn mode_of(code: u8) -> AccessMode {
    match code % 4 {
        0 => AccessMode::Read,
        1 => AccessMode::Write,
        2 => AccessMode::ReadWrite,
        _ => AccessMode::DiscardWrite,
    }
}

fn mapper_of(code: u8, start: usize, len: usize) -> RangeMapper {
    match code % 3 {
        0 => RangeMapper::OneToOne,
        1 => RangeMapper::All,
        _ => fixed(start, len),
    }
}

type AccessPlan = (u64, u8, usize, usize, u8);

fn access_plan() -> impl Strategy<Value = AccessPlan> {
    (0u64..2, 0u8..3, 0usize..8, 1usize..5, 0u8..4)
}

fn task_plans() -> impl Strategy<Value = Vec<Vec<AccessPlan>>> {
    prop::collection::vec(prop::collection::vec(access_plan(), 1..3), 1..10)
}

proptest! {
    /// Any two tasks touching a common element, at least one of them
    /// writing, are ordered in the task graph.
    #[test]
    fn prop_conflicting_tasks_are_ordered(plans in task_plans()) {
        let mut p = Pipeline::new(1, 1000);
        let bufs = [p.buffer(0, 12), p.buffer(1, 12)];
        let mut submitted = Vec::new();
        for (i, plan) in plans.iter().enumerate() {
            let mut spec = TaskSpec::master_node(&format!("t{}", i));
            for (buf, _, start, len, mode) in plan {
                spec = spec.access(bufs[*buf as usize], mode_of(*mode), fixed(*start, *len));
            }
            submitted.push(p.submit(spec)[0]);
        }

        for (j, later) in submitted.iter().enumerate() {
            for earlier in &submitted[..j] {
                let e = p.tasks.get_task(*earlier).unwrap().clone();
                let l = p.tasks.get_task(*later).unwrap().clone();
                let mut conflict = false;
                for (ei, ea) in e.accesses.iter().enumerate() {
                    for (li, la) in l.accesses.iter().enumerate() {
                        if ea.buffer != la.buffer || !(ea.mode.is_producer() || la.mode.is_producer()) {
                            continue;
                        }
                        let er = p.tasks.declared_region(&e, ei).unwrap();
                        let lr = p.tasks.declared_region(&l, li).unwrap();
                        conflict |= er.intersects(&lr);
                    }
                }
                if conflict {
                    prop_assert!(
                        reaches(p.tasks.graph(), *earlier, *later),
                        "task {} does not depend on task {}", later, earlier
                    );
                }
            }
        }
    }

    /// Every await-push has exactly one matching push, and after the
    /// transfers of a task each node holds everything its chunk reads.
    #[test]
    fn prop_transfers_cover_reads(plans in task_plans()) {
        let mut p = Pipeline::new(3, 4);
        let bufs = [p.buffer(0, 12), p.buffer(1, 12)];
        for (i, plan) in plans.iter().enumerate() {
            let mut spec = TaskSpec::device_compute(&format!("t{}", i), Subrange::one_d(0, 12));
            for (buf, mapper, start, len, mode) in plan {
                spec = spec.access(bufs[*buf as usize], mode_of(*mode), mapper_of(*mapper, *start, *len));
            }

            let before: Vec<Vec<GridRegion>> = bufs
                .iter()
                .map(|b| {
                    (0..3)
                        .map(|n| p.generator.buffer_state().valid_region(*b, NodeId(n)).unwrap())
                        .collect()
                })
                .collect();
            let task = p.submit(spec)[0];

            let pkgs = p.packages(task).to_vec();
            for a in pkgs.iter().filter(|c| c.command_type() == CommandType::AwaitPush) {
                let CommandData::AwaitPush { buffer, source, source_node, region } = &a.data else {
                    unreachable!();
                };
                let matching: Vec<_> = pkgs
                    .iter()
                    .filter(|c| c.cid == *source)
                    .collect();
                prop_assert_eq!(matching.len(), 1);
                prop_assert_eq!(matching[0].nid, *source_node);
                prop_assert_eq!(
                    &matching[0].data,
                    &CommandData::Push { buffer: *buffer, target: a.nid, region: *region }
                );
            }

            for t in pkgs.iter().filter(|c| c.command_type() == CommandType::Task) {
                let CommandData::Task { accesses, .. } = &t.data else {
                    unreachable!();
                };
                for access in accesses.iter().filter(|a| a.mode.is_consumer()) {
                    let idx = bufs.iter().position(|b| *b == access.buffer).unwrap();
                    let mut have = before[idx][t.nid.0].clone();
                    let mut delivered = GridRegion::new();
                    for a in pkgs.iter().filter(|c| c.nid == t.nid) {
                        if let CommandData::AwaitPush { buffer, region, .. } = &a.data {
                            if *buffer == access.buffer {
                                let incoming = GridRegion::from_box(*region);
                                prop_assert!(!delivered.intersects(&incoming));
                                delivered = delivered.union(&incoming);
                            }
                        }
                    }
                    have = have.union(&delivered);
                    prop_assert!(have.contains(&GridRegion::from_box(access.region)));
                }
            }
            p.generator.check_invariants().unwrap();
        }
    }
}
