//! End-to-end tests running kernels on an in-process cluster.

use std::sync::Arc;

use tempfile::TempDir;

use tessera::command::NodeId;
use tessera::core::task::RangeMapper;
use tessera::core::TaskSpec;
use tessera::simulate::{pow_mod, run_pascal, PascalParams, DEFAULT_MODULUS};
use tessera::worker::{Kernel, KernelContext};
use tessera::Runtime;

use crate::fixtures::{cluster_config, decode_u64};

fn encode(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn fill_with_index() -> Kernel {
    Arc::new(|ctx: &KernelContext| {
        let sr = ctx.subrange();
        let values: Vec<u64> = (sr.offset[0]..sr.offset[0] + sr.range[0]).map(|i| i as u64).collect();
        ctx.write_u64(0, &values)
    })
}

/// Test: Pascal pipeline on growing clusters
/// Given one to four nodes
/// When the Pascal pipeline runs 12 rows
/// Then the checksum equals 2^12 on every cluster size
#[test]
fn test_pascal_on_cluster_sizes() {
    for nodes in 1..=4 {
        let outcome = run_pascal(
            cluster_config(nodes, 3),
            PascalParams {
                rows: 12,
                modulus: DEFAULT_MODULUS,
            },
        )
        .unwrap();
        assert_eq!(outcome.expected, 4096);
        assert!(
            outcome.is_correct(),
            "{} nodes: checksum {}",
            nodes,
            outcome.checksum
        );
        assert_eq!(outcome.report.nodes.len(), nodes);
        assert!(outcome.report.horizons_retired > 0);
    }
}

/// Test: Pascal pipeline wraps around the modulus
#[test]
fn test_pascal_with_small_modulus() {
    let params = PascalParams {
        rows: 40,
        modulus: 1_009,
    };
    let outcome = run_pascal(cluster_config(3, 5), params).unwrap();
    assert_eq!(outcome.expected, pow_mod(2, 40, 1_009));
    assert!(outcome.is_correct());
}

/// Test: Gather on the master node
/// Given a buffer filled in chunks on three nodes
/// When a master-node task sums the whole buffer
/// Then the result holds the sum of all elements
#[test]
fn test_master_gathers_distributed_chunks() {
    let mut runtime = Runtime::start(cluster_config(3, 10)).unwrap();
    let data = runtime.create_buffer("data", [9, 1, 1], 8, None).unwrap();
    let sum = runtime.create_buffer("sum", [1, 1, 1], 8, None).unwrap();

    runtime
        .submit(
            TaskSpec::device_compute("fill", tessera::grid::Subrange::one_d(0, 9))
                .discard_write(data, RangeMapper::OneToOne),
            Some(fill_with_index()),
        )
        .unwrap();
    let total: Kernel = Arc::new(|ctx: &KernelContext| {
        let values = ctx.read_u64(0)?;
        ctx.write_u64(1, &[values.iter().sum()])
    });
    runtime
        .submit(
            TaskSpec::master_node("sum")
                .read(data, RangeMapper::All)
                .discard_write(sum, RangeMapper::All),
            Some(total),
        )
        .unwrap();

    let master = runtime.storage(NodeId::MASTER).unwrap();
    runtime.shutdown().unwrap();
    assert_eq!(decode_u64(&master.snapshot(sum).unwrap()), vec![36]);
}

/// Test: Host-initialized buffers are readable everywhere
/// Given a buffer created with initial contents
/// When every node doubles its chunk into a second buffer
/// Then each node holds the doubled values of its chunk without transfers
#[test]
fn test_host_initialized_input() {
    let mut runtime = Runtime::start(cluster_config(2, 10)).unwrap();
    let input: Vec<u64> = (10..18).collect();
    let src = runtime
        .create_buffer("input", [8, 1, 1], 8, Some(encode(&input)))
        .unwrap();
    let dst = runtime.create_buffer("output", [8, 1, 1], 8, None).unwrap();

    let double: Kernel = Arc::new(|ctx: &KernelContext| {
        let values: Vec<u64> = ctx.read_u64(0)?.iter().map(|v| v * 2).collect();
        ctx.write_u64(1, &values)
    });
    runtime
        .submit(
            TaskSpec::host_compute("double", tessera::grid::Subrange::one_d(0, 8))
                .read(src, RangeMapper::OneToOne)
                .discard_write(dst, RangeMapper::OneToOne),
            Some(double),
        )
        .unwrap();

    let storages = [
        runtime.storage(NodeId(0)).unwrap(),
        runtime.storage(NodeId(1)).unwrap(),
    ];
    let report = runtime.shutdown().unwrap();
    assert_eq!(report.tasks_submitted, 1);

    let node0 = decode_u64(&storages[0].snapshot(dst).unwrap());
    let node1 = decode_u64(&storages[1].snapshot(dst).unwrap());
    assert_eq!(node0[..4], [20, 22, 24, 26]);
    assert_eq!(node1[4..], [28, 30, 32, 34]);
}

/// Test: Neighborhood reads pull halo cells from neighbors
/// Given a buffer filled in chunks on two nodes
/// When a stencil task reads each cell with a border of one
/// Then every output cell sums its neighbors across the chunk boundary
#[test]
fn test_neighborhood_stencil() {
    let mut runtime = Runtime::start(cluster_config(2, 10)).unwrap();
    let src = runtime.create_buffer("src", [6, 1, 1], 8, None).unwrap();
    let dst = runtime.create_buffer("dst", [6, 1, 1], 8, None).unwrap();
    let range = tessera::grid::Subrange::one_d(0, 6);

    runtime
        .submit(
            TaskSpec::device_compute("fill", range).discard_write(src, RangeMapper::OneToOne),
            Some(fill_with_index()),
        )
        .unwrap();
    let stencil: Kernel = Arc::new(|ctx: &KernelContext| {
        let halo = ctx.access(0)?.region;
        let values = ctx.read_u64(0)?;
        let sr = ctx.subrange();
        let start = halo.lower()[0];
        let out: Vec<u64> = (sr.offset[0]..sr.offset[0] + sr.range[0])
            .map(|i| {
                let lo = i.saturating_sub(1).max(start);
                let hi = (i + 1).min(halo.upper()[0] - 1);
                (lo..=hi).map(|j| values[j - start]).sum()
            })
            .collect();
        ctx.write_u64(1, &out)
    });
    runtime
        .submit(
            TaskSpec::device_compute("stencil", range)
                .read(src, RangeMapper::Neighborhood { border: [1, 0, 0] })
                .discard_write(dst, RangeMapper::OneToOne),
            Some(stencil),
        )
        .unwrap();

    let storages = [
        runtime.storage(NodeId(0)).unwrap(),
        runtime.storage(NodeId(1)).unwrap(),
    ];
    runtime.shutdown().unwrap();

    // Cells 0..6 hold 0..6; each output is the sum of the cell and its neighbors.
    let node0 = decode_u64(&storages[0].snapshot(dst).unwrap());
    let node1 = decode_u64(&storages[1].snapshot(dst).unwrap());
    assert_eq!(node0[..3], [1, 3, 6]);
    assert_eq!(node1[3..], [9, 12, 9]);
}

/// Test: Graph dump on shutdown
/// Given a config with a graph dump directory
/// When the cluster shuts down
/// Then the task and command graphs are written as DOT files
#[test]
fn test_graph_dump_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let dump = dir.path().join("graphs");
    let mut config = cluster_config(2, 10);
    config.graph_dump_dir = Some(dump.display().to_string());

    let mut runtime = Runtime::start(config).unwrap();
    let buf = runtime.create_buffer("data", [4, 1, 1], 8, None).unwrap();
    runtime
        .submit(
            TaskSpec::device_compute("fill", tessera::grid::Subrange::one_d(0, 4))
                .discard_write(buf, RangeMapper::OneToOne),
            Some(fill_with_index()),
        )
        .unwrap();
    runtime
        .submit(TaskSpec::master_node("gather").read(buf, RangeMapper::All), None)
        .unwrap();
    runtime.shutdown().unwrap();

    let tasks = std::fs::read_to_string(dump.join("task_graph.dot")).unwrap();
    let commands = std::fs::read_to_string(dump.join("command_graph.dot")).unwrap();
    assert!(tasks.starts_with("digraph G {"));
    assert!(tasks.contains("Task 1 (fill)"));
    assert!(tasks.contains("1 -> 2"));
    assert!(commands.starts_with("digraph G {"));
    assert!(commands.contains("PUSH"));
    assert!(commands.contains("AWAIT PUSH"));
}
