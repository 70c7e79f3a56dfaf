//! Failure propagation tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use tessera::buffer::BufferId;
use tessera::config::Config;
use tessera::core::task::RangeMapper;
use tessera::core::TaskSpec;
use tessera::grid::Subrange;
use tessera::worker::{Kernel, KernelContext};
use tessera::{Error, Runtime};

use crate::fixtures::cluster_config;

fn failing_kernel() -> Kernel {
    Arc::new(|_: &KernelContext| Err(Error::Kernel("boom".to_string())))
}

/// Test: A failing kernel fails the cluster
/// Given a two-node cluster
/// When a kernel returns an error
/// Then shutdown reports the node failure with the kernel's message
#[test]
fn test_kernel_error_reported_on_shutdown() {
    let mut runtime = Runtime::start(cluster_config(2, 10)).unwrap();
    let buf = runtime.create_buffer("data", [4, 1, 1], 8, None).unwrap();
    runtime
        .submit(
            TaskSpec::device_compute("bad", Subrange::one_d(0, 4)).discard_write(buf, RangeMapper::OneToOne),
            Some(failing_kernel()),
        )
        .unwrap();

    match runtime.shutdown() {
        Err(Error::NodeFailed { reason, .. }) => assert!(reason.contains("boom"), "reason: {}", reason),
        other => panic!("expected node failure, got {:?}", other),
    }
}

/// Test: A panicking kernel is contained
#[test]
fn test_kernel_panic_reported() {
    let mut runtime = Runtime::start(cluster_config(1, 10)).unwrap();
    let panics: Kernel = Arc::new(|_: &KernelContext| panic!("kernel exploded"));
    runtime
        .submit(TaskSpec::master_node("panics"), Some(panics))
        .unwrap();

    match runtime.shutdown() {
        Err(Error::NodeFailed { reason, .. }) => assert!(reason.contains("panicked"), "reason: {}", reason),
        other => panic!("expected node failure, got {:?}", other),
    }
}

/// Test: Writing through a read access fails the kernel
#[test]
fn test_write_through_read_access_fails() {
    let mut runtime = Runtime::start(cluster_config(1, 10)).unwrap();
    let buf = runtime.create_buffer("data", [2, 1, 1], 8, None).unwrap();
    let sneaky: Kernel = Arc::new(|ctx: &KernelContext| ctx.write_u64(0, &[1, 2]));
    runtime
        .submit(TaskSpec::master_node("sneaky").read(buf, RangeMapper::All), Some(sneaky))
        .unwrap();

    match runtime.shutdown() {
        Err(Error::NodeFailed { reason, .. }) => assert!(reason.contains("writes through"), "reason: {}", reason),
        other => panic!("expected node failure, got {:?}", other),
    }
}

/// Test: Submissions after a failure are refused
/// Given a cluster whose first task failed
/// When more tasks are submitted
/// Then a submission eventually fails with the node failure
#[test]
fn test_submit_after_failure_is_refused() {
    let mut runtime = Runtime::start(cluster_config(2, 10)).unwrap();
    runtime
        .submit(TaskSpec::master_node("bad"), Some(failing_kernel()))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let err = loop {
        match runtime.submit(TaskSpec::master_node("next"), None) {
            Ok(_) => {
                assert!(Instant::now() < deadline, "failure was never reported");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => break e,
        }
    };
    assert!(
        matches!(err, Error::NodeFailed { .. } | Error::Aborted),
        "unexpected error {:?}",
        err
    );
    assert!(matches!(runtime.shutdown(), Err(Error::NodeFailed { .. })));
}

/// Test: Unknown buffers are rejected before anything runs
#[test]
fn test_unknown_buffer_rejected() {
    let mut runtime = Runtime::start(cluster_config(2, 10)).unwrap();
    let result = runtime.submit(
        TaskSpec::device_compute("ghost", Subrange::one_d(0, 4)).read(BufferId(42), RangeMapper::OneToOne),
        None,
    );
    assert!(matches!(result, Err(Error::UnknownBuffer(BufferId(42)))));
    assert_eq!(runtime.task_manager().graph().task_count(), 1);

    let report = runtime.shutdown().unwrap();
    assert_eq!(report.tasks_submitted, 0);
}

/// Test: Empty execution ranges are rejected
#[test]
fn test_empty_range_rejected() {
    let mut runtime = Runtime::start(cluster_config(1, 10)).unwrap();
    let result = runtime.submit(TaskSpec::host_compute("empty", Subrange::one_d(0, 0)), None);
    assert!(matches!(result, Err(Error::Validation(_))));
    runtime.shutdown().unwrap();
}

/// Test: Invalid config files are rejected
/// Given a config file asking for zero nodes
/// When it is loaded
/// Then loading fails validation
#[test]
fn test_invalid_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tessera.toml");
    std::fs::write(&path, "num_nodes = 0\n").unwrap();
    assert!(matches!(Config::load_from(&path), Err(Error::Validation(_))));

    std::fs::write(&path, "num_nodes = \"many\"\n").unwrap();
    assert!(matches!(Config::load_from(&path), Err(Error::TomlParse(_))));
}
