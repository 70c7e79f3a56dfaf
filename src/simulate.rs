//! Pascal-triangle pipeline used by `tessera simulate`.
//!
//! Row `k` of the triangle (mod `p`) is computed from row `k - 1`; every row
//! task reads the whole previous row and writes its own chunk, so each step
//! exchanges the chunk borders between nodes. Two row buffers are used in
//! turn, which also exercises anti-dependencies. A master-node task finally
//! sums the last row, which must equal `2^rows mod p`.

use std::sync::Arc;

use tracing::info;

use crate::buffer::BufferId;
use crate::command::NodeId;
use crate::config::Config;
use crate::core::task::{RangeMapper, TaskSpec};
use crate::error::{Error, Result};
use crate::grid::{GridBox, Subrange};
use crate::runtime::{ClusterReport, Runtime};
use crate::worker::{Kernel, KernelContext};

pub const DEFAULT_MODULUS: u64 = 1_000_000_007;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PascalParams {
    pub rows: usize,
    pub modulus: u64,
}

impl Default for PascalParams {
    fn default() -> Self {
        Self {
            rows: 16,
            modulus: DEFAULT_MODULUS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PascalOutcome {
    pub params: PascalParams,
    pub checksum: u64,
    pub expected: u64,
    pub report: ClusterReport,
}

impl PascalOutcome {
    pub fn is_correct(&self) -> bool {
        self.checksum == self.expected
    }
}

pub fn pow_mod(base: u64, exp: usize, modulus: u64) -> u64 {
    let m = modulus as u128;
    let mut result = 1u128 % m;
    let mut b = base as u128 % m;
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result = result * b % m;
        }
        b = b * b % m;
        e >>= 1;
    }
    result as u64
}

fn first_row_kernel() -> Kernel {
    Arc::new(|ctx: &KernelContext| {
        let sr = ctx.subrange();
        let values: Vec<u64> = (sr.offset[0]..sr.offset[0] + sr.range[0])
            .map(|i| u64::from(i == 0))
            .collect();
        ctx.write_u64(0, &values)
    })
}

fn next_row_kernel(modulus: u64) -> Kernel {
    Arc::new(move |ctx: &KernelContext| {
        let prev = ctx.read_u64(0)?;
        let sr = ctx.subrange();
        let values = (sr.offset[0]..sr.offset[0] + sr.range[0])
            .map(|i| {
                let left = if i == 0 { 0 } else { prev[i - 1] };
                (left + prev[i]) % modulus
            })
            .collect::<Vec<u64>>();
        ctx.write_u64(1, &values)
    })
}

fn checksum_kernel(modulus: u64) -> Kernel {
    Arc::new(move |ctx: &KernelContext| {
        let row = ctx.read_u64(0)?;
        let sum = row.iter().fold(0u64, |acc, v| (acc + v) % modulus);
        ctx.write_u64(1, &[sum])
    })
}

/// Run the pipeline on an in-process cluster described by `config`.
pub fn run_pascal(config: Config, params: PascalParams) -> Result<PascalOutcome> {
    if params.modulus < 2 || params.modulus > u32::MAX as u64 {
        return Err(Error::Validation(format!(
            "modulus {} must lie in [2, 2^32)",
            params.modulus
        )));
    }
    let width = params.rows + 1;
    let mut runtime = Runtime::start(config)?;
    let rows: [BufferId; 2] = [
        runtime.create_buffer("row-even", [width, 1, 1], 8, None)?,
        runtime.create_buffer("row-odd", [width, 1, 1], 8, None)?,
    ];
    let result = runtime.create_buffer("checksum", [1, 1, 1], 8, None)?;
    let range = Subrange::one_d(0, width);

    runtime.submit(
        TaskSpec::device_compute("pascal-row-0", range).discard_write(rows[0], RangeMapper::OneToOne),
        Some(first_row_kernel()),
    )?;
    for k in 1..=params.rows {
        let name = format!("pascal-row-{}", k);
        let spec = if k % 2 == 0 {
            TaskSpec::device_compute(&name, range)
        } else {
            TaskSpec::host_compute(&name, range)
        };
        runtime.submit(
            spec.read(rows[(k - 1) % 2], RangeMapper::All)
                .discard_write(rows[k % 2], RangeMapper::OneToOne),
            Some(next_row_kernel(params.modulus)),
        )?;
    }
    runtime.submit(
        TaskSpec::master_node("checksum")
            .read(rows[params.rows % 2], RangeMapper::All)
            .discard_write(result, RangeMapper::All),
        Some(checksum_kernel(params.modulus)),
    )?;

    let master = runtime.storage(NodeId::MASTER)?;
    let report = runtime.shutdown()?;

    let bytes = master.read(result, &GridBox::from_extent([1, 1, 1]))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes.get(..8).ok_or_else(|| {
        Error::Validation("checksum buffer holds fewer than 8 bytes".to_string())
    })?);
    let outcome = PascalOutcome {
        params,
        checksum: u64::from_le_bytes(raw),
        expected: pow_mod(2, params.rows, params.modulus),
        report,
    };
    info!(
        rows = params.rows,
        checksum = outcome.checksum,
        expected = outcome.expected,
        "Pascal pipeline finished"
    );
    Ok(outcome)
}
