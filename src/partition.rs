//! Row decomposition helpers for drivers and tests.
//!
//! The decomposition itself only ever sees the local block; these helpers
//! cover the driver side that starts from a gathered matrix — cutting it
//! into per-rank row blocks and reassembling distributed results.

use ndarray::{s, Array2};

use crate::error::{PodError, Result};

/// Metadata for one rank's contiguous share of a row-distributed matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSlice {
    pub rank: usize,
    pub nranks: usize,
    pub global_rows: usize,
    pub local_rows: usize,
    pub row_start: usize,
    pub row_end: usize,
}

/// Balanced contiguous row partition; the remainder goes to the leading
/// ranks.
pub fn partition_rows(global_rows: usize, nranks: usize) -> Result<Vec<RowSlice>> {
    if nranks == 0 {
        return Err(PodError::Dimension {
            rank: 0,
            detail: "cannot partition across zero ranks".to_string(),
        });
    }
    if global_rows < nranks {
        return Err(PodError::Dimension {
            rank: 0,
            detail: format!("cannot split {global_rows} rows across {nranks} ranks"),
        });
    }
    let base = global_rows / nranks;
    let remainder = global_rows % nranks;
    let mut counts = Vec::with_capacity(nranks);
    for rank in 0..nranks {
        counts.push(base + usize::from(rank < remainder));
    }
    partition_from_counts(&counts)
}

/// Partition with explicit per-rank row counts, for unevenly distributed
/// datasets.
pub fn partition_from_counts(counts: &[usize]) -> Result<Vec<RowSlice>> {
    if counts.is_empty() {
        return Err(PodError::Dimension {
            rank: 0,
            detail: "cannot partition across zero ranks".to_string(),
        });
    }
    let nranks = counts.len();
    let global_rows: usize = counts.iter().sum();
    let mut slices = Vec::with_capacity(nranks);
    let mut cursor = 0usize;
    for (rank, &local_rows) in counts.iter().enumerate() {
        if local_rows == 0 {
            return Err(PodError::Dimension {
                rank,
                detail: "rank would receive zero rows".to_string(),
            });
        }
        let row_start = cursor;
        let row_end = row_start + local_rows;
        cursor = row_end;
        slices.push(RowSlice {
            rank,
            nranks,
            global_rows,
            local_rows,
            row_start,
            row_end,
        });
    }
    Ok(slices)
}

/// Cuts a gathered matrix into per-rank row blocks.
pub fn split_rows(global: &Array2<f64>, slices: &[RowSlice]) -> Result<Vec<Array2<f64>>> {
    let mut blocks = Vec::with_capacity(slices.len());
    for slice_def in slices {
        if slice_def.global_rows != global.nrows() {
            return Err(PodError::Dimension {
                rank: slice_def.rank,
                detail: format!(
                    "slice expects {} global rows but the matrix has {}",
                    slice_def.global_rows,
                    global.nrows()
                ),
            });
        }
        blocks.push(
            global
                .slice(s![slice_def.row_start..slice_def.row_end, ..])
                .to_owned(),
        );
    }
    Ok(blocks)
}

/// Reassembles per-rank row blocks into the gathered matrix.
pub fn stitch_rows(
    locals: &[Array2<f64>],
    slices: &[RowSlice],
    ncols: usize,
) -> Result<Array2<f64>> {
    if locals.len() != slices.len() || slices.is_empty() {
        return Err(PodError::Dimension {
            rank: 0,
            detail: format!(
                "{} local blocks do not match {} slices",
                locals.len(),
                slices.len()
            ),
        });
    }
    let global_rows = slices[0].global_rows;
    let mut global = Array2::zeros((global_rows, ncols));
    for (local, slice_def) in locals.iter().zip(slices.iter()) {
        if local.dim() != (slice_def.local_rows, ncols) {
            return Err(PodError::Dimension {
                rank: slice_def.rank,
                detail: format!(
                    "local block is {:?}, slice expects ({}, {ncols})",
                    local.dim(),
                    slice_def.local_rows
                ),
            });
        }
        global
            .slice_mut(s![slice_def.row_start..slice_def.row_end, ..])
            .assign(local);
    }
    Ok(global)
}
