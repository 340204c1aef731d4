//! Distributed TSQR-SVD: the communication-optimal SVD of a row-distributed
//! tall-skinny matrix.
//!
//! The algorithm follows Demmel, Grigori, Hoemmen and Langou,
//! "Communication-optimal Parallel and Sequential QR and LU Factorizations"
//! (SIAM J. Sci. Comput. 34(1), 2012), with the recomposition of Sayadi and
//! Schmid (2016): each process factors its local block once, the small R
//! factors are merged pairwise along a butterfly whose partners are chosen by
//! flipping one rank bit per level, and a mirrored broadcast-back phase
//! distributes the right-multipliers so every process recovers its rows of
//! the global orthogonal factor. Communication volume is O(N² log P) instead
//! of the O(N² P) of a gather-based merge.
//!
//! Each invocation is a pure function of the local block and the group
//! topology; nothing persists across calls.

use std::error::Error;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{debug, info};
use ndarray::{s, Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::comm::{ProcessGroup, ReduceOp};
use crate::error::{PodError, Result};
use crate::linalg::{DenseSolver, QrFactors, SvdFactors};

/// Output of the distributed TSQR-SVD.
///
/// `singular_values` and `right_vectors` are identical on every rank; the
/// left singular vectors stay row-distributed, each rank holding the rows
/// that correspond to its input block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsqrSvdOutput {
    /// This process's rows of the global left-singular-vector matrix U.
    /// Shape: `(local_rows, n_snapshots)`
    pub local_modes: Array2<f64>,
    /// Global singular values, non-negative and non-increasing.
    /// Shape: `(n_snapshots)`
    pub singular_values: Array1<f64>,
    /// Global right singular vectors as columns.
    /// Shape: `(n_snapshots, n_snapshots)`
    pub right_vectors: Array2<f64>,
}

impl TsqrSvdOutput {
    /// Number of retained modes.
    pub fn mode_count(&self) -> usize {
        self.singular_values.len()
    }

    /// Saves the decomposition to a file using bincode.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), Box<dyn Error>> {
        let file = File::create(path.as_ref())
            .map_err(|e| format!("Failed to create file at {:?}: {}", path.as_ref(), e))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| format!("Failed to serialize decomposition: {e}"))?;
        Ok(())
    }

    /// Loads a decomposition previously written by [`TsqrSvdOutput::save`].
    ///
    /// Validates that the loaded factors have mutually consistent shapes and
    /// finite, non-negative singular values.
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, Box<dyn Error>> {
        let file = File::open(path.as_ref())
            .map_err(|e| format!("Failed to open file at {:?}: {}", path.as_ref(), e))?;
        let mut reader = BufReader::new(file);
        let output: TsqrSvdOutput =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| format!("Failed to deserialize decomposition: {e}"))?;
        let n = output.singular_values.len();
        if output.right_vectors.dim() != (n, n) || output.local_modes.ncols() != n {
            return Err(format!(
                "Loaded decomposition has inconsistent dimensions: {} singular values, {:?} right vectors, {:?} local modes",
                n,
                output.right_vectors.dim(),
                output.local_modes.dim()
            )
            .into());
        }
        if output
            .singular_values
            .iter()
            .any(|&v| !v.is_finite() || v < 0.0)
        {
            return Err("Loaded decomposition contains invalid singular values".into());
        }
        Ok(output)
    }
}

/// Number of butterfly rounds for a group of `size` processes.
fn reduction_levels(size: usize) -> usize {
    if size <= 1 {
        0
    } else {
        size.next_power_of_two().trailing_zeros() as usize
    }
}

/// Collective shape handshake run before any butterfly round.
///
/// Every rank contributes its block shape to two small reductions, so a
/// disagreeing column count or an undersized block on any rank turns a
/// would-be deadlock in the round loop into a clean failure on every rank.
fn collective_shape_check<G: ProcessGroup>(group: &G, rows: usize, cols: usize) -> Result<()> {
    let rank = group.rank();
    let local_problem = if cols == 0 {
        Some("block has zero columns".to_string())
    } else if rows < cols {
        Some(format!(
            "block is {rows}x{cols}; the tall-skinny reduction needs rows >= cols"
        ))
    } else {
        None
    };

    if group.size() > 1 {
        let probe = ndarray::array![[cols as f64, rows as f64]];
        let smallest = group.all_reduce(&probe, ReduceOp::Min)?;
        let largest = group.all_reduce(&probe, ReduceOp::Max)?;
        if let Some(detail) = local_problem {
            return Err(PodError::Dimension { rank, detail });
        }
        if smallest[[0, 0]] != largest[[0, 0]] {
            return Err(PodError::Dimension {
                rank,
                detail: format!(
                    "column counts disagree across the group (min {}, max {})",
                    smallest[[0, 0]],
                    largest[[0, 0]]
                ),
            });
        }
        if smallest[[0, 1]] < largest[[0, 0]] {
            return Err(PodError::Dimension {
                rank,
                detail: format!(
                    "a peer block has fewer rows ({}) than columns ({})",
                    smallest[[0, 1]],
                    largest[[0, 0]]
                ),
            });
        }
    } else if let Some(detail) = local_problem {
        return Err(PodError::Dimension { rank, detail });
    }
    Ok(())
}

struct ReductionOutcome {
    /// Current R factor; the global one on the rank that never sent.
    r: Array2<f64>,
    /// Per-level orthogonal factors saved by the receiving side, consumed by
    /// the broadcast-back unwind.
    saved_factors: Vec<Option<Array2<f64>>>,
}

/// Butterfly reduction of the per-process R factors.
///
/// At level L, rank r pairs with r XOR (1 << L). The partner whose bit L is
/// set hands its R over and leaves the reduction; the other stacks the
/// received R beneath its own, re-factors the 2N×N buffer and keeps the
/// merged R plus the orthogonal factor of the merge. Absent partners
/// (partner ≥ P, non-power-of-two groups) skip the round on both sides —
/// the guard must match exactly or the choreography deadlocks.
fn reduce_to_global_r<G: ProcessGroup>(
    group: &G,
    solver: &DenseSolver,
    mut r: Array2<f64>,
    levels: usize,
) -> Result<ReductionOutcome> {
    let rank = group.rank();
    let size = group.size();
    let n = r.ncols();
    let mut saved_factors: Vec<Option<Array2<f64>>> = vec![None; levels];
    for level in 0..levels {
        let partner = rank ^ (1 << level);
        if partner >= size {
            debug!("rank {rank}: partner {partner} absent at reduction level {level}");
            continue;
        }
        if rank & (1 << level) != 0 {
            // Sender side: hand off R and leave until the broadcast-back.
            group
                .send(partner, &r)
                .map_err(|e| e.at_level("reduction", level))?;
            debug!("rank {rank}: handed R to rank {partner} at reduction level {level}");
            break;
        }
        let foreign = group
            .recv(partner)
            .map_err(|e| e.at_level("reduction", level))?;
        if foreign.dim() != (n, n) {
            return Err(PodError::Communication {
                rank,
                detail: format!(
                    "expected a {n}x{n} R factor from rank {partner}, got {}x{}",
                    foreign.nrows(),
                    foreign.ncols()
                ),
            }
            .at_level("reduction", level));
        }
        let mut combined = Array2::zeros((2 * n, n));
        combined.slice_mut(s![..n, ..]).assign(&r);
        combined.slice_mut(s![n.., ..]).assign(&foreign);
        let QrFactors { q, r: merged } = solver
            .qr(&combined)
            .map_err(|e| e.at_level("reduction", level))?;
        saved_factors[level] = Some(q);
        r = merged;
    }
    Ok(ReductionOutcome { r, saved_factors })
}

/// Mirror of the reduction in reverse level order.
///
/// The surviving rank starts with the identity weight; at each level an
/// active process multiplies its saved factor by the current weight, keeps
/// the top N×N block as its new weight and ships R stacked over the bottom
/// block to the rank that dropped out there. Recipients unpack R and their
/// weight, then continue their own unwind. On return every rank holds the
/// global R and the right-multiplier for its local orthogonal factor.
fn broadcast_back<G: ProcessGroup>(
    group: &G,
    outcome: ReductionOutcome,
    n: usize,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let rank = group.rank();
    let size = group.size();
    let ReductionOutcome {
        mut r,
        mut saved_factors,
    } = outcome;
    let mut weight = Array2::eye(n);
    let levels = saved_factors.len();
    for level in (0..levels).rev() {
        // A process takes part once every rank bit below this level is
        // clear; before that point it has not re-entered the unwind.
        if rank & ((1 << level) - 1) != 0 {
            continue;
        }
        let partner = rank ^ (1 << level);
        if partner >= size {
            continue;
        }
        if rank & (1 << level) != 0 {
            // Re-entry point: this process dropped out here during reduction.
            let packed = group
                .recv(partner)
                .map_err(|e| e.at_level("broadcast-back", level))?;
            if packed.dim() != (2 * n, n) {
                return Err(PodError::Communication {
                    rank,
                    detail: format!(
                        "expected a {}x{n} packed buffer from rank {partner}, got {}x{}",
                        2 * n,
                        packed.nrows(),
                        packed.ncols()
                    ),
                }
                .at_level("broadcast-back", level));
            }
            r = packed.slice(s![..n, ..]).to_owned();
            weight = packed.slice(s![n.., ..]).to_owned();
            debug!("rank {rank}: re-entered at level {level} with R and weight from rank {partner}");
        } else {
            let saved = saved_factors[level]
                .take()
                .ok_or_else(|| PodError::Communication {
                    rank,
                    detail: format!(
                        "no saved orthogonal factor for level {level}; reduction and broadcast-back guards disagree"
                    ),
                })?;
            let propagated = saved.dot(&weight);
            let mut packed = Array2::zeros((2 * n, n));
            packed.slice_mut(s![..n, ..]).assign(&r);
            packed
                .slice_mut(s![n.., ..])
                .assign(&propagated.slice(s![n.., ..]));
            weight = propagated.slice(s![..n, ..]).to_owned();
            group
                .send(partner, &packed)
                .map_err(|e| e.at_level("broadcast-back", level))?;
        }
    }
    Ok((r, weight))
}

/// Computes the SVD of a row-distributed snapshot matrix.
///
/// `local_block` is this rank's mᵢ×N share of the logical M×N matrix; every
/// rank must hold the same N, with mᵢ ≥ N. The returned singular values and
/// right vectors are identical on every rank; the left singular vectors come
/// back row-distributed.
///
/// # Errors
///
/// Fails with a dimension error when the shape contract is violated anywhere
/// in the group (validated collectively before the first round), a
/// communication fault when a partner disappears or sends a buffer of the
/// wrong shape, or a numerical failure when a local factorization does not
/// produce finite factors.
pub fn tsqr_svd<G: ProcessGroup>(
    local_block: ArrayView2<'_, f64>,
    group: &G,
) -> Result<TsqrSvdOutput> {
    let rank = group.rank();
    let size = group.size();
    let (rows, cols) = local_block.dim();
    info!("rank {rank}/{size}: TSQR-SVD on a {rows}x{cols} local block");
    collective_shape_check(group, rows, cols)?;

    let solver = DenseSolver::for_rank(rank);
    let QrFactors { q: q1, r } = solver.qr(&local_block.to_owned())?;

    let levels = reduction_levels(size);
    let outcome = reduce_to_global_r(group, &solver, r, levels)?;
    let (global_r, weight) = broadcast_back(group, outcome, cols)?;

    // Every rank now holds the same R, so recomputing its SVD locally keeps
    // S and V identical everywhere without a separate broadcast.
    let SvdFactors { u: u_r, s, vt } = solver.svd(global_r)?;
    let local_q = q1.dot(&weight);
    let local_modes = local_q.dot(&u_r);
    debug!(
        "rank {rank}: recomposed {}x{} local modes",
        local_modes.nrows(),
        local_modes.ncols()
    );
    Ok(TsqrSvdOutput {
        local_modes,
        singular_values: s,
        right_vectors: vt.t().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{run_group, SerialGroup};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn level_count_covers_padded_group_sizes() {
        assert_eq!(reduction_levels(1), 0);
        assert_eq!(reduction_levels(2), 1);
        assert_eq!(reduction_levels(3), 2);
        assert_eq!(reduction_levels(4), 2);
        assert_eq!(reduction_levels(5), 3);
        assert_eq!(reduction_levels(8), 3);
    }

    #[test]
    fn serial_run_matches_a_direct_svd() {
        let matrix = array![
            [1.0, 2.0, 0.0],
            [0.5, -1.0, 3.0],
            [2.0, 2.0, 2.0],
            [0.0, 1.0, -1.0],
            [3.0, 0.0, 0.5],
            [1.0, 1.0, 1.0],
        ];
        let output = tsqr_svd(matrix.view(), &SerialGroup).unwrap();
        let reference = DenseSolver::for_rank(0).svd(matrix.clone()).unwrap();
        for (a, b) in output.singular_values.iter().zip(reference.s.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
        // U columns orthonormal.
        let gram = output.local_modes.t().dot(&output.local_modes);
        for ((i, j), v) in gram.indexed_iter() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(*v, expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn serial_run_rejects_wide_blocks() {
        let wide = Array2::<f64>::zeros((2, 4));
        let err = tsqr_svd(wide.view(), &SerialGroup).unwrap_err();
        assert!(matches!(err, PodError::Dimension { rank: 0, .. }));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let matrix = array![
            [1.0, 0.5],
            [0.0, 2.0],
            [3.0, 1.0],
            [1.0, -1.0],
        ];
        let output = tsqr_svd(matrix.view(), &SerialGroup).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        output.save(file.path()).unwrap();
        let loaded = TsqrSvdOutput::load(file.path()).unwrap();
        assert_eq!(loaded.local_modes, output.local_modes);
        assert_eq!(loaded.singular_values, output.singular_values);
        assert_eq!(loaded.right_vectors, output.right_vectors);
    }

    #[test]
    fn disagreeing_column_counts_fail_on_every_rank_without_deadlock() {
        let results = run_group(2, |group| {
            let block = if group.rank() == 0 {
                Array2::<f64>::zeros((6, 3))
            } else {
                Array2::<f64>::zeros((6, 4))
            };
            tsqr_svd(block.view(), &group)
        });
        for result in results {
            assert!(matches!(result, Err(PodError::Dimension { .. })));
        }
    }

    #[test]
    fn undersized_peer_block_fails_on_every_rank() {
        let results = run_group(2, |group| {
            let block = if group.rank() == 0 {
                Array2::<f64>::from_elem((6, 4), 1.0)
            } else {
                // Fewer rows than columns.
                Array2::<f64>::from_elem((2, 4), 1.0)
            };
            tsqr_svd(block.view(), &group)
        });
        for result in results {
            assert!(matches!(result, Err(PodError::Dimension { .. })));
        }
    }
}
