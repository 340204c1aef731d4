//! Proper orthogonal decomposition over the distributed TSQR-SVD.
//!
//! The snapshot convention is rows = spatial degrees of freedom, columns =
//! time samples, so the temporal mean is a per-row quantity and both mean
//! removal and reconstruction stay communication-free on the local block.

use log::info;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::comm::ProcessGroup;
use crate::error::{PodError, Result};
use crate::tsqr::{tsqr_svd, TsqrSvdOutput};

/// Per-row mean over the snapshot axis.
pub fn temporal_mean(snapshots: ArrayView2<f64>) -> Array1<f64> {
    snapshots
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(snapshots.nrows()))
}

/// Subtracts a per-row mean from every snapshot column.
pub fn subtract_mean(snapshots: ArrayView2<f64>, mean: ArrayView1<f64>) -> Array2<f64> {
    let mut centered = snapshots.to_owned();
    centered -= &mean.insert_axis(Axis(1));
    centered
}

/// Runs POD on this rank's snapshot block: optional temporal mean removal
/// followed by the distributed TSQR-SVD.
pub fn run<G: ProcessGroup>(
    snapshots: ArrayView2<f64>,
    group: &G,
    remove_mean: bool,
) -> Result<TsqrSvdOutput> {
    info!(
        "rank {}: POD on {} spatial rows x {} snapshots (remove_mean = {remove_mean})",
        group.rank(),
        snapshots.nrows(),
        snapshots.ncols()
    );
    if remove_mean {
        let mean = temporal_mean(snapshots);
        let centered = subtract_mean(snapshots, mean.view());
        tsqr_svd(centered.view(), group)
    } else {
        tsqr_svd(snapshots, group)
    }
}

/// Criterion for choosing how many modes survive truncation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TruncationRule {
    /// Keep exactly this many leading modes.
    ModeCount(usize),
    /// Keep the smallest leading set whose discarded tail satisfies
    /// ‖S[k..]‖ / ‖S‖ ≤ threshold.
    ResidualEnergy(f64),
}

/// Truncates a decomposition to its leading modes.
///
/// Truncation is a purely local column slice: the retained singular values
/// and right vectors stay identical across ranks because the inputs were.
pub fn truncate(output: &TsqrSvdOutput, rule: TruncationRule) -> Result<TsqrSvdOutput> {
    let n = output.mode_count();
    let keep = match rule {
        TruncationRule::ModeCount(count) => {
            if count == 0 || count > n {
                return Err(PodError::Dimension {
                    rank: 0,
                    detail: format!("cannot keep {count} of {n} modes"),
                });
            }
            count
        }
        TruncationRule::ResidualEnergy(threshold) => {
            if !(0.0..1.0).contains(&threshold) {
                return Err(PodError::Dimension {
                    rank: 0,
                    detail: format!("residual threshold {threshold} is outside [0, 1)"),
                });
            }
            let total = output
                .singular_values
                .iter()
                .map(|v| v * v)
                .sum::<f64>()
                .sqrt();
            let mut keep = n;
            if total > 0.0 {
                for count in 1..=n {
                    let tail = output
                        .singular_values
                        .iter()
                        .skip(count)
                        .map(|v| v * v)
                        .sum::<f64>()
                        .sqrt();
                    if tail / total <= threshold {
                        keep = count;
                        break;
                    }
                }
            }
            keep
        }
    };
    info!("truncating {n} modes down to {keep}");
    Ok(TsqrSvdOutput {
        local_modes: output.local_modes.slice(s![.., ..keep]).to_owned(),
        singular_values: output.singular_values.slice(s![..keep]).to_owned(),
        right_vectors: output.right_vectors.slice(s![.., ..keep]).to_owned(),
    })
}

/// Local rows of the reconstruction U·diag(S)·Vᵀ.
pub fn reconstruct(output: &TsqrSvdOutput) -> Array2<f64> {
    let scaled = &output.local_modes * &output.singular_values;
    scaled.dot(&output.right_vectors.t())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialGroup;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn demo_output() -> TsqrSvdOutput {
        TsqrSvdOutput {
            local_modes: array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            singular_values: array![2.0, 1.0, 1e-12],
            right_vectors: Array2::eye(3),
        }
    }

    #[test]
    fn temporal_mean_and_centering() {
        let snapshots = array![[1.0, 3.0], [-2.0, 2.0]];
        let mean = temporal_mean(snapshots.view());
        assert_abs_diff_eq!(mean[0], 2.0, epsilon = 1e-15);
        assert_abs_diff_eq!(mean[1], 0.0, epsilon = 1e-15);
        let centered = subtract_mean(snapshots.view(), mean.view());
        for row in centered.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn truncation_by_count_slices_all_factors() {
        let truncated = truncate(&demo_output(), TruncationRule::ModeCount(2)).unwrap();
        assert_eq!(truncated.local_modes.dim(), (3, 2));
        assert_eq!(truncated.singular_values.len(), 2);
        assert_eq!(truncated.right_vectors.dim(), (3, 2));
    }

    #[test]
    fn truncation_by_residual_drops_the_negligible_tail() {
        let truncated = truncate(&demo_output(), TruncationRule::ResidualEnergy(1e-6)).unwrap();
        assert_eq!(truncated.mode_count(), 2);
    }

    #[test]
    fn truncation_rejects_invalid_rules() {
        let output = demo_output();
        assert!(truncate(&output, TruncationRule::ModeCount(0)).is_err());
        assert!(truncate(&output, TruncationRule::ModeCount(4)).is_err());
        assert!(truncate(&output, TruncationRule::ResidualEnergy(1.5)).is_err());
        assert!(truncate(&output, TruncationRule::ResidualEnergy(-0.1)).is_err());
    }

    #[test]
    fn full_rank_reconstruction_reproduces_the_snapshots() {
        let snapshots = array![
            [1.0, 2.0, 0.5],
            [0.0, -1.0, 1.0],
            [2.0, 0.0, 3.0],
            [1.0, 1.0, 1.0],
            [0.5, 2.0, -2.0],
        ];
        let output = run(snapshots.view(), &SerialGroup, false).unwrap();
        let rebuilt = reconstruct(&output);
        for (a, b) in rebuilt.iter().zip(snapshots.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
    }

    #[test]
    fn mean_removal_centers_before_decomposing() {
        let snapshots = array![
            [5.0, 5.0, 5.0],
            [1.0, 2.0, 3.0],
            [0.0, -1.0, 1.0],
            [4.0, 4.0, 4.0],
        ];
        let output = run(snapshots.view(), &SerialGroup, true).unwrap();
        // A constant row carries no fluctuation energy once centered, so the
        // trailing singular value collapses.
        assert!(output.singular_values[output.mode_count() - 1] < 1e-10);
    }
}
