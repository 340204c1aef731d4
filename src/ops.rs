//! Distributed matrix operations built on the collective reduction utility.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::comm::{ProcessGroup, ReduceOp};
use crate::error::{PodError, Result};

fn all_sum_scalar<G: ProcessGroup>(group: &G, value: f64) -> Result<f64> {
    group
        .reduce_sum_scalar(value, true)?
        .ok_or_else(|| PodError::Communication {
            rank: group.rank(),
            detail: "broadcasting reduce returned no value".to_string(),
        })
}

/// Product of row-distributed factors, summed across the group.
///
/// With `a` holding this rank's k×mᵢ slice and `b` its mᵢ×n slice, the
/// result is Σᵢ aᵢ·bᵢ — the product of the gathered factors — identical on
/// every rank. The typical caller is a temporal-coefficient computation
/// Uᵀ·X with both factors row-distributed.
pub fn matmul_reduced<G: ProcessGroup>(
    a: ArrayView2<f64>,
    b: ArrayView2<f64>,
    group: &G,
) -> Result<Array2<f64>> {
    if a.ncols() != b.nrows() {
        return Err(PodError::Dimension {
            rank: group.rank(),
            detail: format!(
                "cannot multiply {}x{} by {}x{}",
                a.nrows(),
                a.ncols(),
                b.nrows(),
                b.ncols()
            ),
        });
    }
    let partial = a.dot(&b);
    group.all_reduce(&partial, ReduceOp::Sum)
}

/// Global relative RMSE between a row-distributed reference and its
/// approximation: sqrt(Σ‖Aᵢ−Bᵢ‖² / Σ‖Aᵢ‖²), identical on every rank.
///
/// The two global sums come from separate reductions, so the value is not
/// bit-for-bit reproducible across different group sizes; the discrepancy is
/// bounded by the floating-point summation order.
pub fn relative_rmse<G: ProcessGroup>(
    reference: ArrayView2<f64>,
    approximation: ArrayView2<f64>,
    group: &G,
) -> Result<f64> {
    if reference.dim() != approximation.dim() {
        return Err(PodError::Dimension {
            rank: group.rank(),
            detail: format!(
                "reference block is {:?} but approximation is {:?}",
                reference.dim(),
                approximation.dim()
            ),
        });
    }
    let (diff_sq, ref_sq) = (0..reference.nrows())
        .into_par_iter()
        .map(|i| {
            let mut diff_acc = 0.0f64;
            let mut ref_acc = 0.0f64;
            for (&x, &y) in reference.row(i).iter().zip(approximation.row(i).iter()) {
                let d = x - y;
                diff_acc += d * d;
                ref_acc += x * x;
            }
            (diff_acc, ref_acc)
        })
        .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

    let diff_total = all_sum_scalar(group, diff_sq)?;
    let ref_total = all_sum_scalar(group, ref_sq)?;
    if ref_total == 0.0 {
        return Err(PodError::Numerical {
            rank: group.rank(),
            operation: "relative_rmse",
            detail: "reference matrix has zero norm".to_string(),
        });
    }
    Ok((diff_total / ref_total).sqrt())
}
