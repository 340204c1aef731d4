// src/linalg.rs

//! Local dense solver: QR and SVD of small/medium dense blocks.
//!
//! The numerical kernels live in `ndarray-linalg` (LAPACK behind the cargo
//! backend features); this module only wraps them behind the seam the
//! orchestration code calls, enforcing the tall-skinny row contract and
//! checking results for finiteness. The decomposition treats these as
//! correctness-critical black boxes and never reimplements them.

use ndarray::{Array1, Array2};
use ndarray_linalg::{SVDInto, QR};

use crate::error::{PodError, Result};

/// Thin QR factors of a tall dense block.
///
/// `q` has orthonormal columns with the block's row count, `r` is
/// upper-triangular with the block's column count on both sides.
#[derive(Debug)]
pub struct QrFactors {
    pub q: Array2<f64>,
    pub r: Array2<f64>,
}

/// Thin SVD factors. `s` is sorted descending and non-negative.
#[derive(Debug)]
pub struct SvdFactors {
    pub u: Array2<f64>,
    pub s: Array1<f64>,
    pub vt: Array2<f64>,
}

/// Trait for thin QR factorization keeping both factors.
pub trait DenseQr {
    /// `rank` tags failures with the reporting process.
    fn qr_factors(&self, matrix: &Array2<f64>, rank: usize) -> Result<QrFactors>;
}

/// Trait for thin SVD consuming its input.
pub trait DenseSvd {
    fn svd_factors(&self, matrix: Array2<f64>, rank: usize) -> Result<SvdFactors>;
}

/// `ndarray-linalg` backed implementation of the dense kernels.
#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlg;

fn require_finite(rank: usize, operation: &'static str, values: &[&[f64]]) -> Result<()> {
    for slice in values {
        if slice.iter().any(|v| !v.is_finite()) {
            return Err(PodError::Numerical {
                rank,
                operation,
                detail: "factor contains non-finite values".to_string(),
            });
        }
    }
    Ok(())
}

impl DenseQr for NdarrayLinAlg {
    fn qr_factors(&self, matrix: &Array2<f64>, rank: usize) -> Result<QrFactors> {
        let (rows, cols) = matrix.dim();
        if rows < cols {
            return Err(PodError::Dimension {
                rank,
                detail: format!(
                    "block is {rows}x{cols}; the tall-skinny factorization needs rows >= cols"
                ),
            });
        }
        let (q, r) = matrix.qr().map_err(|e| PodError::Numerical {
            rank,
            operation: "qr",
            detail: e.to_string(),
        })?;
        require_finite(
            rank,
            "qr",
            &[
                q.as_slice_memory_order().unwrap_or(&[]),
                r.as_slice_memory_order().unwrap_or(&[]),
            ],
        )?;
        Ok(QrFactors { q, r })
    }
}

impl DenseSvd for NdarrayLinAlg {
    fn svd_factors(&self, matrix: Array2<f64>, rank: usize) -> Result<SvdFactors> {
        let to_numerical = |detail: String| PodError::Numerical {
            rank,
            operation: "svd",
            detail,
        };
        let (u, s, vt) = matrix
            .svd_into(true, true)
            .map_err(|e| to_numerical(e.to_string()))?;
        let u = u.ok_or_else(|| to_numerical("left singular vectors were not computed".into()))?;
        let vt =
            vt.ok_or_else(|| to_numerical("right singular vectors were not computed".into()))?;
        require_finite(
            rank,
            "svd",
            &[
                u.as_slice_memory_order().unwrap_or(&[]),
                s.as_slice_memory_order().unwrap_or(&[]),
                vt.as_slice_memory_order().unwrap_or(&[]),
            ],
        )?;
        Ok(SvdFactors { u, s, vt })
    }
}

/// Front the orchestration code calls instead of naming a backend directly.
///
/// Carries the calling rank so factorization failures report which process
/// they happened on. Swapping the dense backend means swapping the field
/// type here.
#[derive(Debug, Default, Copy, Clone)]
pub struct DenseSolver {
    rank: usize,
    backend: NdarrayLinAlg,
}

impl DenseSolver {
    pub fn for_rank(rank: usize) -> Self {
        Self {
            rank,
            backend: NdarrayLinAlg,
        }
    }

    pub fn qr(&self, matrix: &Array2<f64>) -> Result<QrFactors> {
        self.backend.qr_factors(matrix, self.rank)
    }

    pub fn svd(&self, matrix: Array2<f64>) -> Result<SvdFactors> {
        self.backend.svd_factors(matrix, self.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn assert_matrices_close(a: &Array2<f64>, b: &Array2<f64>, eps: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = eps);
        }
    }

    #[test]
    fn qr_reproduces_the_block_with_orthonormal_q() {
        let block = array![
            [2.0, -1.0, 0.5],
            [0.0, 3.0, 1.0],
            [1.0, 1.0, -2.0],
            [4.0, 0.0, 0.0],
            [-1.0, 2.0, 2.0],
        ];
        let solver = DenseSolver::for_rank(0);
        let QrFactors { q, r } = solver.qr(&block).unwrap();
        assert_eq!(q.dim(), (5, 3));
        assert_eq!(r.dim(), (3, 3));
        assert_matrices_close(&q.dot(&r), &block, 1e-12);
        assert_matrices_close(&q.t().dot(&q), &Array2::eye(3), 1e-12);
        // Upper-triangular below the diagonal.
        for i in 1..3 {
            for j in 0..i {
                assert_abs_diff_eq!(r[[i, j]], 0.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn qr_rejects_wide_blocks() {
        let wide = Array2::<f64>::zeros((2, 5));
        let err = DenseSolver::for_rank(3).qr(&wide).unwrap_err();
        match err {
            PodError::Dimension { rank: 3, detail } => {
                assert!(detail.contains("2x5"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn svd_is_descending_and_reconstructs() {
        let matrix = array![
            [3.0, 1.0, 0.0],
            [1.0, -2.0, 1.0],
            [0.0, 1.0, 4.0],
        ];
        let solver = DenseSolver::for_rank(0);
        let SvdFactors { u, s, vt } = solver.svd(matrix.clone()).unwrap();
        assert!(s.iter().all(|&v| v >= 0.0));
        assert!(s.windows(2).into_iter().all(|w| w[0] >= w[1]));
        let rebuilt = u.dot(&Array2::from_diag(&s)).dot(&vt);
        assert_matrices_close(&rebuilt, &matrix, 1e-12);
    }
}
