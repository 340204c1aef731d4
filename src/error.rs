//! Error types for the distributed decomposition.

use thiserror::Error;

/// Result type alias using the crate's [`PodError`].
pub type Result<T> = std::result::Result<T, PodError>;

/// Errors surfaced by the distributed TSQR-SVD and its collective utilities.
///
/// All variants are fatal to the current invocation; there are no retries.
/// Each variant carries the reporting rank plus enough shape/level context to
/// diagnose which process and which exchange round went wrong.
#[derive(Error, Debug)]
pub enum PodError {
    /// A local block violates the tall-skinny contract, or column counts
    /// disagree across the process group.
    #[error("dimension error on rank {rank}: {detail}")]
    Dimension { rank: usize, detail: String },

    /// A partner failed to respond within the bounded wait, a peer endpoint
    /// disconnected, or a received buffer did not match the expected shape.
    #[error("communication fault on rank {rank}: {detail}")]
    Communication { rank: usize, detail: String },

    /// A dense factorization failed or produced a non-finite result.
    #[error("numerical failure on rank {rank} during {operation}: {detail}")]
    Numerical {
        rank: usize,
        operation: &'static str,
        detail: String,
    },
}

impl PodError {
    /// Tags a fault with the exchange phase and level it occurred in.
    ///
    /// The point-to-point primitives do not know which round of the butterfly
    /// they are serving; the orchestrator adds that context on the way up.
    pub(crate) fn at_level(self, phase: &str, level: usize) -> Self {
        match self {
            PodError::Communication { rank, detail } => PodError::Communication {
                rank,
                detail: format!("{detail} ({phase} level {level})"),
            },
            PodError::Numerical {
                rank,
                operation,
                detail,
            } => PodError::Numerical {
                rank,
                operation,
                detail: format!("{detail} ({phase} level {level})"),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn communication_fault_reports_phase_and_level() {
        let err = PodError::Communication {
            rank: 2,
            detail: "no message from rank 3".to_string(),
        }
        .at_level("reduction", 1);
        let msg = err.to_string();
        assert!(msg.contains("rank 2"));
        assert!(msg.contains("reduction level 1"));
    }

    #[test]
    fn dimension_error_is_untouched_by_level_tagging() {
        let err = PodError::Dimension {
            rank: 0,
            detail: "block is 3x10".to_string(),
        }
        .at_level("reduction", 0);
        assert!(matches!(err, PodError::Dimension { rank: 0, .. }));
    }
}
