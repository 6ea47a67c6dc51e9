//! Error types for the estimation core.
//!
//! # Failure taxonomy
//!
//! The estimators distinguish three kinds of trouble:
//!
//! - **Precondition violations** (non-monotonic timesteps, queries for
//!   features that were never observed, mismatched lengths) break the
//!   library contract. These are checked with `assert!` and abort with a
//!   diagnostic; there is no recovery path.
//!
//! - **Numerical failures** are represented by [`Error`] so the driver can
//!   decide to reset. A covariance that loses positive definiteness after
//!   an update, a Cholesky factor with a zero pivot, or a particle
//!   population whose weights have all underflowed each map to a distinct
//!   variant.
//!
//! - **Solver non-convergence** in the graph backend is *not* an error; it
//!   is reported through `OptimizeResult`.
//!
//! Missing observations, empty feature maps and zero-length trajectories
//! are ordinary states with empty-result semantics.

use thiserror::Error;

/// Numerical failures surfaced by the estimation core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A covariance matrix lost positive definiteness and could not be
    /// re-factored.
    #[error("covariance not positive definite in {context}")]
    NotPositiveDefinite {
        /// Which computation produced the matrix.
        context: &'static str,
    },

    /// A triangular factor had a zero pivot.
    #[error("singular Cholesky factor in {context}")]
    SingularFactor {
        /// Which computation used the factor.
        context: &'static str,
    },

    /// Every particle weight underflowed to zero; the population cannot be
    /// resampled.
    #[error("particle weights sum to zero; population cannot be resampled")]
    ParticleDepletion,
}

pub type Result<T> = std::result::Result<T, Error>;
