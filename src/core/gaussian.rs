//! Cholesky-factored multivariate normal distributions.
//!
//! Covariances are carried exclusively as lower-triangular Cholesky
//! factors. Sampling and likelihood evaluation work on the factor
//! directly; the full covariance matrix is only materialized on request
//! (mainly by tests).

use nalgebra::{Cholesky, SMatrix, SVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};

const LOG_TWO_PI: f64 = 1.837_877_066_409_345_3;

/// A multivariate normal over R^N, stored as mean and lower-triangular
/// Cholesky factor of the covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian<const N: usize> {
    mean: SVector<f64, N>,
    chol: SMatrix<f64, N, N>,
}

impl<const N: usize> Gaussian<N> {
    /// Construct from a mean and a lower-triangular Cholesky factor.
    pub fn new(mean: SVector<f64, N>, chol: SMatrix<f64, N, N>) -> Self {
        Self { mean, chol }
    }

    /// Construct from a mean and a full covariance matrix.
    ///
    /// Fails with [`Error::NotPositiveDefinite`] if the covariance cannot
    /// be factored.
    pub fn from_covariance(mean: SVector<f64, N>, cov: SMatrix<f64, N, N>) -> Result<Self> {
        let chol = Cholesky::new(cov)
            .ok_or(Error::NotPositiveDefinite {
                context: "gaussian construction",
            })?
            .l();
        Ok(Self { mean, chol })
    }

    /// A degenerate distribution concentrated at `mean`.
    pub fn dirac(mean: SVector<f64, N>) -> Self {
        Self {
            mean,
            chol: SMatrix::zeros(),
        }
    }

    #[inline]
    pub fn mean(&self) -> &SVector<f64, N> {
        &self.mean
    }

    #[inline]
    pub fn mean_mut(&mut self) -> &mut SVector<f64, N> {
        &mut self.mean
    }

    /// Lower-triangular Cholesky factor of the covariance.
    #[inline]
    pub fn chol_cov(&self) -> &SMatrix<f64, N, N> {
        &self.chol
    }

    #[inline]
    pub fn chol_cov_mut(&mut self) -> &mut SMatrix<f64, N, N> {
        &mut self.chol
    }

    /// The full covariance `L Lᵀ`.
    pub fn covariance(&self) -> SMatrix<f64, N, N> {
        self.chol * self.chol.transpose()
    }

    /// Draw a sample: `mean + L z` with `z` standard normal.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SVector<f64, N> {
        let z = SVector::<f64, N>::from_fn(|_, _| rng.sample(StandardNormal));
        self.mean + self.chol * z
    }

    /// Log density at `x`.
    ///
    /// Uses a triangular solve against the factor; neither the covariance
    /// nor its inverse is formed. A zero pivot yields negative infinity
    /// (the distribution is degenerate along that direction).
    pub fn log_likelihood(&self, x: &SVector<f64, N>) -> f64 {
        self.log_likelihood_residual(&(x - self.mean))
    }

    /// Log density of a point whose (possibly wrapped) residual from the
    /// mean is `d`.
    pub fn log_likelihood_residual(&self, d: &SVector<f64, N>) -> f64 {
        match self.chol.solve_lower_triangular(d) {
            Some(y) => {
                let log_det: f64 = (0..N).map(|i| self.chol[(i, i)].ln()).sum();
                -0.5 * (N as f64) * LOG_TWO_PI - log_det - 0.5 * y.norm_squared()
            }
            None => f64::NEG_INFINITY,
        }
    }
}
