//! Scaled unscented transform primitives.
//!
//! Both operations approximate a Gaussian pushed through a nonlinear map
//! by 2n+1 sigma points drawn from the input's Cholesky factor. The
//! output covariance is re-estimated from the transformed points and
//! refactored, so covariances stay in Cholesky form end to end and no
//! Jacobians appear anywhere.
//!
//! Measurement spaces with circular components supply a `residual`
//! closure (the model's wrapped subtraction) so sigma-point statistics
//! are taken the short way around the circle.

use nalgebra::{Cholesky, SMatrix, SVector};
use serde::{Deserialize, Serialize};

use crate::core::gaussian::Gaussian;
use crate::error::{Error, Result};

/// Scaling parameters of the sigma-point set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnscentedParams {
    /// Spread of the sigma points around the mean.
    pub alpha: f64,
    /// Prior-knowledge term for the center covariance weight; 2 is
    /// optimal for Gaussian inputs.
    pub beta: f64,
    /// Secondary scaling, usually 0.
    pub kappa: f64,
}

impl Default for UnscentedParams {
    fn default() -> Self {
        Self {
            alpha: 0.002,
            beta: 2.0,
            kappa: 0.0,
        }
    }
}

/// Sigma-point weights for one input dimension, generated once per
/// `(dim, alpha, beta, kappa)` tuple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnscentedWeights {
    dim: usize,
    /// Sigma point spread: sqrt(n + λ).
    scale: f64,
    /// Covariance weight of the center point; the symmetric points all
    /// carry `w_rest`. Means are accumulated as residuals about the
    /// center point, which folds the center mean weight in implicitly
    /// since the weights sum to one.
    w_cov0: f64,
    w_rest: f64,
}

impl UnscentedWeights {
    /// Weights for an input of dimension `dim`.
    pub fn new(dim: usize, params: &UnscentedParams) -> Self {
        let n = dim as f64;
        let lambda = params.alpha * params.alpha * (n + params.kappa) - n;
        let w_mean0 = lambda / (n + lambda);
        Self {
            dim,
            scale: (n + lambda).sqrt(),
            w_cov0: w_mean0 + 1.0 - params.alpha * params.alpha + params.beta,
            w_rest: 1.0 / (2.0 * (n + lambda)),
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }
}

/// The 2N+1 sigma points of a distribution: the mean, then the plus and
/// minus excursions along each column of the Cholesky factor.
fn sigma_points<const N: usize>(
    weights: &UnscentedWeights,
    dist: &Gaussian<N>,
) -> Vec<SVector<f64, N>> {
    assert_eq!(
        weights.dim, N,
        "unscented weights generated for dimension {} applied to dimension {}",
        weights.dim, N
    );
    let mut points = Vec::with_capacity(2 * N + 1);
    points.push(*dist.mean());
    for i in 0..N {
        let excursion = weights.scale * dist.chol_cov().column(i);
        points.push(dist.mean() + excursion);
        points.push(dist.mean() - excursion);
    }
    points
}

/// Weighted mean of transformed sigma points, accumulated through the
/// residual so circular components average correctly.
fn sigma_mean<const M: usize>(
    weights: &UnscentedWeights,
    points: &[SVector<f64, M>],
    residual: &impl Fn(&SVector<f64, M>, &SVector<f64, M>) -> SVector<f64, M>,
) -> SVector<f64, M> {
    let mut delta = SVector::<f64, M>::zeros();
    for point in &points[1..] {
        delta += weights.w_rest * residual(point, &points[0]);
    }
    points[0] + delta
}

/// Push a Gaussian through `f`, optionally adding independent noise with
/// the given Cholesky factor to the output.
///
/// Fails with [`Error::NotPositiveDefinite`] if the transformed
/// covariance cannot be refactored.
pub fn unscented_transform<const N: usize, const M: usize>(
    weights: &UnscentedWeights,
    f: impl Fn(&SVector<f64, N>) -> SVector<f64, M>,
    input: &Gaussian<N>,
    noise_chol: Option<&SMatrix<f64, M, M>>,
    residual: impl Fn(&SVector<f64, M>, &SVector<f64, M>) -> SVector<f64, M>,
) -> Result<Gaussian<M>> {
    let transformed: Vec<SVector<f64, M>> = sigma_points(weights, input).iter().map(|x| f(x)).collect();
    let mean = sigma_mean(weights, &transformed, &residual);

    let mut cov = SMatrix::<f64, M, M>::zeros();
    let d0 = residual(&transformed[0], &mean);
    cov += weights.w_cov0 * d0 * d0.transpose();
    for point in &transformed[1..] {
        let d = residual(point, &mean);
        cov += weights.w_rest * d * d.transpose();
    }
    if let Some(r) = noise_chol {
        cov += r * r.transpose();
    }

    let chol = Cholesky::new(cov)
        .ok_or(Error::NotPositiveDefinite {
            context: "unscented transform",
        })?
        .l();
    Ok(Gaussian::new(mean, chol))
}

/// Condition a joint Gaussian on a measurement through the observation
/// map `h`, using the Kalman gain computed from sigma points.
///
/// `measurement` is the observed value and `noise_chol` the Cholesky
/// factor of the measurement noise. On success the joint's mean and
/// factor are replaced by the conditioned ones.
pub fn unscented_update<const N: usize, const M: usize>(
    weights: &UnscentedWeights,
    h: impl Fn(&SVector<f64, N>) -> SVector<f64, M>,
    joint: &mut Gaussian<N>,
    measurement: &SVector<f64, M>,
    noise_chol: &SMatrix<f64, M, M>,
    residual: impl Fn(&SVector<f64, M>, &SVector<f64, M>) -> SVector<f64, M>,
) -> Result<()> {
    let points = sigma_points(weights, joint);
    let predicted: Vec<SVector<f64, M>> = points.iter().map(|x| h(x)).collect();
    let predicted_mean = sigma_mean(weights, &predicted, &residual);

    let mut innovation_cov = noise_chol * noise_chol.transpose();
    let mut cross_cov = SMatrix::<f64, N, M>::zeros();
    for (i, (x, z)) in points.iter().zip(&predicted).enumerate() {
        let w = if i == 0 { weights.w_cov0 } else { weights.w_rest };
        let dx = x - joint.mean();
        let dz = residual(z, &predicted_mean);
        innovation_cov += w * dz * dz.transpose();
        cross_cov += w * dx * dz.transpose();
    }

    let innovation_chol = Cholesky::new(innovation_cov).ok_or(Error::NotPositiveDefinite {
        context: "innovation covariance",
    })?;

    // K = C S⁻¹, computed as Kᵀ = S⁻¹ Cᵀ through the factor of S
    let gain = innovation_chol.solve(&cross_cov.transpose()).transpose();
    let innovation = residual(measurement, &predicted_mean);

    let mean = joint.mean() + gain * innovation;
    let gain_s = gain * innovation_cov;
    let cov = joint.covariance() - gain_s * gain.transpose();

    let chol = Cholesky::new(cov)
        .ok_or(Error::NotPositiveDefinite {
            context: "unscented update",
        })?
        .l();
    *joint = Gaussian::new(mean, chol);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix2, Matrix2x3, Matrix3, Vector2, Vector3};

    fn plain<const M: usize>(a: &SVector<f64, M>, b: &SVector<f64, M>) -> SVector<f64, M> {
        a - b
    }

    #[test]
    fn test_transform_reproduces_affine_map() {
        let weights = UnscentedWeights::new(3, &UnscentedParams::default());
        let a = Matrix2x3::new(1.0, 2.0, 0.0, -1.0, 0.5, 3.0);
        let b = Vector2::new(0.3, -0.7);

        let cov = Matrix3::new(
            0.8, 0.1, 0.0, //
            0.1, 0.5, 0.2, //
            0.0, 0.2, 0.9,
        );
        let input = Gaussian::from_covariance(Vector3::new(1.0, -2.0, 0.5), cov).unwrap();

        let output =
            unscented_transform(&weights, |x| a * x + b, &input, None, plain).unwrap();

        let expected_mean = a * input.mean() + b;
        let expected_cov = a * cov * a.transpose();
        assert_relative_eq!(*output.mean(), expected_mean, epsilon = 1e-9);
        assert_relative_eq!(output.covariance(), expected_cov, epsilon = 1e-9);
    }

    #[test]
    fn test_transform_adds_noise_covariance() {
        let weights = UnscentedWeights::new(2, &UnscentedParams::default());
        let input = Gaussian::new(Vector2::zeros(), Matrix2::identity());
        let noise = Matrix2::identity() * 0.5;

        let output =
            unscented_transform(&weights, |x| *x, &input, Some(&noise), plain).unwrap();

        let expected = Matrix2::identity() + noise * noise.transpose();
        assert_relative_eq!(output.covariance(), expected, epsilon = 1e-9);
    }

    #[test]
    #[should_panic(expected = "dimension")]
    fn test_mismatched_weights_rejected() {
        let weights = UnscentedWeights::new(3, &UnscentedParams::default());
        let input = Gaussian::new(Vector2::zeros(), Matrix2::identity());
        let _ = unscented_transform(&weights, |x| *x, &input, None, plain);
    }

    #[test]
    fn test_update_matches_linear_kalman() {
        // x ~ N(0, I), z = x0 observed as 1.0 with unit noise:
        // posterior over x0 is N(0.5, 0.5), x1 untouched.
        let weights = UnscentedWeights::new(2, &UnscentedParams::default());
        let mut joint = Gaussian::new(Vector2::zeros(), Matrix2::identity());

        unscented_update(
            &weights,
            |x: &Vector2<f64>| nalgebra::Vector1::new(x[0]),
            &mut joint,
            &nalgebra::Vector1::new(1.0),
            &nalgebra::Matrix1::new(1.0),
            plain,
        )
        .unwrap();

        assert_relative_eq!(joint.mean()[0], 0.5, epsilon = 1e-9);
        assert_relative_eq!(joint.mean()[1], 0.0, epsilon = 1e-9);
        let cov = joint.covariance();
        assert_relative_eq!(cov[(0, 0)], 0.5, epsilon = 1e-9);
        assert_relative_eq!(cov[(1, 1)], 1.0, epsilon = 1e-9);
        assert_relative_eq!(cov[(0, 1)], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_update_shrinks_uncertainty() {
        let weights = UnscentedWeights::new(2, &UnscentedParams::default());
        let mut joint = Gaussian::new(Vector2::new(1.0, 2.0), Matrix2::identity());
        let before = joint.covariance().trace();

        unscented_update(
            &weights,
            |x: &Vector2<f64>| *x,
            &mut joint,
            &Vector2::new(1.2, 1.9),
            &(Matrix2::identity() * 0.1),
            plain,
        )
        .unwrap();

        assert!(joint.covariance().trace() < before);
    }
}
