//! Control and observation models for the planar landmark robot.
//!
//! A [`ControlModel`] is a Gaussian over the pose increment one control
//! produces, expressed in the frame of the pose it starts from. An
//! [`ObservationModel`] is a Gaussian over the `(range, bearing)` reading
//! of a landmark, expressed in the frame of the observing pose.
//!
//! Both expose the same surface the estimators consume: the mean and
//! Cholesky factor in measurement coordinates, a sampler, a log
//! likelihood over the *result* type (pose increment / relative landmark
//! position), and the `observe`/`subtract` pair the graph backend uses to
//! build residuals with wrapped angular components.

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use rand::Rng;

use crate::core::gaussian::Gaussian;
use crate::core::math::normalize_angle;
use crate::core::pose::{Point2D, Pose2D};
use crate::error::Result;

/// Gaussian over the pose increment `(dx, dy, dθ)` produced by one
/// control, in the frame of the starting pose.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlModel {
    dist: Gaussian<3>,
}

impl ControlModel {
    /// Dimension of the control measurement space.
    pub const DIM: usize = 3;

    /// Construct from an increment mean and a lower-triangular Cholesky
    /// factor of the increment covariance.
    pub fn new(mean: Vector3<f64>, chol_cov: Matrix3<f64>) -> Self {
        Self {
            dist: Gaussian::new(mean, chol_cov),
        }
    }

    /// Construct from an increment mean and a full covariance.
    pub fn from_covariance(mean: Vector3<f64>, cov: Matrix3<f64>) -> Result<Self> {
        Ok(Self {
            dist: Gaussian::from_covariance(mean, cov)?,
        })
    }

    /// Mean increment in measurement coordinates.
    #[inline]
    pub fn mean(&self) -> &Vector3<f64> {
        self.dist.mean()
    }

    /// Mean increment as a pose.
    #[inline]
    pub fn mean_pose(&self) -> Pose2D {
        Pose2D::from_vector(*self.dist.mean())
    }

    /// Lower-triangular Cholesky factor of the increment covariance.
    #[inline]
    pub fn chol_cov(&self) -> &Matrix3<f64> {
        self.dist.chol_cov()
    }

    /// The underlying distribution over increment coordinates.
    #[inline]
    pub fn dist(&self) -> &Gaussian<3> {
        &self.dist
    }

    /// Draw a pose increment.
    pub fn sample_pose<R: Rng + ?Sized>(&self, rng: &mut R) -> Pose2D {
        Pose2D::from_vector(self.dist.sample(rng))
    }

    /// Log likelihood of a pose increment, with the angular component of
    /// the residual wrapped.
    pub fn log_likelihood(&self, increment: &Pose2D) -> f64 {
        let d = Self::subtract(&Self::observe(increment), self.mean());
        self.dist.log_likelihood_residual(&d)
    }

    /// Map a pose increment into measurement coordinates.
    #[inline]
    pub fn observe(increment: &Pose2D) -> Vector3<f64> {
        increment.to_vector()
    }

    /// Residual between two measurements; the angular component takes the
    /// short way around the circle.
    #[inline]
    pub fn subtract(a: &Vector3<f64>, b: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(a[0] - b[0], a[1] - b[1], normalize_angle(a[2] - b[2]))
    }
}

/// Gaussian over the `(range, bearing)` reading of a landmark, in the
/// frame of the observing pose.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationModel {
    dist: Gaussian<2>,
}

impl ObservationModel {
    /// Dimension of the observation measurement space.
    pub const DIM: usize = 2;

    /// Construct from a `(range, bearing)` mean and a lower-triangular
    /// Cholesky factor of the reading covariance.
    ///
    /// The range must be positive.
    pub fn new(mean: Vector2<f64>, chol_cov: Matrix2<f64>) -> Self {
        assert!(mean[0] > 0.0, "observation range must be positive: {}", mean[0]);
        Self {
            dist: Gaussian::new(Vector2::new(mean[0], normalize_angle(mean[1])), chol_cov),
        }
    }

    /// Construct from a mean and a full covariance.
    pub fn from_covariance(mean: Vector2<f64>, cov: Matrix2<f64>) -> Result<Self> {
        assert!(mean[0] > 0.0, "observation range must be positive: {}", mean[0]);
        Ok(Self {
            dist: Gaussian::from_covariance(Vector2::new(mean[0], normalize_angle(mean[1])), cov)?,
        })
    }

    /// The reading a sensor at `pose` would produce for the world-frame
    /// landmark `feature`, wrapped into a model with the given noise
    /// factor.
    pub fn from_landmark(pose: &Pose2D, feature: &Point2D, chol_cov: Matrix2<f64>) -> Self {
        let rel = -*pose + *feature;
        Self::new(Self::observe(&rel), chol_cov)
    }

    /// Mean reading in measurement coordinates.
    #[inline]
    pub fn mean(&self) -> &Vector2<f64> {
        self.dist.mean()
    }

    /// The relative landmark position implied by the mean reading.
    #[inline]
    pub fn mean_feature(&self) -> Point2D {
        Self::inv_observe(self.dist.mean())
    }

    /// Lower-triangular Cholesky factor of the reading covariance.
    #[inline]
    pub fn chol_cov(&self) -> &Matrix2<f64> {
        self.dist.chol_cov()
    }

    /// The underlying distribution over reading coordinates.
    #[inline]
    pub fn dist(&self) -> &Gaussian<2> {
        &self.dist
    }

    /// Draw a relative landmark position.
    pub fn sample_feature<R: Rng + ?Sized>(&self, rng: &mut R) -> Point2D {
        Self::inv_observe(&self.dist.sample(rng))
    }

    /// Log likelihood of a relative landmark position, with the bearing
    /// residual wrapped.
    pub fn log_likelihood(&self, rel: &Point2D) -> f64 {
        let d = Self::subtract(&Self::observe(rel), self.mean());
        self.dist.log_likelihood_residual(&d)
    }

    /// Map a relative landmark position to a `(range, bearing)` reading.
    #[inline]
    pub fn observe(rel: &Point2D) -> Vector2<f64> {
        Vector2::new(rel.norm(), rel.y.atan2(rel.x))
    }

    /// Map a `(range, bearing)` reading back to a relative position.
    #[inline]
    pub fn inv_observe(z: &Vector2<f64>) -> Point2D {
        let (sin_b, cos_b) = z[1].sin_cos();
        Point2D::new(z[0] * cos_b, z[0] * sin_b)
    }

    /// Residual between two readings; the bearing takes the short way
    /// around the circle.
    #[inline]
    pub fn subtract(a: &Vector2<f64>, b: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(a[0] - b[0], normalize_angle(a[1] - b[1]))
    }
}
