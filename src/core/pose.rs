//! Planar pose and position algebra.
//!
//! [`Pose2D`] is an element of SE(2) and [`Point2D`] an element of the
//! plane it acts on. The estimators are written against the group
//! surface: `+` composes poses and applies them to points, unary `-`
//! inverts, so that `-a + b` is the motion taking frame `a` to frame `b`
//! and `-p + x` expresses world point `x` in the frame of `p`.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::math::normalize_angle;

/// A point in the plane, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2D {
    /// X coordinate in meters.
    pub x: f64,
    /// Y coordinate in meters.
    pub y: f64,
}

impl Point2D {
    /// Create a new point.
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// The origin.
    #[inline]
    pub fn origin() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    /// Squared distance to another point (avoids sqrt).
    #[inline]
    pub fn distance_squared(&self, other: &Point2D) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Distance to another point.
    #[inline]
    pub fn distance(&self, other: &Point2D) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Distance from the origin.
    #[inline]
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// View as a 2-vector.
    #[inline]
    pub fn to_vector(self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    /// Build from a 2-vector.
    #[inline]
    pub fn from_vector(v: Vector2<f64>) -> Self {
        Self { x: v[0], y: v[1] }
    }
}

impl std::ops::Add for Point2D {
    type Output = Point2D;
    #[inline]
    fn add(self, rhs: Point2D) -> Point2D {
        Point2D::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Point2D {
    type Output = Point2D;
    #[inline]
    fn sub(self, rhs: Point2D) -> Point2D {
        Point2D::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Robot pose in the plane: position `(x, y)` in meters and heading
/// `theta` in radians, normalized to [-π, π].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    /// X position in meters.
    pub x: f64,
    /// Y position in meters.
    pub y: f64,
    /// Heading in radians, normalized to [-π, π].
    pub theta: f64,
}

impl Pose2D {
    /// Create a new pose with theta normalized to [-π, π].
    #[inline]
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self {
            x,
            y,
            theta: normalize_angle(theta),
        }
    }

    /// Identity pose at the origin with zero heading.
    #[inline]
    pub fn identity() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
        }
    }

    /// Compose two poses: apply `other` relative to `self`'s frame.
    ///
    /// ```text
    /// C = A ∘ B:
    ///   C.x = A.x + B.x * cos(A.θ) - B.y * sin(A.θ)
    ///   C.y = A.y + B.x * sin(A.θ) + B.y * cos(A.θ)
    ///   C.θ = normalize(A.θ + B.θ)
    /// ```
    #[inline]
    pub fn compose(&self, other: &Pose2D) -> Pose2D {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Pose2D::new(
            self.x + other.x * cos_t - other.y * sin_t,
            self.y + other.x * sin_t + other.y * cos_t,
            self.theta + other.theta,
        )
    }

    /// Inverse of this pose: the transform that undoes it.
    #[inline]
    pub fn inverse(&self) -> Pose2D {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Pose2D::new(
            -self.x * cos_t - self.y * sin_t,
            self.x * sin_t - self.y * cos_t,
            -self.theta,
        )
    }

    /// Transform a point from this pose's frame to the world frame.
    #[inline]
    pub fn transform_point(&self, point: &Point2D) -> Point2D {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Point2D::new(
            self.x + point.x * cos_t - point.y * sin_t,
            self.y + point.x * sin_t + point.y * cos_t,
        )
    }

    /// The translation component.
    #[inline]
    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }

    /// Coordinates `(x, y, θ)` as a 3-vector.
    #[inline]
    pub fn to_vector(self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.theta)
    }

    /// Build from `(x, y, θ)` coordinates, normalizing the angle.
    #[inline]
    pub fn from_vector(v: Vector3<f64>) -> Self {
        Pose2D::new(v[0], v[1], v[2])
    }
}

impl Default for Pose2D {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Add for Pose2D {
    type Output = Pose2D;
    #[inline]
    fn add(self, rhs: Pose2D) -> Pose2D {
        self.compose(&rhs)
    }
}

impl std::ops::Add<Point2D> for Pose2D {
    type Output = Point2D;
    #[inline]
    fn add(self, rhs: Point2D) -> Point2D {
        self.transform_point(&rhs)
    }
}

impl std::ops::Neg for Pose2D {
    type Output = Pose2D;
    #[inline]
    fn neg(self) -> Pose2D {
        self.inverse()
    }
}
