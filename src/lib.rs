//! TarakaSLAM - posterior estimation core for planar landmark SLAM
//!
//! Three interchangeable estimators maintain a posterior over a robot's
//! trajectory and the positions of the landmarks it senses, all fed by
//! one append-only event log:
//!
//! - **FastSLAM 2.0** ([`engine::fastslam`]): a Rao-Blackwellized
//!   particle filter. Sampled trajectories share ancestry through
//!   reference-counted lists; per-particle landmark posteriors live in a
//!   copy-on-write map; the state proposal runs through the unscented
//!   transform.
//! - **MCMC-SLAM** ([`engine::mcmc_slam`]): Metropolis-Hastings over the
//!   spanning-tree factorization of the pose graph, with Fenwick-indexed
//!   weighted edge selection.
//! - **Graph-SLAM** ([`engine::graph_slam`]): sparse nonlinear least
//!   squares over a pose-landmark factor graph, solved by
//!   Levenberg-Marquardt.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    engine/                          │  ← Estimators
//! │        (fastslam, mcmc_slam, graph_slam)            │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     data/                           │  ← Event log
//! │         (controls, observation timelines)           │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                  algorithms/                        │  ← Primitives
//! │          (unscented transform, particles)           │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    utils/                           │  ← Structures
//! │                (bitree, cowmap)                     │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │         (pose algebra, Gaussians, models)           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Driving the estimators
//!
//! The driver owns an `Rc<SlamData>` and registers each estimator as a
//! listener. At each discrete timestep it appends the observations made
//! at the current state, signals the step boundary (which advances every
//! estimator synchronously), then appends the control leading to the
//! next state:
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
//! use taraka_slam::{
//!     ControlModel, FastSlam, FastSlamConfig, FeatureId, Listener, ObservationModel, SlamData,
//!     SlamResult,
//! };
//!
//! let data = Rc::new(SlamData::new());
//! let slam = Rc::new(RefCell::new(FastSlam::new(FastSlamConfig::default(), 42)));
//! data.add_listener(&(slam.clone() as Rc<RefCell<dyn Listener>>));
//!
//! // landmark 5m ahead, observed from the initial pose
//! data.add_observation(
//!     FeatureId(0),
//!     ObservationModel::new(Vector2::new(5.0, 0.0), Matrix2::identity() * 1e-3),
//! );
//! data.end_timestep();
//!
//! // drive forward 1m
//! data.add_control(ControlModel::new(
//!     Vector3::new(1.0, 0.0, 0.0),
//!     Matrix3::identity() * 0.01,
//! ));
//! data.add_observation(
//!     FeatureId(0),
//!     ObservationModel::new(Vector2::new(4.0, 0.0), Matrix2::identity() * 1e-3),
//! );
//! data.end_timestep();
//! data.end_simulation();
//!
//! let feature = slam.borrow().get_feature(FeatureId(0));
//! assert!((feature.x - 5.0).abs() < 0.5);
//! ```
//!
//! Determinism: every estimator owns its own seeded RNG, so the same
//! event log and seeds reproduce results bit for bit. Everything is
//! single-threaded and synchronous.

pub mod algorithms;
pub mod core;
pub mod data;
pub mod engine;
pub mod error;
pub mod utils;

// Core types
pub use crate::core::{ControlModel, FeatureId, Gaussian, ObservationModel, Point2D, Pose2D, Timestep};

// Data structures
pub use utils::{Bitree, CowMap, Group};

// Inference primitives
pub use algorithms::{
    unscented_transform, unscented_update, ParticleFilter, UnscentedParams, UnscentedWeights,
};

// Event log
pub use data::{Listener, SlamData};

// Estimators
pub use engine::{
    FastSlam, FastSlamConfig, GraphSlam, GraphSlamConfig, McmcSlam, McmcSlamConfig, OptimizeResult,
    SlamResult, TerminationReason,
};

pub use error::{Error, Result};
