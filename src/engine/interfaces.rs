//! The uniform estimator surface.
//!
//! Every estimator exposes its posterior through [`SlamResult`]:
//! a trajectory as a Fenwick tree of pose increments and a feature map
//! of world-frame landmark positions. Consumers (plotter, evaluator,
//! other estimators using one as an initializer) dispatch through
//! `Rc<RefCell<dyn SlamResult>>`.

use std::collections::BTreeMap;

use crate::core::pose::{Point2D, Pose2D};
use crate::core::types::{FeatureId, Timestep};
use crate::utils::bitree::Bitree;

pub use crate::data::Listener;

/// Trajectory and feature-map queries shared by all estimators.
///
/// The container getters take `&mut self` because the trajectory and
/// feature map are materialized lazily from estimator-internal state;
/// repeated calls return structurally equal content.
pub trait SlamResult {
    /// The latest timestep this estimator has processed.
    fn current_timestep(&self) -> Timestep;

    /// The pose estimate at `t`, for `0 <= t <= current_timestep()`.
    fn get_state(&self, t: Timestep) -> Pose2D;

    /// The world-frame estimate of feature `id`. The feature must have
    /// been observed.
    fn get_feature(&self, id: FeatureId) -> Point2D;

    /// The trajectory as pose increments; `accumulate_prefix(t)` is the
    /// pose at `t` relative to the initial state. Length equals
    /// `current_timestep()`.
    fn get_trajectory(&mut self) -> &Bitree<Pose2D>;

    /// World-frame positions of all observed features.
    fn get_feature_map(&mut self) -> &BTreeMap<FeatureId, Point2D>;

    /// The pose the trajectory is relative to.
    fn get_initial_state(&self) -> Pose2D {
        Pose2D::identity()
    }
}
