//! Inference primitives shared by the estimators: the scaled unscented
//! transform and the generic weighted particle population.

pub mod particle;
pub mod unscented;

pub use particle::ParticleFilter;
pub use unscented::{unscented_transform, unscented_update, UnscentedParams, UnscentedWeights};
