//! The three posterior estimators and their shared result surface.

pub mod fastslam;
pub mod graph_slam;
pub mod interfaces;
pub mod mcmc_slam;

pub use fastslam::{FastSlam, FastSlamConfig};
pub use graph_slam::{GraphSlam, GraphSlamConfig, OptimizeResult, TerminationReason};
pub use interfaces::SlamResult;
pub use mcmc_slam::{McmcSlam, McmcSlamConfig};
