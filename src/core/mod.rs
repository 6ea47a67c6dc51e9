//! Foundation types: identifiers, planar pose algebra, Gaussian
//! distributions and the planar-robot measurement models.

pub mod gaussian;
pub mod math;
pub mod models;
pub mod pose;
pub mod types;

pub use gaussian::Gaussian;
pub use models::{ControlModel, ObservationModel};
pub use pose::{Point2D, Pose2D};
pub use types::{FeatureId, Timestep};
