//! Identifier types shared by the event log and the estimators.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A discrete event boundary in the simulation.
///
/// Timestep `t` separates control `t` (which takes state `t` to state
/// `t + 1`) from the observations made at state `t`. Timesteps issued by
/// the event log are monotonically increasing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestep(pub usize);

impl Timestep {
    /// The underlying index, for container addressing.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Timestep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl std::ops::Add<usize> for Timestep {
    type Output = Timestep;
    #[inline]
    fn add(self, rhs: usize) -> Timestep {
        Timestep(self.0 + rhs)
    }
}

impl std::ops::Sub<usize> for Timestep {
    type Output = Timestep;
    #[inline]
    fn sub(self, rhs: usize) -> Timestep {
        Timestep(self.0 - rhs)
    }
}

impl std::ops::AddAssign<usize> for Timestep {
    #[inline]
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

/// Opaque landmark identifier, stable across the lifetime of a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FeatureId(pub usize);

impl FeatureId {
    /// The underlying index.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}
