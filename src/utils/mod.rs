//! Supporting data structures: the Fenwick tree that indexes
//! trajectories and edge weights, and the persistent map that backs
//! per-particle feature posteriors.

pub mod bitree;
pub mod cowmap;

pub use bitree::{Bitree, Group};
pub use cowmap::CowMap;
