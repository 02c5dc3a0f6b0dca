//! Planner plugin implementations.

pub mod band;
pub mod costmap;
pub mod rrt;

pub use band::BandPlanner;
pub use costmap::{Costmap, DistanceField, BODY_OFFSETS};
pub use rrt::RrtPathPlanner;
