//! BhumiMap - layered occupancy grid for ground-robot navigation.
//!
//! Maintains a shared two-dimensional log-odds occupancy grid composed of a
//! static base layer plus any number of sensor data-source layers. Sensor
//! layers ray-trace measurements into the grid concurrently under a coarse
//! grid mutex; the navigation stack reads snapshots under the same mutex.
//!
//! ## Architecture
//!
//! - [`MapDimensions`] / [`LogOddsGrid`]: grid geometry and the dense
//!   per-cell log-odds store with clamped Bayesian updates
//! - [`layers`]: the base map layer and the laser / depth / range sensor
//!   layers, each running on its own handler thread
//! - [`LayeredMap`]: composes the base layer with the sensor layers and
//!   provides the radius-clear primitive used during navigation
//! - [`transform`]: time-indexed frame-tree buffer standing in for the
//!   external transform system

pub mod cells;
pub mod core;
pub mod dimensions;
pub mod footprint;
pub mod hd_map;
pub mod layered_map;
pub mod layers;
pub mod map_data;
pub mod msgs;
pub mod params;
pub mod raycast;
pub mod transform;

pub use cells::{logodds, probability, ClampParams, LogOddsGrid, UNKNOWN};
pub use crate::core::{CellBounds, GridCoord};
pub use dimensions::MapDimensions;
pub use hd_map::{HdMap, OccupancyImage};
pub use layered_map::LayeredMap;
pub use layers::{Layer, LayerError, SharedLayer};
pub use map_data::MapData;
pub use params::ConfigError;
pub use transform::{stamp_now, Stamp, TransformBuffer, TransformError};
