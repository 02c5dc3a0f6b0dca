//! Base and sensor data-source layers.
//!
//! Every sensor layer shares the same skeleton: messages arrive on a
//! channel, are rate-limited by an integer sub-sample divisor, the sensor
//! pose is looked up at the message stamp, rays are clipped to the grid and
//! traced with the miss delta, hits are marked at the endpoint, and the
//! robot footprint is forced to `min_log` so the robot never marks itself.

mod base;
mod depth;
mod laser;
mod range;

pub use base::BaseMapLayer;
pub use depth::DepthLayer;
pub use laser::LaserLayer;
pub use range::RangeLayer;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use nalgebra::Point2;
use parking_lot::Mutex;
use thiserror::Error;

use crate::cells::{logodds, LogOddsGrid};
use crate::core::CellBounds;
use crate::map_data::MapData;
use crate::params::{config_with_default_warn, ConfigError};
use crate::transform::TransformError;

/// Footprint scale applied when clearing the robot's own cells.
pub const FOOTPRINT_SCALE: f64 = 1.0;

/// Non-fatal failure while applying sensor data.
///
/// A failing layer logs a warning and drops the message; it never corrupts
/// the grid.
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("transform unavailable: {0}")]
    Transform(#[from] TransformError),

    #[error("sensor origin is not on the grid")]
    SensorOffGrid,

    #[error("no map data available")]
    NoMapData,

    #[error("bad payload: {0}")]
    BadPayload(String),
}

impl LayerError {
    /// Stable error-kind string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            LayerError::Transform(_) => "transform_unavailable",
            LayerError::SensorOffGrid => "grid_out_of_bounds",
            LayerError::NoMapData => "no_map_data",
            LayerError::BadPayload(_) => "bad_payload",
        }
    }
}

/// A sensor data-source layer.
pub trait Layer: Send {
    fn name(&self) -> &str;

    /// Read plugin parameters. Errors are fatal.
    fn on_initialize(&mut self, params: &toml::Value) -> Result<(), ConfigError>;

    /// The layered map re-initialised its geometry.
    fn on_map_changed(&mut self, map: Arc<MapData>);

    /// Re-apply the latest accepted message into `grid`, restricted to
    /// `bounds`. The caller holds the grid mutex.
    fn apply(&mut self, grid: &mut LogOddsGrid, bounds: &CellBounds) -> Result<(), LayerError>;
}

/// A layer shared between its handler thread and the layered map.
pub type SharedLayer = Arc<Mutex<dyn Layer>>;

/// Spawn a named handler thread draining a message channel.
///
/// The thread lives until every sender is dropped.
pub fn spawn_handler<M: Send + 'static>(
    name: &str,
    rx: Receiver<M>,
    mut handle: impl FnMut(M) + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while let Ok(msg) = rx.recv() {
                handle(msg);
            }
        })
        .expect("failed to spawn layer handler thread")
}

/// Default robot footprint outline in the body frame.
pub fn default_footprint() -> Vec<Point2<f64>> {
    vec![
        Point2::new(0.268, 0.000),
        Point2::new(0.265, 0.185),
        Point2::new(-0.265, 0.185),
        Point2::new(-0.268, 0.000),
        Point2::new(-0.265, -0.185),
        Point2::new(0.265, -0.185),
    ]
}

/// Parameters common to every obstacle data source.
#[derive(Clone, Copy, Debug)]
pub struct ObstacleParams {
    /// Log-odds applied at a measured endpoint (positive).
    pub hit_log: f32,
    /// Log-odds applied along a traversed ray (negative).
    pub miss_log: f32,
    pub min_obstacle_height: f64,
    pub max_obstacle_height: f64,
    pub obstacle_range: f64,
    pub raytrace_range: f64,
    pub sub_sample: u32,
}

/// Per-layer-kind defaults for [`ObstacleParams`].
#[derive(Clone, Copy, Debug)]
pub struct ObstacleDefaults {
    pub hit_probability: f64,
    pub miss_probability: f64,
    pub min_obstacle_height: f64,
    pub max_obstacle_height: f64,
    pub obstacle_range: f64,
    pub raytrace_range: f64,
    pub sub_sample: u32,
}

impl ObstacleParams {
    pub fn from_toml(params: &toml::Value, defaults: &ObstacleDefaults) -> Result<Self, ConfigError> {
        let hit_probability =
            config_with_default_warn(params, "hit_probability", defaults.hit_probability)?;
        let miss_probability =
            config_with_default_warn(params, "miss_probability", defaults.miss_probability)?;
        if !(0.0..1.0).contains(&hit_probability) || !(0.0..1.0).contains(&miss_probability) {
            return Err(ConfigError::Invalid(
                "hit_probability and miss_probability must lie in (0, 1)".to_string(),
            ));
        }
        Ok(Self {
            hit_log: logodds(hit_probability),
            miss_log: logodds(miss_probability),
            min_obstacle_height: config_with_default_warn(
                params,
                "min_obstacle_height",
                defaults.min_obstacle_height,
            )?,
            max_obstacle_height: config_with_default_warn(
                params,
                "max_obstacle_height",
                defaults.max_obstacle_height,
            )?,
            obstacle_range: config_with_default_warn(
                params,
                "obstacle_range",
                defaults.obstacle_range,
            )?,
            raytrace_range: config_with_default_warn(
                params,
                "raytrace_range",
                defaults.raytrace_range,
            )?,
            sub_sample: config_with_default_warn(params, "sub_sample", defaults.sub_sample)?,
        })
    }

    pub fn from_defaults(defaults: &ObstacleDefaults) -> Self {
        Self {
            hit_log: logodds(defaults.hit_probability),
            miss_log: logodds(defaults.miss_probability),
            min_obstacle_height: defaults.min_obstacle_height,
            max_obstacle_height: defaults.max_obstacle_height,
            obstacle_range: defaults.obstacle_range,
            raytrace_range: defaults.raytrace_range,
            sub_sample: defaults.sub_sample,
        }
    }

    /// Sub-sample gate: accept one message out of every `sub_sample + 1`.
    pub fn accept(&self, count: &mut u32) -> bool {
        if self.sub_sample == 0 || *count >= self.sub_sample {
            *count = 0;
            true
        } else {
            *count += 1;
            false
        }
    }

    /// Ray-trace cap in cells for the given resolution.
    #[inline]
    pub fn raytrace_cells(&self, resolution: f64) -> usize {
        (self.raytrace_range / resolution) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::empty_params;

    const DEFAULTS: ObstacleDefaults = ObstacleDefaults {
        hit_probability: 0.8,
        miss_probability: 0.4,
        min_obstacle_height: 0.0,
        max_obstacle_height: 2.0,
        obstacle_range: 3.5,
        raytrace_range: 4.0,
        sub_sample: 0,
    };

    #[test]
    fn test_params_signs() {
        let params = ObstacleParams::from_toml(&empty_params(), &DEFAULTS).unwrap();
        assert!(params.hit_log > 0.0);
        assert!(params.miss_log < 0.0);
    }

    #[test]
    fn test_params_invalid_probability() {
        let table: toml::Value = toml::from_str("hit_probability = 1.5").unwrap();
        assert!(ObstacleParams::from_toml(&table, &DEFAULTS).is_err());
    }

    #[test]
    fn test_sub_sample_gate() {
        let mut defaults = DEFAULTS;
        defaults.sub_sample = 2;
        let params = ObstacleParams::from_defaults(&defaults);
        let mut count = defaults.sub_sample; // first message accepted
        let accepted: Vec<bool> = (0..6).map(|_| params.accept(&mut count)).collect();
        assert_eq!(accepted, vec![true, false, false, true, false, false]);
    }

    #[test]
    fn test_sub_sample_zero_accepts_all() {
        let params = ObstacleParams::from_defaults(&DEFAULTS);
        let mut count = 0;
        assert!(params.accept(&mut count));
        assert!(params.accept(&mut count));
    }
}
