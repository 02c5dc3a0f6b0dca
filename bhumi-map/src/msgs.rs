//! Message types standing in for the external transport layer.

use nalgebra::{Isometry2, Vector3};

use crate::cells::{probability, LogOddsGrid, UNKNOWN};
use crate::core::CellBounds;
use crate::transform::Stamp;

/// Planar laser scan.
#[derive(Clone, Debug)]
pub struct LaserScan {
    pub frame_id: String,
    pub stamp: Stamp,
    pub angle_min: f64,
    pub angle_increment: f64,
    pub range_min: f64,
    pub range_max: f64,
    pub ranges: Vec<f64>,
}

/// Pinhole camera intrinsics.
#[derive(Clone, Copy, Debug)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// PNG-compressed 16-bit depth image.
///
/// Raw pixel values divide by `depth_scale` to give metres; zero pixels are
/// invalid.
#[derive(Clone, Debug)]
pub struct CompressedDepthImage {
    pub frame_id: String,
    pub stamp: Stamp,
    pub intrinsics: CameraIntrinsics,
    pub depth_scale: f64,
    pub png_data: Vec<u8>,
}

/// Single reading from a fixed-cone range sensor.
#[derive(Clone, Debug)]
pub struct RangeReading {
    pub frame_id: String,
    pub stamp: Stamp,
    pub field_of_view: f64,
    pub min_range: f64,
    pub max_range: f64,
    pub range: f64,
}

/// Kinodynamic state in the odom frame.
#[derive(Clone, Debug)]
pub struct Odometry {
    pub stamp: Stamp,
    pub pose: Isometry2<f64>,
    /// Linear x, linear y, angular z.
    pub velocity: Vector3<f64>,
}

/// Planar velocity command.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Twist {
    pub linear_x: f64,
    pub linear_y: f64,
    pub angular_z: f64,
}

impl Twist {
    pub const ZERO: Twist = Twist {
        linear_x: 0.0,
        linear_y: 0.0,
        angular_z: 0.0,
    };

    pub fn is_zero(&self) -> bool {
        self.linear_x == 0.0 && self.linear_y == 0.0 && self.angular_z == 0.0
    }
}

/// Diagnostic occupancy snapshot.
///
/// `data` follows the ROS convention (-1 unknown, 0..=100 occupied percent)
/// and covers `bounds` of the source grid in row-major order.
#[derive(Clone, Debug)]
pub struct OccupancyGridMsg {
    pub stamp: Stamp,
    pub resolution: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub bounds: CellBounds,
    pub data: Vec<i8>,
}

impl OccupancyGridMsg {
    /// Snapshot `bounds` of a locked grid.
    pub fn from_grid(grid: &LogOddsGrid, bounds: CellBounds, stamp: Stamp) -> Self {
        let dims = grid.dimensions();
        let bounds = bounds.intersection(&dims.bounds());
        let mut data = Vec::with_capacity((bounds.width() * bounds.height()).max(0) as usize);
        for y in bounds.min.y..bounds.max.y {
            for x in bounds.min.x..bounds.max.x {
                let value = grid.get(crate::core::GridCoord::new(x, y)).unwrap_or(UNKNOWN);
                data.push(if value == UNKNOWN {
                    -1
                } else {
                    (probability(value) * 100.0).round() as i8
                });
            }
        }
        let origin = dims.grid_to_world(bounds.min);
        Self {
            stamp,
            resolution: dims.resolution(),
            origin_x: origin.x - 0.5 * dims.resolution(),
            origin_y: origin.y - 0.5 * dims.resolution(),
            bounds,
            data,
        }
    }
}
