//! High-definition map descriptor and static occupancy image.

use serde::{Deserialize, Serialize};

/// Metadata of the active HD map.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HdMap {
    pub name: String,
    pub description: String,
    /// Metres per cell.
    pub resolution: f64,
    /// Size in cells.
    pub width: u32,
    pub height: u32,
    /// World position of the lower-left corner of cell (0, 0).
    pub origin_x: f64,
    pub origin_y: f64,
}

/// Static occupancy image accompanying an [`HdMap`].
///
/// Values follow the ROS occupancy-grid convention: -1 unknown, 0 free,
/// 100 fully occupied.
#[derive(Clone, Debug)]
pub struct OccupancyImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<i8>,
}

impl OccupancyImage {
    /// An all-unknown image.
    pub fn unknown(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![-1; (width * height) as usize],
        }
    }

    /// An all-free image.
    pub fn free(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width * height) as usize],
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> i8 {
        self.data[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: i8) {
        self.data[(y * self.width + x) as usize] = value;
    }
}
