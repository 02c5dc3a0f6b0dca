//! Static base map layer.

use nalgebra::Point2;

use crate::cells::{LogOddsGrid, UNKNOWN};
use crate::core::{CellBounds, GridCoord};
use crate::dimensions::MapDimensions;
use crate::hd_map::{HdMap, OccupancyImage};
use crate::params::ConfigError;

/// Occupancy-image values at or above this are occupied.
const OCCUPIED_THRESHOLD: i8 = 50;

/// Tri-state rasterisation of the static map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BaseCell {
    Unknown,
    Free,
    Occupied,
}

/// Rasterises the HD map's static occupancy image into log-odds.
///
/// A pure function of its inputs: no sensor state. The rasterisation is
/// cached at `set_map` time and stamped into the working cells by `draw`.
#[derive(Debug, Default)]
pub struct BaseMapLayer {
    dimensions: Option<MapDimensions>,
    raster: Vec<BaseCell>,
}

impl BaseMapLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grid geometry derived from the HD map, if a map has been set.
    pub fn dimensions(&self) -> Option<&MapDimensions> {
        self.dimensions.as_ref()
    }

    /// Rasterise a new static map.
    pub fn set_map(&mut self, hd_map: &HdMap, occupancy: &OccupancyImage) -> Result<(), ConfigError> {
        if occupancy.width != hd_map.width || occupancy.height != hd_map.height {
            return Err(ConfigError::Invalid(format!(
                "occupancy image is {}x{} but map {} is {}x{}",
                occupancy.width, occupancy.height, hd_map.name, hd_map.width, hd_map.height
            )));
        }
        if hd_map.resolution <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "map {} has non-positive resolution",
                hd_map.name
            )));
        }

        self.dimensions = Some(MapDimensions::new(
            Point2::new(hd_map.origin_x, hd_map.origin_y),
            hd_map.resolution,
            GridCoord::new(hd_map.width as i32, hd_map.height as i32),
        ));
        self.raster = occupancy
            .data
            .iter()
            .map(|&v| {
                if v < 0 {
                    BaseCell::Unknown
                } else if v >= OCCUPIED_THRESHOLD {
                    BaseCell::Occupied
                } else {
                    BaseCell::Free
                }
            })
            .collect();
        Ok(())
    }

    /// Stamp the whole rasterisation into the working cells.
    pub fn draw(&self, grid: &mut LogOddsGrid) {
        if let Some(dims) = &self.dimensions {
            self.draw_bounds(grid, &dims.bounds());
        }
    }

    /// Stamp the rasterisation within `bounds` only.
    pub fn draw_bounds(&self, grid: &mut LogOddsGrid, bounds: &CellBounds) {
        let Some(dims) = &self.dimensions else {
            return;
        };
        let bounds = bounds.intersection(&dims.bounds());
        let width = dims.size().x as usize;
        let (min_log, max_log) = (grid.min_log(), grid.max_log());
        for y in bounds.min.y..bounds.max.y {
            for x in bounds.min.x..bounds.max.x {
                let value = match self.raster[y as usize * width + x as usize] {
                    BaseCell::Unknown => UNKNOWN,
                    BaseCell::Free => min_log,
                    BaseCell::Occupied => max_log,
                };
                grid.set(GridCoord::new(x, y), value);
            }
        }
    }
}
