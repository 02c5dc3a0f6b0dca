//! Composition of the base layer and the sensor layers.

use std::sync::Arc;

use log::warn;
use nalgebra::Point2;
use parking_lot::Mutex;

use crate::cells::ClampParams;
use crate::core::CellBounds;
use crate::hd_map::{HdMap, OccupancyImage};
use crate::layers::{BaseMapLayer, SharedLayer};
use crate::map_data::MapData;
use crate::msgs::OccupancyGridMsg;
use crate::params::ConfigError;
use crate::transform::Stamp;

/// The layered occupancy map.
///
/// Owns the cell store (through [`MapData`]) and composes the static base
/// layer with the sensor layers in their declared order. `update` is the
/// only path by which cell values decrease toward `min_log` due to sensor
/// evidence; `clear_radius` is the only path that overrides evidence.
pub struct LayeredMap {
    base: Mutex<BaseMapLayer>,
    layers: Vec<SharedLayer>,
    clamp: ClampParams,
    map_data: Mutex<Option<Arc<MapData>>>,
}

impl LayeredMap {
    /// Create a layered map with no active map data yet.
    pub fn new(layers: Vec<SharedLayer>, clamp: ClampParams) -> Self {
        Self {
            base: Mutex::new(BaseMapLayer::new()),
            layers,
            clamp,
            map_data: Mutex::new(None),
        }
    }

    /// The active map data, if a map has been set.
    pub fn map_data(&self) -> Option<Arc<MapData>> {
        self.map_data.lock().clone()
    }

    /// Re-initialise geometry from a new HD map, re-draw the base layer and
    /// forward the change to every sensor layer.
    pub fn set_map(&self, hd_map: HdMap, occupancy: OccupancyImage) -> Result<(), ConfigError> {
        let map_data = {
            let mut base = self.base.lock();
            base.set_map(&hd_map, &occupancy)?;
            let dims = *base
                .dimensions()
                .expect("base layer has dimensions after set_map");
            Arc::new(MapData::new(hd_map, dims, self.clamp))
        };

        *self.map_data.lock() = Some(map_data.clone());
        for layer in &self.layers {
            layer.lock().on_map_changed(map_data.clone());
        }
        self.update();
        Ok(())
    }

    /// Copy the base into the working cells, then apply each sensor layer
    /// in declared order.
    pub fn update(&self) {
        if let Some(map_data) = self.map_data() {
            self.update_bounds(map_data.dimensions().bounds());
        }
    }

    /// Same as [`LayeredMap::update`], restricted to `bounds`.
    pub fn update_bounds(&self, bounds: CellBounds) {
        let Some(map_data) = self.map_data() else {
            return;
        };
        let bounds = bounds.intersection(&map_data.dimensions().bounds());
        {
            let base = self.base.lock();
            let mut grid = map_data.lock();
            base.draw_bounds(&mut grid, &bounds);
        }
        for layer in &self.layers {
            // Layer lock before the grid lock, matching the handler threads.
            let mut layer = layer.lock();
            let mut grid = map_data.lock();
            if let Err(e) = layer.apply(&mut grid, &bounds) {
                warn!("[{}] update failed ({}): {}", layer.name(), e.kind(), e);
            }
        }
    }

    /// Force every cell within `radius` metres of `point` to `min_log`.
    ///
    /// Used when the supervisor frees the robot's immediate surroundings at
    /// the start of a goal.
    pub fn clear_radius(&self, point: Point2<f64>, radius: f64) {
        let Some(map_data) = self.map_data() else {
            return;
        };
        let dims = *map_data.dimensions();
        let centre = dims.world_to_grid(point);
        let cell_radius = (radius / dims.resolution()) as i32;

        let mut grid = map_data.lock();
        for dy in -cell_radius..=cell_radius {
            for dx in -cell_radius..=cell_radius {
                if dx * dx + dy * dy <= cell_radius * cell_radius {
                    grid.set_min(crate::core::GridCoord::new(centre.x + dx, centre.y + dy));
                }
            }
        }
    }

    /// Diagnostic occupancy snapshot of `bounds` (or the whole grid).
    pub fn snapshot(&self, bounds: Option<CellBounds>, stamp: Stamp) -> Option<OccupancyGridMsg> {
        let map_data = self.map_data()?;
        let bounds = bounds.unwrap_or_else(|| map_data.dimensions().bounds());
        let grid = map_data.lock();
        Some(OccupancyGridMsg::from_grid(&grid, bounds, stamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::UNKNOWN;
    use crate::core::GridCoord;
    use crate::layers::{default_footprint, LaserLayer};
    use crate::msgs::LaserScan;
    use crate::transform::TransformBuffer;
    use nalgebra::Isometry3;
    use std::time::Duration;

    fn create_test_hd_map(width: u32, height: u32) -> (HdMap, OccupancyImage) {
        let hd_map = HdMap {
            name: "test".to_string(),
            description: String::new(),
            resolution: 0.05,
            width,
            height,
            origin_x: -(width as f64) * 0.05 / 2.0,
            origin_y: -(height as f64) * 0.05 / 2.0,
            ..Default::default()
        };
        (hd_map, OccupancyImage::free(width, height))
    }

    #[test]
    fn test_set_map_draws_base() {
        let map = LayeredMap::new(Vec::new(), ClampParams::default());
        let (hd_map, mut occupancy) = create_test_hd_map(40, 40);
        occupancy.set(10, 10, 100);
        map.set_map(hd_map, occupancy).unwrap();

        let map_data = map.map_data().unwrap();
        let grid = map_data.lock();
        assert_eq!(grid.get(GridCoord::new(10, 10)), Some(grid.max_log()));
        assert_eq!(grid.get(GridCoord::new(0, 0)), Some(grid.min_log()));
    }

    #[test]
    fn test_clear_radius_forces_min() {
        let map = LayeredMap::new(Vec::new(), ClampParams::default());
        let (hd_map, mut occupancy) = create_test_hd_map(40, 40);
        // Ring of obstacles around the robot at the origin.
        for i in 0..40 {
            occupancy.set(i, 17, 100);
            occupancy.set(i, 23, 100);
            occupancy.set(17, i, 100);
            occupancy.set(23, i, 100);
        }
        map.set_map(hd_map, occupancy).unwrap();

        map.clear_radius(Point2::new(0.0, 0.0), 0.5);

        let map_data = map.map_data().unwrap();
        let dims = *map_data.dimensions();
        let grid = map_data.lock();
        let centre = dims.world_to_grid(Point2::new(0.0, 0.0));
        let cell_radius = (0.5 / dims.resolution()) as i32;
        for dy in -cell_radius..=cell_radius {
            for dx in -cell_radius..=cell_radius {
                if dx * dx + dy * dy <= cell_radius * cell_radius {
                    let c = GridCoord::new(centre.x + dx, centre.y + dy);
                    assert_eq!(grid.get(c), Some(grid.min_log()), "cell {:?}", c);
                }
            }
        }
    }

    #[test]
    fn test_update_bounds_confined() {
        let stamp = Duration::from_secs(1);
        let tf = Arc::new(TransformBuffer::new());
        tf.set_transform("map", "base_link", stamp, Isometry3::identity());
        tf.set_transform(
            "base_link",
            "laser",
            Duration::from_secs(0),
            Isometry3::identity(),
        );
        let laser = Arc::new(Mutex::new(LaserLayer::new(
            "laser",
            tf,
            "map",
            default_footprint(),
        )));
        let map = LayeredMap::new(vec![laser.clone()], ClampParams::default());

        // An unknown base keeps sensor marks observable after re-draws.
        let (hd_map, _) = create_test_hd_map(40, 40);
        map.set_map(hd_map, OccupancyImage::unknown(40, 40)).unwrap();

        laser
            .lock()
            .handle(LaserScan {
                frame_id: "laser".to_string(),
                stamp,
                angle_min: 0.0,
                angle_increment: 0.1,
                range_min: 0.05,
                range_max: 8.0,
                ranges: vec![0.8],
            })
            .unwrap();

        // Restrict an update to a corner box that the beam never touches;
        // cells outside the box must keep their values.
        let map_data = map.map_data().unwrap();
        let dims = *map_data.dimensions();
        let before = map_data.lock().cells().to_vec();
        let corner = CellBounds::new(GridCoord::new(0, 0), GridCoord::new(5, 5));
        map.update_bounds(corner);
        let after = map_data.lock().cells().to_vec();

        for y in 0..dims.size().y {
            for x in 0..dims.size().x {
                let idx = (y * dims.size().x + x) as usize;
                if !corner.contains(GridCoord::new(x, y)) {
                    assert_eq!(before[idx], after[idx], "cell ({}, {})", x, y);
                }
            }
        }
        // Inside the box the base re-draw restored unknown.
        assert_eq!(after[0], UNKNOWN);
    }
}
