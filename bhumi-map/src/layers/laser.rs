//! Planar laser data-source layer.

use std::sync::Arc;

use nalgebra::{Point2, Point3, Vector3};

use crate::cells::LogOddsGrid;
use crate::core::CellBounds;
use crate::footprint::footprint_cells;
use crate::map_data::MapData;
use crate::msgs::LaserScan;
use crate::params::ConfigError;
use crate::raycast::{clip_ray_end, raytrace};
use crate::transform::TransformBuffer;

use super::{Layer, LayerError, ObstacleDefaults, ObstacleParams, FOOTPRINT_SCALE};

const DEFAULTS: ObstacleDefaults = ObstacleDefaults {
    hit_probability: 0.8,
    miss_probability: 0.4,
    min_obstacle_height: 0.0,
    max_obstacle_height: 2.0,
    obstacle_range: 3.5,
    raytrace_range: 4.0,
    sub_sample: 0,
};

/// Marks laser beams into the shared grid.
pub struct LaserLayer {
    name: String,
    params: ObstacleParams,
    tf: Arc<TransformBuffer>,
    global_frame: String,
    robot_frame: String,
    footprint: Vec<Point2<f64>>,
    map_data: Option<Arc<MapData>>,
    /// Per-beam unit directions, re-allocated only when the beam count
    /// changes.
    directions: Vec<Vector3<f64>>,
    directions_angle_min: f64,
    latest: Option<LaserScan>,
    sub_sample_count: u32,
}

impl LaserLayer {
    pub fn new(
        name: impl Into<String>,
        tf: Arc<TransformBuffer>,
        global_frame: impl Into<String>,
        footprint: Vec<Point2<f64>>,
    ) -> Self {
        Self {
            name: name.into(),
            params: ObstacleParams::from_defaults(&DEFAULTS),
            tf,
            global_frame: global_frame.into(),
            robot_frame: "base_link".to_string(),
            footprint,
            map_data: None,
            directions: Vec::new(),
            directions_angle_min: f64::NAN,
            latest: None,
            sub_sample_count: 0,
        }
    }

    /// Handle one scan from the transport: rate-limit, store as the latest
    /// message and mark it into the grid under the grid mutex.
    pub fn handle(&mut self, scan: LaserScan) -> Result<(), LayerError> {
        if !self.params.accept(&mut self.sub_sample_count) {
            return Ok(());
        }
        let map = self.map_data.clone().ok_or(LayerError::NoMapData)?;
        self.latest = Some(scan);
        let bounds = map.dimensions().bounds();
        let mut grid = map.lock();
        self.mark(&mut grid, &bounds)
    }

    fn mark(&mut self, grid: &mut LogOddsGrid, bounds: &CellBounds) -> Result<(), LayerError> {
        let Some(scan) = self.latest.clone() else {
            return Ok(());
        };
        let dims = *grid.dimensions();

        let sensor_tf = self.tf.lookup(&self.global_frame, &scan.frame_id, scan.stamp)?;
        let sensor_cell = dims.world_to_grid(Point2::new(
            sensor_tf.translation.x,
            sensor_tf.translation.y,
        ));
        if !dims.contains(sensor_cell) {
            return Err(LayerError::SensorOffGrid);
        }

        if self.directions.len() != scan.ranges.len()
            || self.directions_angle_min != scan.angle_min
        {
            self.directions_angle_min = scan.angle_min;
            let mut angle = scan.angle_min;
            self.directions = (0..scan.ranges.len())
                .map(|_| {
                    let dir = Vector3::new(angle.cos(), angle.sin(), 0.0);
                    angle += scan.angle_increment;
                    dir
                })
                .collect();
        }

        let robot_tf = self
            .tf
            .lookup(&self.global_frame, &self.robot_frame, scan.stamp)?;
        let robot_pose = crate::transform::iso3_to_iso2(&robot_tf);

        let cell_raytrace_range = self.params.raytrace_cells(dims.resolution());

        for (i, &raw_range) in scan.ranges.iter().enumerate() {
            let mut range = raw_range;
            if range.is_infinite() && range > 0.0 {
                range = scan.range_max;
            }
            if !range.is_finite() || range <= 0.0 {
                continue;
            }

            let endpoint = sensor_tf * Point3::from(self.directions[i] * range);
            if endpoint.z < self.params.min_obstacle_height
                || endpoint.z > self.params.max_obstacle_height
            {
                continue;
            }

            let end_cell = dims.world_to_grid(Point2::new(endpoint.x, endpoint.y));
            let ray_end = clip_ray_end(sensor_cell, end_cell, dims.size());
            raytrace(
                grid,
                sensor_cell,
                ray_end,
                self.params.miss_log,
                cell_raytrace_range,
                bounds,
            );
            if range < scan.range_max && range < self.params.obstacle_range {
                // A hit overrides the miss applied at the same cell.
                grid.update_in(ray_end, -self.params.miss_log, bounds);
                grid.update_in(ray_end, self.params.hit_log, bounds);
            }
        }

        for cell in footprint_cells(&dims, &robot_pose, &self.footprint, FOOTPRINT_SCALE) {
            if bounds.contains(cell) {
                grid.set_min(cell);
            }
        }
        Ok(())
    }
}

impl Layer for LaserLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_initialize(&mut self, params: &toml::Value) -> Result<(), ConfigError> {
        self.params = ObstacleParams::from_toml(params, &DEFAULTS)?;
        self.sub_sample_count = self.params.sub_sample;
        Ok(())
    }

    fn on_map_changed(&mut self, map: Arc<MapData>) {
        self.map_data = Some(map);
        self.latest = None;
    }

    fn apply(&mut self, grid: &mut LogOddsGrid, bounds: &CellBounds) -> Result<(), LayerError> {
        if self.map_data.is_none() {
            return Err(LayerError::NoMapData);
        }
        self.mark(grid, bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::{ClampParams, UNKNOWN};
    use crate::core::GridCoord;
    use crate::dimensions::MapDimensions;
    use crate::hd_map::HdMap;
    use crate::layers::default_footprint;
    use crate::transform::iso2_to_iso3;
    use nalgebra::{Isometry2, Isometry3, Vector2};
    use std::time::Duration;

    fn create_test_map() -> Arc<MapData> {
        let dims = MapDimensions::new(Point2::new(-2.5, -2.5), 0.05, GridCoord::new(100, 100));
        Arc::new(MapData::new(HdMap::default(), dims, ClampParams::default()))
    }

    fn create_test_tf(robot: Isometry2<f64>, stamp: Duration) -> Arc<TransformBuffer> {
        let tf = Arc::new(TransformBuffer::new());
        tf.set_transform("map", "base_link", stamp, iso2_to_iso3(&robot));
        tf.set_transform(
            "base_link",
            "laser",
            Duration::from_secs(0),
            Isometry3::identity(),
        );
        tf
    }

    fn create_test_scan(stamp: Duration, range: f64) -> LaserScan {
        LaserScan {
            frame_id: "laser".to_string(),
            stamp,
            angle_min: 0.0,
            angle_increment: 0.1,
            range_min: 0.05,
            range_max: 8.0,
            ranges: vec![range],
        }
    }

    #[test]
    fn test_beam_marks_hit_and_misses() {
        let map = create_test_map();
        let stamp = Duration::from_secs(1);
        let tf = create_test_tf(Isometry2::identity(), stamp);
        let mut layer = LaserLayer::new("laser", tf, "map", default_footprint());
        layer.on_map_changed(map.clone());

        layer.handle(create_test_scan(stamp, 1.0)).unwrap();

        let grid = map.lock();
        let dims = map.dimensions();
        // Hit at 1m ahead.
        let hit_cell = dims.world_to_grid(Point2::new(1.0, 0.0));
        assert!(grid.get(hit_cell).unwrap() > 0.0);
        // Misses along the ray (outside the footprint).
        let miss_cell = dims.world_to_grid(Point2::new(0.6, 0.0));
        assert!(grid.get(miss_cell).unwrap() < 0.0);
        // Footprint cleared to min.
        let robot_cell = dims.world_to_grid(Point2::new(0.0, 0.0));
        assert_eq!(grid.get(robot_cell), Some(grid.min_log()));
    }

    #[test]
    fn test_beyond_obstacle_range_no_hit() {
        let map = create_test_map();
        let stamp = Duration::from_secs(1);
        let tf = create_test_tf(Isometry2::identity(), stamp);
        let mut layer = LaserLayer::new("laser", tf, "map", default_footprint());
        layer.on_map_changed(map.clone());

        // 4m > obstacle_range of 3.5m; the ray still clears but marks no hit.
        layer.handle(create_test_scan(stamp, 4.0)).unwrap();

        let grid = map.lock();
        let dims = map.dimensions();
        // raytrace_range of 4m caps at 80 cells from the sensor.
        let cleared = dims.world_to_grid(Point2::new(1.5, 0.0));
        assert!(grid.get(cleared).unwrap() < 0.0);
        let hit_cell = dims.world_to_grid(Point2::new(2.0, 0.0));
        assert!(grid.get(hit_cell).unwrap() <= 0.0);
    }

    #[test]
    fn test_sensor_off_grid_dropped() {
        let map = create_test_map();
        let stamp = Duration::from_secs(1);
        let tf = create_test_tf(
            Isometry2::new(Vector2::new(100.0, 0.0), 0.0),
            stamp,
        );
        let mut layer = LaserLayer::new("laser", tf, "map", default_footprint());
        layer.on_map_changed(map.clone());

        let err = layer.handle(create_test_scan(stamp, 1.0)).unwrap_err();
        assert_eq!(err.kind(), "grid_out_of_bounds");

        // No side effects.
        let grid = map.lock();
        assert!(grid.cells().iter().all(|&c| c == UNKNOWN));
    }

    #[test]
    fn test_missing_transform_dropped() {
        let map = create_test_map();
        let tf = Arc::new(TransformBuffer::new());
        let mut layer = LaserLayer::new("laser", tf, "map", default_footprint());
        layer.on_map_changed(map.clone());

        let err = layer
            .handle(create_test_scan(Duration::from_secs(1), 1.0))
            .unwrap_err();
        assert_eq!(err.kind(), "transform_unavailable");
    }

    #[test]
    fn test_repeated_messages_saturate_to_fixed_point() {
        let map = create_test_map();
        let stamp = Duration::from_secs(1);
        let tf = create_test_tf(Isometry2::identity(), stamp);
        let mut layer = LaserLayer::new("laser", tf, "map", default_footprint());
        layer.on_map_changed(map.clone());

        // Enough repetitions to saturate both the hit and the misses.
        for _ in 0..12 {
            layer.handle(create_test_scan(stamp, 1.0)).unwrap();
        }
        let saturated = map.lock().cells().to_vec();

        layer.handle(create_test_scan(stamp, 1.0)).unwrap();
        let again = map.lock().cells().to_vec();
        assert_eq!(saturated, again);
    }

    #[test]
    fn test_height_filter_skips_beam() {
        let map = create_test_map();
        let stamp = Duration::from_secs(1);
        let tf = Arc::new(TransformBuffer::new());
        tf.set_transform("map", "base_link", stamp, Isometry3::identity());
        // Laser pitched down so the endpoint falls below the floor.
        tf.set_transform(
            "base_link",
            "laser",
            Duration::from_secs(0),
            Isometry3::new(Vector3::new(0.0, 0.0, 0.2), Vector3::y() * 1.2),
        );
        let mut layer = LaserLayer::new("laser", tf, "map", default_footprint());
        layer.on_map_changed(map.clone());

        layer.handle(create_test_scan(stamp, 1.0)).unwrap();

        // The only beam failed the height filter; nothing was traced beyond
        // the footprint clear.
        let grid = map.lock();
        let dims = map.dimensions();
        let ahead = dims.world_to_grid(Point2::new(0.35, 0.0));
        assert_eq!(grid.get(ahead), Some(UNKNOWN));
    }
}
