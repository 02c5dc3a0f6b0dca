//! Fixed-cone range sensor data-source layer.

use std::sync::Arc;

use nalgebra::{Point2, Point3};

use crate::cells::LogOddsGrid;
use crate::core::CellBounds;
use crate::footprint::footprint_cells;
use crate::map_data::MapData;
use crate::msgs::RangeReading;
use crate::params::ConfigError;
use crate::raycast::{clip_ray_end, raytrace, BresenhamLine};
use crate::transform::TransformBuffer;

use super::{Layer, LayerError, ObstacleDefaults, ObstacleParams, FOOTPRINT_SCALE};

const DEFAULTS: ObstacleDefaults = ObstacleDefaults {
    hit_probability: 0.65,
    miss_probability: 0.10,
    min_obstacle_height: 0.0,
    max_obstacle_height: 2.0,
    obstacle_range: 2.5,
    raytrace_range: 3.0,
    sub_sample: 0,
};

/// Marks a sonar/IR style range cone into the shared grid.
///
/// The cone is approximated by the line segment between its far corners.
/// Every ray from the sensor toward a segment cell applies the miss delta;
/// the hit weight is scaled by `1 - |i/N - 0.5|` so the centre of the cone
/// carries the most evidence.
pub struct RangeLayer {
    name: String,
    params: ObstacleParams,
    tf: Arc<TransformBuffer>,
    global_frame: String,
    robot_frame: String,
    footprint: Vec<Point2<f64>>,
    map_data: Option<Arc<MapData>>,
    latest: Option<RangeReading>,
    sub_sample_count: u32,
}

impl RangeLayer {
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
            latest: None,
            sub_sample_count: DEFAULTS.sub_sample,
        }
    }

    /// Handle one reading from the transport.
    pub fn handle(&mut self, reading: RangeReading) -> Result<(), LayerError> {
        if !self.params.accept(&mut self.sub_sample_count) {
            return Ok(());
        }
        let map = self.map_data.clone().ok_or(LayerError::NoMapData)?;
        self.latest = Some(reading);
        let bounds = map.dimensions().bounds();
        let mut grid = map.lock();
        self.mark(&mut grid, &bounds)
    }

    fn mark(&mut self, grid: &mut LogOddsGrid, bounds: &CellBounds) -> Result<(), LayerError> {
        let Some(reading) = self.latest.clone() else {
            return Ok(());
        };
        if !reading.range.is_finite() || reading.range <= 0.0 {
            return Ok(());
        }
        let dims = *grid.dimensions();

        let sensor_tf = self
            .tf
            .lookup(&self.global_frame, &reading.frame_id, reading.stamp)?;
        let sensor_cell = dims.world_to_grid(Point2::new(
            sensor_tf.translation.x,
            sensor_tf.translation.y,
        ));
        if !dims.contains(sensor_cell) {
            return Err(LayerError::SensorOffGrid);
        }

        let robot_tf = self
            .tf
            .lookup(&self.global_frame, &self.robot_frame, reading.stamp)?;
        let robot_pose = crate::transform::iso3_to_iso2(&robot_tf);

        let half_fov = reading.field_of_view / 2.0;
        let left = sensor_tf
            * Point3::new(
                reading.range * half_fov.cos(),
                reading.range * half_fov.sin(),
                0.0,
            );
        let right = sensor_tf
            * Point3::new(
                reading.range * half_fov.cos(),
                -reading.range * half_fov.sin(),
                0.0,
            );
        let left_cell = dims.world_to_grid(Point2::new(left.x, left.y));
        let right_cell = dims.world_to_grid(Point2::new(right.x, right.y));

        let far_edge: Vec<_> = BresenhamLine::new(left_cell, right_cell).collect();
        let cell_raytrace_range = self.params.raytrace_cells(dims.resolution());
        let measured = reading.range < reading.max_range;

        for (i, &cell) in far_edge.iter().enumerate() {
            let ray_end = clip_ray_end(sensor_cell, cell, dims.size());
            raytrace(
                grid,
                sensor_cell,
                ray_end,
                self.params.miss_log,
                cell_raytrace_range,
                bounds,
            );
            if measured && reading.range < self.params.obstacle_range {
                let fraction = 1.0 - (i as f64 / far_edge.len() as f64 - 0.5).abs();
                grid.update_in(ray_end, -self.params.miss_log, bounds);
                grid.update_in(ray_end, (fraction * self.params.hit_log as f64) as f32, bounds);
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

impl Layer for RangeLayer {
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
    use crate::cells::ClampParams;
    use crate::core::GridCoord;
    use crate::dimensions::MapDimensions;
    use crate::hd_map::HdMap;
    use crate::layers::default_footprint;
    use nalgebra::Isometry3;
    use std::time::Duration;

    fn create_test_map() -> Arc<MapData> {
        let dims = MapDimensions::new(Point2::new(-2.5, -2.5), 0.05, GridCoord::new(100, 100));
        Arc::new(MapData::new(HdMap::default(), dims, ClampParams::default()))
    }

    fn create_test_layer(map: &Arc<MapData>, stamp: Duration) -> RangeLayer {
        let tf = Arc::new(TransformBuffer::new());
        tf.set_transform("map", "base_link", stamp, Isometry3::identity());
        tf.set_transform(
            "base_link",
            "sonar",
            Duration::from_secs(0),
            Isometry3::identity(),
        );
        let mut layer = RangeLayer::new("sonar", tf, "map", default_footprint());
        layer.on_map_changed(map.clone());
        layer
    }

    fn create_test_reading(stamp: Duration, range: f64) -> RangeReading {
        RangeReading {
            frame_id: "sonar".to_string(),
            stamp,
            field_of_view: 0.5,
            min_range: 0.02,
            max_range: 4.0,
            range,
        }
    }

    #[test]
    fn test_cone_centre_carries_most_evidence() {
        let map = create_test_map();
        let stamp = Duration::from_secs(1);
        let mut layer = create_test_layer(&map, stamp);

        layer.handle(create_test_reading(stamp, 1.0)).unwrap();

        let grid = map.lock();
        let dims = map.dimensions();
        let centre = grid
            .get(dims.world_to_grid(Point2::new(0.97, 0.0)))
            .unwrap();
        // Left corner of the cone at fov/2.
        let corner = grid
            .get(dims.world_to_grid(Point2::new(
                0.97 * (0.25f64).cos(),
                0.97 * (0.25f64).sin(),
            )))
            .unwrap();
        assert!(centre > 0.0);
        assert!(centre > corner);
    }

    #[test]
    fn test_max_range_reading_clears_only() {
        let map = create_test_map();
        let stamp = Duration::from_secs(1);
        let mut layer = create_test_layer(&map, stamp);

        layer.handle(create_test_reading(stamp, 4.0)).unwrap();

        let grid = map.lock();
        let dims = map.dimensions();
        // Everything touched by the cone is free evidence only.
        let along = grid
            .get(dims.world_to_grid(Point2::new(1.0, 0.0)))
            .unwrap();
        assert!(along < 0.0);
    }

    #[test]
    fn test_sensor_off_grid_dropped() {
        let map = create_test_map();
        let stamp = Duration::from_secs(1);
        let tf = Arc::new(TransformBuffer::new());
        tf.set_transform(
            "map",
            "base_link",
            stamp,
            Isometry3::new(nalgebra::Vector3::new(50.0, 0.0, 0.0), nalgebra::Vector3::zeros()),
        );
        tf.set_transform(
            "base_link",
            "sonar",
            Duration::from_secs(0),
            Isometry3::identity(),
        );
        let mut layer = RangeLayer::new("sonar", tf, "map", default_footprint());
        layer.on_map_changed(map.clone());

        let err = layer.handle(create_test_reading(stamp, 1.0)).unwrap_err();
        assert_eq!(err.kind(), "grid_out_of_bounds");
    }
}
